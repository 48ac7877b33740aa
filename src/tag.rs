//! Cache tags.
//!
//! A tag is a name/value pair classifying cached content along one axis
//! (url, site, user, language, ...). A tag without a value is the wildcard:
//! it matches every concrete value of its name and is only legal in
//! invalidation and exclusion queries, never as part of a cache identity.

use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use thiserror::Error;

/// Tag name identifying the site a response belongs to.
pub const TAG_SITE: &str = "site";
/// Tag name identifying the rendered url path.
pub const TAG_URL: &str = "url";
/// Tag name identifying a content repository resource.
pub const TAG_RESOURCE: &str = "resource";
/// Tag name identifying the resolved language.
pub const TAG_LANGUAGE: &str = "language";
/// Tag name identifying the requesting user.
pub const TAG_USER: &str = "user";
/// Tag name identifying the module that produced the response.
pub const TAG_MODULE: &str = "module";
/// Tag name identifying the action that produced the response.
pub const TAG_ACTION: &str = "action";
/// Tag name carrying the request parameter count.
pub const TAG_PARAMETERS: &str = "parameters";

/// A name/value pair classifying cached content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheTag {
    name: String,
    /// `None` is the wildcard, matching any concrete value of `name`.
    value: Option<String>,
}

impl CacheTag {
    /// Create a concrete tag.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    /// Create a wildcard tag matching any value of `name`.
    pub fn any(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    pub fn site(value: impl Into<String>) -> Self {
        Self::new(TAG_SITE, value)
    }

    pub fn url(value: impl Into<String>) -> Self {
        Self::new(TAG_URL, value)
    }

    pub fn resource(value: impl Into<String>) -> Self {
        Self::new(TAG_RESOURCE, value)
    }

    pub fn language(value: impl Into<String>) -> Self {
        Self::new(TAG_LANGUAGE, value)
    }

    pub fn user(value: impl Into<String>) -> Self {
        Self::new(TAG_USER, value)
    }

    pub fn module(value: impl Into<String>) -> Self {
        Self::new(TAG_MODULE, value)
    }

    pub fn action(value: impl Into<String>) -> Self {
        Self::new(TAG_ACTION, value)
    }

    pub fn parameters(count: usize) -> Self {
        Self::new(TAG_PARAMETERS, count.to_string())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The concrete value, or `None` for a wildcard tag.
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn is_wildcard(&self) -> bool {
        self.value.is_none()
    }

    /// Whether this tag (possibly a wildcard) matches the given concrete tag.
    pub fn matches(&self, other: &CacheTag) -> bool {
        self.name == other.name && (self.value.is_none() || self.value == other.value)
    }
}

impl fmt::Display for CacheTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}", self.name, value),
            None => write!(f, "{}=*", self.name),
        }
    }
}

/// Two distinct tags agreed on every ordering key. This indicates a hash or
/// equality defect in the tag type and must not be silently coalesced.
#[derive(Debug, Error)]
#[error("tags incomparable ({0} and {1})")]
pub struct IncomparableTags(pub String, pub String);

/// Compute a hash for any hashable value.
pub(crate) fn hash_value<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Ordering used to sort and deduplicate primary tag sets.
///
/// Compares, in priority order: tag hash, name lexicographically, value
/// equality, value hash. Two distinct tags that survive every step are
/// reported as incomparable rather than merged.
pub(crate) fn compare(a: &CacheTag, b: &CacheTag) -> Result<Ordering, IncomparableTags> {
    let diff = hash_value(a).cmp(&hash_value(b));
    if diff != Ordering::Equal {
        return Ok(diff);
    }
    let diff = a.name().cmp(b.name());
    if diff != Ordering::Equal {
        return Ok(diff);
    }
    if a.value() == b.value() {
        return Ok(Ordering::Equal);
    }
    let diff = hash_value(&a.value()).cmp(&hash_value(&b.value()));
    if diff == Ordering::Equal {
        return Err(IncomparableTags(a.to_string(), b.to_string()));
    }
    Ok(diff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concrete_and_wildcard() {
        let tag = CacheTag::new("a", "x");
        assert_eq!(tag.name(), "a");
        assert_eq!(tag.value(), Some("x"));
        assert!(!tag.is_wildcard());

        let any = CacheTag::any("a");
        assert!(any.is_wildcard());
        assert_eq!(any.value(), None);
    }

    #[test]
    fn wildcard_matches_any_value() {
        let any = CacheTag::any("a");
        assert!(any.matches(&CacheTag::new("a", "x")));
        assert!(any.matches(&CacheTag::new("a", "y")));
        assert!(!any.matches(&CacheTag::new("b", "x")));
    }

    #[test]
    fn concrete_matches_exact_only() {
        let tag = CacheTag::new("a", "x");
        assert!(tag.matches(&CacheTag::new("a", "x")));
        assert!(!tag.matches(&CacheTag::new("a", "y")));
    }

    #[test]
    fn equality_is_name_and_value() {
        assert_eq!(CacheTag::new("a", "x"), CacheTag::new("a", "x"));
        assert_ne!(CacheTag::new("a", "x"), CacheTag::new("a", "y"));
        assert_ne!(CacheTag::new("a", "x"), CacheTag::any("a"));
    }

    #[test]
    fn compare_orders_equal_tags_as_equal() {
        let a = CacheTag::new("a", "x");
        let b = CacheTag::new("a", "x");
        assert_eq!(compare(&a, &b).unwrap(), Ordering::Equal);
    }

    #[test]
    fn compare_distinguishes_values() {
        let a = CacheTag::new("a", "x");
        let b = CacheTag::new("a", "y");
        assert_ne!(compare(&a, &b).unwrap(), Ordering::Equal);
    }

    #[test]
    fn compare_is_antisymmetric() {
        let a = CacheTag::new("a", "x");
        let b = CacheTag::new("b", "y");
        let ab = compare(&a, &b).unwrap();
        let ba = compare(&b, &a).unwrap();
        assert_eq!(ab, ba.reverse());
    }

    #[test]
    fn display_formats() {
        assert_eq!(CacheTag::new("url", "/a").to_string(), "url=/a");
        assert_eq!(CacheTag::any("url").to_string(), "url=*");
    }
}
