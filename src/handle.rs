//! Cache handles.
//!
//! A handle is the identity of a cache entry: an opaque key derived
//! deterministically from the primary tag set, plus the validity windows the
//! entry was created with. Tags recorded during production ("supplementary"
//! tags, e.g. which resources were touched while rendering) accumulate on
//! the handle but never participate in identity.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::HandleError;
use crate::lock::mutex_lock;
use crate::tag::{self, CacheTag, TAG_SITE};
use crate::tag_set::CacheTagSet;

const SOURCE: &str = "handle";

/// Default expiration window for a cached response: one day.
pub const DEFAULT_EXPIRES: Duration = Duration::from_secs(24 * 60 * 60);

/// Default recheck window for a cached response: one hour.
pub const DEFAULT_RECHECK: Duration = Duration::from_secs(60 * 60);

/// Identity of a cache entry, derived from its primary tag set.
#[derive(Debug)]
pub struct CacheHandle {
    key: String,
    primary_tags: Vec<CacheTag>,
    created_at: Instant,
    expires_after: Duration,
    recheck_after: Duration,
    supplementary: Mutex<CacheTagSet>,
}

impl CacheHandle {
    /// Build a handle from a primary tag set.
    ///
    /// Fails when the set is empty, contains a wildcard tag, or contains
    /// duplicates under the tag ordering. These are programming defects in
    /// the collaborator assembling the tags, not recoverable conditions.
    pub fn from_primary_tags(
        tags: &CacheTagSet,
        expires_after: Duration,
        recheck_after: Duration,
    ) -> Result<Self, HandleError> {
        let key = derive_key(tags.as_slice())?;
        Ok(Self {
            key,
            primary_tags: tags.as_slice().to_vec(),
            created_at: Instant::now(),
            expires_after,
            recheck_after,
            supplementary: Mutex::new(CacheTagSet::new()),
        })
    }

    /// Build a handle with the default expiration and recheck windows.
    pub fn with_defaults(tags: &CacheTagSet) -> Result<Self, HandleError> {
        Self::from_primary_tags(tags, DEFAULT_EXPIRES, DEFAULT_RECHECK)
    }

    /// The deterministic key identifying this entry. Pure function of the
    /// primary tags, site excluded.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The tags supplied at construction, excluding everything recorded
    /// later during production.
    pub fn primary_tags(&self) -> &[CacheTag] {
        &self.primary_tags
    }

    /// Record a supplementary tag observed during production. Participates
    /// in invalidation lookups, never in identity.
    pub fn add_tag(&self, tag: CacheTag) {
        mutex_lock(&self.supplementary, SOURCE, "add_tag").add(tag);
    }

    /// Record a supplementary (name, value) pair observed during production.
    pub fn add_tag_value(&self, name: impl Into<String>, value: impl Into<String>) {
        self.add_tag(CacheTag::new(name, value));
    }

    /// The full tag set for invalidation matching: primary plus
    /// supplementary tags.
    pub fn tags(&self) -> CacheTagSet {
        let mut all: CacheTagSet = self.primary_tags.iter().cloned().collect();
        let supplementary = mutex_lock(&self.supplementary, SOURCE, "tags");
        for tag in supplementary.iter() {
            all.add(tag.clone());
        }
        all
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Hard validity window; past it the entry is stale and must be
    /// recomputed.
    pub fn expires_after(&self) -> Duration {
        self.expires_after
    }

    /// Advisory recheck window, exposed so callers can derive
    /// `Cache-Control`/`Expires` headers. Not enforced by the engine.
    pub fn recheck_after(&self) -> Duration {
        self.recheck_after
    }
}

impl PartialEq for CacheHandle {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for CacheHandle {}

impl Hash for CacheHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

/// Derive the cache key from a primary tag set.
///
/// Tags are sorted with the tag ordering and joined as `name=value; `. The
/// site tag is skipped: the cache keeps a separate namespace per site, so
/// encoding the site here would only mask cross-site collisions instead of
/// making them impossible.
fn derive_key(tags: &[CacheTag]) -> Result<String, HandleError> {
    if tags.is_empty() {
        return Err(HandleError::EmptyTagSet);
    }

    // Sorted insertion doubles as duplicate detection, as inserting into an
    // ordered set does for the original comparator.
    let mut sorted: Vec<&CacheTag> = Vec::with_capacity(tags.len());
    for tag in tags {
        if tag.is_wildcard() {
            return Err(HandleError::WildcardPrimaryTag(tag.name().to_string()));
        }
        let mut position = sorted.len();
        for (index, existing) in sorted.iter().enumerate() {
            match tag::compare(tag, existing)? {
                Ordering::Less => {
                    position = index;
                    break;
                }
                Ordering::Equal => {
                    return Err(HandleError::DuplicatePrimaryTag(tag.to_string()));
                }
                Ordering::Greater => {}
            }
        }
        sorted.insert(position, tag);
    }

    let mut key = String::new();
    for tag in sorted {
        if tag.name() == TAG_SITE {
            continue;
        }
        if !key.is_empty() {
            key.push_str("; ");
        }
        key.push_str(tag.name());
        key.push('=');
        key.push_str(tag.value().unwrap_or_default());
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> CacheTagSet {
        let mut set = CacheTagSet::new();
        for (name, value) in pairs {
            set.add_tag(*name, *value);
        }
        set
    }

    #[test]
    fn key_is_order_independent() {
        let h1 = CacheHandle::with_defaults(&tags(&[("a", "1"), ("b", "2"), ("c", "3")])).unwrap();
        let h2 = CacheHandle::with_defaults(&tags(&[("c", "3"), ("a", "1"), ("b", "2")])).unwrap();
        assert_eq!(h1.key(), h2.key());
        assert_eq!(h1, h2);
    }

    #[test]
    fn key_ignores_site_tag() {
        let h1 = CacheHandle::with_defaults(&tags(&[("a", "1"), ("site", "main")])).unwrap();
        let h2 = CacheHandle::with_defaults(&tags(&[("a", "1"), ("site", "other")])).unwrap();
        let h3 = CacheHandle::with_defaults(&tags(&[("a", "1")])).unwrap();
        assert_eq!(h1.key(), h2.key());
        assert_eq!(h1.key(), h3.key());
    }

    #[test]
    fn empty_tag_set_is_rejected() {
        let err = CacheHandle::with_defaults(&CacheTagSet::new()).unwrap_err();
        assert!(matches!(err, HandleError::EmptyTagSet));
    }

    #[test]
    fn wildcard_primary_tag_is_rejected() {
        let mut set = CacheTagSet::new();
        set.add(CacheTag::any("a"));
        let err = CacheHandle::with_defaults(&set).unwrap_err();
        assert!(matches!(err, HandleError::WildcardPrimaryTag(_)));
    }

    #[test]
    fn duplicate_primary_tags_are_rejected() {
        // CacheTagSet already deduplicates, so build the duplicate through a
        // second equal-but-distinct tag set union.
        let mut set = CacheTagSet::new();
        set.add_tag("a", "1");
        let mut doubled = set.clone();
        doubled.add_tag("b", "2");
        // Simulate a collaborator handing over a slice with duplicates.
        let raw = vec![CacheTag::new("a", "1"), CacheTag::new("a", "1")];
        let err = super::derive_key(&raw).unwrap_err();
        assert!(matches!(err, HandleError::DuplicatePrimaryTag(_)));
        // A well-formed set still works.
        assert!(CacheHandle::with_defaults(&doubled).is_ok());
    }

    #[test]
    fn supplementary_tags_do_not_change_identity() {
        let set = tags(&[("a", "1")]);
        let h1 = CacheHandle::with_defaults(&set).unwrap();
        let h2 = CacheHandle::with_defaults(&set).unwrap();
        h1.add_tag(CacheTag::resource("r1"));
        assert_eq!(h1, h2);
        assert_eq!(h1.primary_tags().len(), 1);
        assert!(h1.tags().contains(&CacheTag::resource("r1")));
        assert!(!h2.tags().contains(&CacheTag::resource("r1")));
    }

    #[test]
    fn default_windows() {
        let handle = CacheHandle::with_defaults(&tags(&[("a", "1")])).unwrap();
        assert_eq!(handle.expires_after(), DEFAULT_EXPIRES);
        assert_eq!(handle.recheck_after(), DEFAULT_RECHECK);
    }

    #[test]
    fn key_format_is_sorted_name_value_pairs() {
        let handle = CacheHandle::with_defaults(&tags(&[("a", "1")])).unwrap();
        assert_eq!(handle.key(), "a=1");
    }
}
