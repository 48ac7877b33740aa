//! Mutable collections of cache tags.
//!
//! A `CacheTagSet` is unique by (name, value): adding an identical pair is a
//! no-op, while several values under the same name are permitted (repeated
//! request parameters, multiple urls pointing at the same content).

use std::fmt;
use std::slice;

use crate::tag::CacheTag;

/// An insertion-ordered set of cache tags, unique by (name, value).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheTagSet {
    tags: Vec<CacheTag>,
}

impl CacheTagSet {
    /// Create an empty tag set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tag. Returns whether the set changed.
    pub fn add(&mut self, tag: CacheTag) -> bool {
        if self.tags.contains(&tag) {
            return false;
        }
        self.tags.push(tag);
        true
    }

    /// Insert a concrete tag built from `name` and `value`.
    pub fn add_tag(&mut self, name: impl Into<String>, value: impl Into<String>) -> bool {
        self.add(CacheTag::new(name, value))
    }

    /// Insert every tag from `tags`. Returns whether the set changed.
    pub fn add_all<I>(&mut self, tags: I) -> bool
    where
        I: IntoIterator<Item = CacheTag>,
    {
        let mut changed = false;
        for tag in tags {
            changed |= self.add(tag);
        }
        changed
    }

    /// Remove an exact (name, value) match. Absence is not an error.
    pub fn remove(&mut self, tag: &CacheTag) -> bool {
        match self.tags.iter().position(|t| t == tag) {
            Some(index) => {
                self.tags.remove(index);
                true
            }
            None => false,
        }
    }

    /// Remove the concrete tag built from `name` and `value`.
    pub fn remove_tag(&mut self, name: &str, value: &str) -> bool {
        self.remove(&CacheTag::new(name, value))
    }

    /// Remove every tag with the given name, regardless of value.
    pub fn remove_all_by_name(&mut self, name: &str) -> bool {
        let before = self.tags.len();
        self.tags.retain(|t| t.name() != name);
        self.tags.len() != before
    }

    /// Replace all tags of the given name with a single wildcard tag.
    ///
    /// Used to build invalidation queries matching any value of a dimension.
    pub fn exclude_tags_with(&mut self, name: &str) {
        self.remove_all_by_name(name);
        self.add(CacheTag::any(name));
    }

    /// Replace all tags of each of the given names with wildcard tags.
    pub fn exclude_tags_with_all<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            self.exclude_tags_with(name.as_ref());
        }
    }

    /// Keep only tags also present in `other`. Returns whether the set changed.
    pub fn retain_all(&mut self, other: &[CacheTag]) -> bool {
        let before = self.tags.len();
        self.tags.retain(|t| other.contains(t));
        self.tags.len() != before
    }

    /// Remove every tag present in `other`. Returns whether the set changed.
    pub fn remove_all(&mut self, other: &[CacheTag]) -> bool {
        let before = self.tags.len();
        self.tags.retain(|t| !other.contains(t));
        self.tags.len() != before
    }

    pub fn contains(&self, tag: &CacheTag) -> bool {
        self.tags.contains(tag)
    }

    pub fn contains_all<'a, I>(&self, tags: I) -> bool
    where
        I: IntoIterator<Item = &'a CacheTag>,
    {
        tags.into_iter().all(|t| self.contains(t))
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn clear(&mut self) {
        self.tags.clear();
    }

    pub fn iter(&self) -> slice::Iter<'_, CacheTag> {
        self.tags.iter()
    }

    pub fn as_slice(&self) -> &[CacheTag] {
        &self.tags
    }
}

impl fmt::Display for CacheTagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for tag in &self.tags {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{tag}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromIterator<CacheTag> for CacheTagSet {
    fn from_iter<I: IntoIterator<Item = CacheTag>>(iter: I) -> Self {
        let mut set = Self::new();
        set.add_all(iter);
        set
    }
}

impl IntoIterator for CacheTagSet {
    type Item = CacheTag;
    type IntoIter = std::vec::IntoIter<CacheTag>;

    fn into_iter(self) -> Self::IntoIter {
        self.tags.into_iter()
    }
}

impl<'a> IntoIterator for &'a CacheTagSet {
    type Item = &'a CacheTag;
    type IntoIter = slice::Iter<'a, CacheTag>;

    fn into_iter(self) -> Self::IntoIter {
        self.tags.iter()
    }
}
