//! Bidirectional tag index.
//!
//! Tracks which entry keys carry which tags so tag-based invalidation walks
//! the index instead of scanning the whole store. The index is a plain
//! struct; the owning site cache mutates it together with the entry map
//! under one lock, so the two are never observed out of step.

use std::collections::{HashMap, HashSet};

use crate::tag::CacheTag;
use crate::tag_set::CacheTagSet;

#[derive(Debug, Default)]
pub(crate) struct TagIndex {
    /// Concrete (name, value) tag to the keys carrying it.
    tag_to_keys: HashMap<CacheTag, HashSet<String>>,
    /// Tag name to the keys carrying any value of it, for wildcard queries.
    name_to_keys: HashMap<String, HashSet<String>>,
    /// Reverse mapping for cleanup on eviction.
    key_to_tags: HashMap<String, CacheTagSet>,
}

impl TagIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register an entry under every concrete tag it carries.
    pub(crate) fn register(&mut self, key: &str, tags: &CacheTagSet) {
        for tag in tags {
            if tag.is_wildcard() {
                // Wildcards are query syntax, not entry classification.
                continue;
            }
            self.tag_to_keys
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
            self.name_to_keys
                .entry(tag.name().to_string())
                .or_default()
                .insert(key.to_string());
        }
        self.key_to_tags.insert(key.to_string(), tags.clone());
    }

    /// Remove an entry from every tag it was registered under.
    pub(crate) fn unregister(&mut self, key: &str) {
        let Some(tags) = self.key_to_tags.remove(key) else {
            return;
        };
        for tag in &tags {
            if let Some(keys) = self.tag_to_keys.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_to_keys.remove(tag);
                }
            }
            if let Some(keys) = self.name_to_keys.get_mut(tag.name()) {
                keys.remove(key);
                if keys.is_empty() {
                    self.name_to_keys.remove(tag.name());
                }
            }
        }
    }

    /// Keys of all entries whose tag set intersects the query.
    ///
    /// A wildcard tag in the query matches every value of its name.
    pub(crate) fn matching(&self, query: &CacheTagSet) -> HashSet<String> {
        let mut matched = HashSet::new();
        for tag in query {
            let keys = if tag.is_wildcard() {
                self.name_to_keys.get(tag.name())
            } else {
                self.tag_to_keys.get(tag)
            };
            if let Some(keys) = keys {
                matched.extend(keys.iter().cloned());
            }
        }
        matched
    }
}
