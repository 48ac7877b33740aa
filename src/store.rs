//! Per-site cache storage.
//!
//! Each site owns its own entry map and tag index; keys deliberately do not
//! encode the site, so separate namespaces are what make cross-site
//! collisions structurally impossible. Entry map, tag index and parent
//! links mutate together under one lock: no reader can observe an entry
//! published but unindexed.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};

use lru::LruCache;
use tracing::debug;

use crate::entry::CachedEntry;
use crate::index::TagIndex;
use crate::lock::{rw_read, rw_write};
use crate::producer::ProducerGate;
use crate::tag_set::CacheTagSet;

const SOURCE: &str = "store";

struct SiteState {
    entries: LruCache<String, Arc<CachedEntry>>,
    index: TagIndex,
    /// child key -> keys of entries embedding it.
    parents: HashMap<String, HashSet<String>>,
}

/// Cache storage for a single site.
pub(crate) struct SiteCache {
    state: RwLock<SiteState>,
    pub(crate) gate: ProducerGate,
}

impl SiteCache {
    pub(crate) fn new(limit: NonZeroUsize) -> Self {
        Self {
            state: RwLock::new(SiteState {
                entries: LruCache::new(limit),
                index: TagIndex::new(),
                parents: HashMap::new(),
            }),
            gate: ProducerGate::new(),
        }
    }

    /// Look up a fresh entry. An expired entry is evicted and reported as a
    /// miss; its ancestors stay, their bytes are still the ones they served.
    pub(crate) fn lookup(&self, key: &str) -> Option<Arc<CachedEntry>> {
        let mut state = rw_write(&self.state, SOURCE, "lookup");
        match state.entries.get(key) {
            Some(entry) if !entry.is_expired() => Some(entry.clone()),
            Some(_) => {
                unlink(&mut state, key);
                state.entries.pop(key);
                state.parents.remove(key);
                None
            }
            None => None,
        }
    }

    /// Publish a completed entry, replacing any previous entry for the key.
    pub(crate) fn store(&self, entry: CachedEntry) {
        let key = entry.key().to_string();
        let mut state = rw_write(&self.state, SOURCE, "store");

        // Replacing a key re-registers it; clean the old registration first.
        if state.entries.contains(&key) {
            unlink(&mut state, &key);
        }

        state.index.register(&key, entry.tags());
        for child in entry.children() {
            state
                .parents
                .entry(child.clone())
                .or_default()
                .insert(key.clone());
        }

        // Push returns the previous value when the key already existed; the
        // capacity cleanup only applies when a different key was dropped.
        if let Some((evicted_key, evicted)) = state.entries.push(key.clone(), Arc::new(entry)) {
            if evicted_key != key {
                // Capacity eviction drops the coldest entry. Its content is
                // still valid, so ancestors are left alone; only the index
                // and parent links are cleaned up.
                debug!(
                    target_module = SOURCE,
                    evicted = %evicted_key,
                    "Entry evicted by capacity limit"
                );
                unlink_evicted(&mut state, &evicted_key, &evicted);
            }
        }
    }

    /// Evict every entry whose tag set intersects the query, cascading to
    /// ancestors that embed an evicted entry. Returns the eviction count.
    pub(crate) fn evict_matching(&self, query: &CacheTagSet) -> usize {
        let mut state = rw_write(&self.state, SOURCE, "evict_matching");
        let seeds = state.index.matching(query);
        evict_cascade(&mut state, seeds)
    }

    /// Evict the entry with the given key, cascading to ancestors.
    pub(crate) fn evict_key(&self, key: &str) -> usize {
        let mut state = rw_write(&self.state, SOURCE, "evict_key");
        evict_cascade(&mut state, HashSet::from([key.to_string()]))
    }

    /// Touch entries matching the query, refreshing their LRU position.
    pub(crate) fn touch_matching(&self, query: &CacheTagSet) -> usize {
        let mut state = rw_write(&self.state, SOURCE, "touch_matching");
        let keys = state.index.matching(query);
        let mut touched = 0;
        for key in keys {
            if state.entries.get(&key).is_some() {
                touched += 1;
            }
        }
        touched
    }

    pub(crate) fn len(&self) -> usize {
        rw_read(&self.state, SOURCE, "len").entries.len()
    }

    pub(crate) fn clear(&self) {
        let mut state = rw_write(&self.state, SOURCE, "clear");
        state.entries.clear();
        state.index = TagIndex::new();
        state.parents.clear();
    }
}

/// Evict the seed keys and every ancestor embedding one of them.
fn evict_cascade(state: &mut SiteState, seeds: HashSet<String>) -> usize {
    let mut queue: Vec<String> = seeds.into_iter().collect();
    let mut evicted = 0;
    while let Some(key) = queue.pop() {
        if state.entries.pop(&key).is_none() {
            // Already gone (or never stored); ancestors were handled when
            // it was evicted.
            continue;
        }
        unlink(state, &key);
        if let Some(parents) = state.parents.remove(&key) {
            queue.extend(parents);
        }
        evicted += 1;
    }
    evicted
}

/// Remove index and parent-link registrations for a key whose entry is
/// still present in the map.
fn unlink(state: &mut SiteState, key: &str) {
    let children: Vec<String> = state
        .entries
        .peek(key)
        .map(|e| e.children().to_vec())
        .unwrap_or_default();
    state.index.unregister(key);
    for child in children {
        if let Some(parents) = state.parents.get_mut(&child) {
            parents.remove(key);
            if parents.is_empty() {
                state.parents.remove(&child);
            }
        }
    }
}

/// Same cleanup for an entry the map already dropped (capacity eviction
/// hands the entry back, but the registrations remain).
fn unlink_evicted(state: &mut SiteState, key: &str, entry: &CachedEntry) {
    state.index.unregister(key);
    // Parents keep serving; they only lose the link.
    state.parents.remove(key);
    for child in entry.children() {
        if let Some(parents) = state.parents.get_mut(child) {
            parents.remove(key);
            if parents.is_empty() {
                state.parents.remove(child);
            }
        }
    }
}
