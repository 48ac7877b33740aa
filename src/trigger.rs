//! Cache trigger service.
//!
//! High-level API for publishing invalidation events from write operations
//! and applying them to the cache. Writers call a convenience method after
//! a successful mutation; the trigger queues the matching tag query and,
//! for interactive writes, consumes it immediately.

use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::engine::ResponseCache;
use crate::events::EventQueue;
use crate::tag::CacheTag;
use crate::tag_set::CacheTagSet;

const METRIC_CACHE_CONSUME_MS: &str = "fresco_cache_consume_ms";

/// Bridge between content writes and cache invalidation.
pub struct CacheTrigger {
    config: CacheConfig,
    queue: Arc<EventQueue>,
    cache: Arc<ResponseCache>,
}

impl CacheTrigger {
    pub fn new(config: CacheConfig, queue: Arc<EventQueue>, cache: Arc<ResponseCache>) -> Self {
        Self {
            config,
            queue,
            cache,
        }
    }

    /// Publish an invalidation event and optionally consume immediately.
    ///
    /// With `consume_now` false, events wait for the next explicit
    /// [`consume`](Self::consume), typically driven by a background task.
    pub fn trigger(&self, site: &str, tags: CacheTagSet, consume_now: bool) {
        if !self.config.enabled {
            debug!(site, "Cache trigger skipped, cache disabled");
            return;
        }
        self.queue.publish(site, tags);
        if consume_now {
            self.consume();
        }
    }

    /// Drain one bounded batch of events and apply each invalidation.
    ///
    /// Returns the number of entries evicted across the batch.
    pub fn consume(&self) -> usize {
        let start = Instant::now();
        let events = self.queue.drain(self.config.consume_batch_limit);
        if events.is_empty() {
            return 0;
        }
        let batch = events.len();
        let mut evicted = 0;
        for event in events {
            evicted += self.cache.invalidate(&event.tags, &event.site);
        }
        histogram!(METRIC_CACHE_CONSUME_MS).record(start.elapsed().as_millis() as f64);
        info!(batch, evicted, "Invalidation batch consumed");
        evicted
    }

    /// A resource was created, updated or deleted: evict everything whose
    /// rendering touched it.
    pub fn resource_modified(&self, site: &str, resource_id: &str) {
        let mut tags = CacheTagSet::new();
        tags.add(CacheTag::resource(resource_id));
        self.trigger(site, tags, true);
    }

    /// A url now resolves differently: evict every response cached under it.
    pub fn path_modified(&self, site: &str, path: &str) {
        let mut tags = CacheTagSet::new();
        tags.add(CacheTag::url(path));
        self.trigger(site, tags, true);
    }

    /// A module was reconfigured: evict every response it rendered,
    /// whatever the action.
    pub fn module_modified(&self, site: &str, module: &str) {
        let mut tags = CacheTagSet::new();
        tags.add(CacheTag::module(module));
        self.trigger(site, tags, true);
    }
}
