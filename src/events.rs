//! Invalidation event system.
//!
//! Content writes publish events describing what changed; the trigger drains
//! them and turns each into a tag-based invalidation. The queue decouples
//! the write path from cache maintenance.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::lock::mutex_lock;
use crate::tag_set::CacheTagSet;

const SOURCE: &str = "events";

/// Monotonic epoch for ordering events within this process.
pub type Epoch = u64;

/// One invalidation request: evict everything on `site` matching `tags`.
#[derive(Debug, Clone)]
pub struct InvalidationEvent {
    /// Unique identifier for idempotency (UUIDv4).
    pub id: Uuid,
    /// Monotonic epoch for ordering within this process.
    pub epoch: Epoch,
    /// Site whose namespace the invalidation applies to.
    pub site: String,
    /// Tag query; wildcard tags match every value of their name.
    pub tags: CacheTagSet,
    /// When the event was created.
    pub timestamp: OffsetDateTime,
}

impl InvalidationEvent {
    pub fn new(site: impl Into<String>, tags: CacheTagSet, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            site: site.into(),
            tags,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// In-memory invalidation queue.
///
/// Events are published by write operations and consumed by the trigger.
/// A mutex is enough here, contention on the write path is low.
pub struct EventQueue {
    queue: Mutex<VecDeque<InvalidationEvent>>,
    epoch_counter: AtomicU64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
        }
    }

    /// Get the next epoch number.
    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Publish an invalidation event to the queue.
    pub fn publish(&self, site: impl Into<String>, tags: CacheTagSet) {
        let event = InvalidationEvent::new(site, tags, self.next_epoch());
        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            site = %event.site,
            query = %event.tags,
            "Invalidation event enqueued"
        );
        mutex_lock(&self.queue, SOURCE, "publish").push_back(event);
    }

    /// Drain up to `limit` events, in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<InvalidationEvent> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        queue.drain(..count).collect()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        mutex_lock(&self.queue, SOURCE, "clear").clear();
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
