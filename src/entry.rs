//! Stored cache entries.

use std::time::{Duration, Instant};

use bytes::Bytes;
use time::OffsetDateTime;

use crate::tag_set::CacheTagSet;

/// A completed, published cache entry: a whole response or a response part.
///
/// Response parts carry body bytes only; status, headers and the modification
/// date are meaningful for whole responses, which replay them to the client
/// on a hit.
#[derive(Debug, Clone)]
pub struct CachedEntry {
    key: String,
    tags: CacheTagSet,
    status: u16,
    headers: Vec<(String, String)>,
    modified: Option<OffsetDateTime>,
    body: Bytes,
    children: Vec<String>,
    stored_at: Instant,
    expires_after: Duration,
    recheck_after: Duration,
}

impl CachedEntry {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: String,
        tags: CacheTagSet,
        status: u16,
        headers: Vec<(String, String)>,
        modified: Option<OffsetDateTime>,
        body: Bytes,
        children: Vec<String>,
        expires_after: Duration,
        recheck_after: Duration,
    ) -> Self {
        Self {
            key,
            tags,
            status,
            headers,
            modified,
            body,
            children,
            stored_at: Instant::now(),
            expires_after,
            recheck_after,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Primary plus supplementary tags, used for invalidation matching.
    pub fn tags(&self) -> &CacheTagSet {
        &self.tags
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Content modification date recorded by the producer, if any.
    pub fn modified(&self) -> Option<OffsetDateTime> {
        self.modified
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Keys of nested response parts embedded in this entry's body.
    pub fn children(&self) -> &[String] {
        &self.children
    }

    pub fn age(&self) -> Duration {
        self.stored_at.elapsed()
    }

    /// Past the hard validity window; treated as a miss and evicted lazily.
    pub fn is_expired(&self) -> bool {
        self.age() > self.expires_after
    }

    /// Past the advisory recheck window but still servable. Surfaced to
    /// callers for HTTP header generation, never enforced by the engine.
    pub fn needs_recheck(&self) -> bool {
        !self.is_expired() && self.age() > self.recheck_after
    }
}
