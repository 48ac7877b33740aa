//! Cache configuration.
//!
//! Deserialized from the host application's configuration file, typically a
//! `[cache]` table.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_PER_SITE_LIMIT: usize = 200;
const DEFAULT_PRODUCER_WAIT_MS: u64 = 5000;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 100;

/// Response cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable the response cache. When disabled, callers always produce and
    /// nothing is stored.
    pub enabled: bool,
    /// Maximum cached responses and response parts per site.
    pub per_site_limit: usize,
    /// Upper bound (ms) a request waits for a concurrent producer of the
    /// same key before producing independently.
    pub producer_wait_ms: u64,
    /// Maximum invalidation events per consumption batch.
    pub consume_batch_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_site_limit: DEFAULT_PER_SITE_LIMIT,
            producer_wait_ms: DEFAULT_PRODUCER_WAIT_MS,
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
        }
    }
}

impl CacheConfig {
    /// Returns the per-site entry limit as NonZeroUsize, clamping to 1 if zero.
    pub fn per_site_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.per_site_limit).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the producer wait budget as a duration.
    pub fn producer_wait(&self) -> Duration {
        Duration::from_millis(self.producer_wait_ms)
    }
}
