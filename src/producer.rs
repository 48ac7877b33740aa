//! Producer gate: at-most-one-producer-per-key.
//!
//! When several concurrent requests miss on the same cache key, only the
//! first may render it. The rest wait on the gate with a bounded budget;
//! once the producer publishes they re-check the store and hit. A waiter
//! that exhausts its budget falls through and produces independently, so
//! the gate can delay a request but never wedge it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::warn;

use crate::lock::mutex_lock;

const SOURCE: &str = "producer";

/// Outcome of a producer slot, observed by waiting requests.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum GateStatus {
    /// The producer is still rendering.
    Waiting,
    /// The producer published its entry; waiters should re-check the store.
    Done,
    /// The producer gave up; waiters compete for the slot again.
    Failed,
    /// The wait budget ran out before the producer finished.
    Timeout,
    /// The permit was dropped without being released.
    Dangling,
}

impl From<GateStatus> for u8 {
    fn from(status: GateStatus) -> u8 {
        match status {
            GateStatus::Waiting => 0,
            GateStatus::Done => 1,
            GateStatus::Failed => 2,
            GateStatus::Timeout => 3,
            GateStatus::Dangling => 4,
        }
    }
}

impl From<u8> for GateStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Waiting,
            1 => Self::Done,
            2 => Self::Failed,
            3 => Self::Timeout,
            _ => Self::Dangling,
        }
    }
}

#[derive(Debug)]
struct GateCore {
    started: Instant,
    permits: Semaphore,
    status: AtomicU8,
}

impl GateCore {
    fn new_arc() -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            permits: Semaphore::new(0),
            status: AtomicU8::new(GateStatus::Waiting.into()),
        })
    }

    fn status(&self) -> GateStatus {
        self.status.load(Ordering::SeqCst).into()
    }

    fn open(&self, status: GateStatus) {
        self.status.store(status.into(), Ordering::SeqCst);
        // A small positive number is enough; waiters re-check the store
        // anyway, there is no need to wake every one at once.
        self.permits.add_permits(10);
    }

    fn held(&self) -> bool {
        self.permits.available_permits() == 0
    }
}

/// Exclusive right to produce an entry for one key.
///
/// Must be handed back through [`ProducerGate::release`]; dropping it
/// unreleased marks the slot dangling so waiters compete again.
#[derive(Debug)]
pub(crate) struct WritePermit {
    core: Arc<GateCore>,
    released: bool,
}

impl WritePermit {
    pub(crate) fn age(&self) -> Duration {
        self.core.started.elapsed()
    }
}

impl Drop for WritePermit {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                target_module = SOURCE,
                result = "dangling",
                "Producer permit dropped without release"
            );
            self.core.open(GateStatus::Dangling);
        }
    }
}

/// Waiting side of the gate.
#[derive(Debug)]
pub(crate) struct ReadWait {
    core: Arc<GateCore>,
}

impl ReadWait {
    /// Wait for the producer to finish, up to `limit`.
    pub(crate) async fn wait(&self, limit: Duration) -> GateStatus {
        if !self.core.held() {
            return self.core.status();
        }
        match timeout(limit, self.core.permits.acquire()).await {
            // The permit goes straight back to the semaphore.
            Ok(Ok(_permit)) => self.core.status(),
            Ok(Err(_)) => GateStatus::Failed,
            Err(_) => GateStatus::Timeout,
        }
    }
}

/// Result of claiming a key.
#[derive(Debug)]
pub(crate) enum Claim {
    /// This request is the producer.
    Produce(WritePermit),
    /// Another request is producing; wait for it.
    Wait(ReadWait),
}

/// Per-key producer slots for one site.
#[derive(Debug, Default)]
pub(crate) struct ProducerGate {
    table: Mutex<HashMap<String, Arc<GateCore>>>,
}

impl ProducerGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Claim the producer slot for `key`, or a wait on its current holder.
    pub(crate) fn claim(&self, key: &str) -> Claim {
        let mut table = mutex_lock(&self.table, SOURCE, "claim");
        if let Some(core) = table.get(key) {
            if core.status() == GateStatus::Waiting {
                return Claim::Wait(ReadWait { core: core.clone() });
            }
            // A dangling slot is replaced by the next claimant.
        }
        let core = GateCore::new_arc();
        table.insert(key.to_string(), core.clone());
        Claim::Produce(WritePermit {
            core,
            released: false,
        })
    }

    /// Release a producer slot with the given outcome.
    pub(crate) fn release(&self, key: &str, mut permit: WritePermit, status: GateStatus) {
        let mut table = mutex_lock(&self.table, SOURCE, "release");
        if let Some(core) = table.get(key) {
            if Arc::ptr_eq(core, &permit.core) {
                table.remove(key);
            }
        }
        drop(table);
        permit.released = true;
        permit.core.open(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_claim_produces_second_waits() {
        let gate = ProducerGate::new();
        let first = gate.claim("k");
        assert!(matches!(first, Claim::Produce(_)));
        let second = gate.claim("k");
        assert!(matches!(second, Claim::Wait(_)));
    }

    #[test]
    fn release_frees_the_slot() {
        let gate = ProducerGate::new();
        let Claim::Produce(permit) = gate.claim("k") else {
            panic!("expected producer claim");
        };
        gate.release("k", permit, GateStatus::Done);
        assert!(matches!(gate.claim("k"), Claim::Produce(_)));
    }

    #[tokio::test]
    async fn waiter_wakes_on_release() {
        let gate = Arc::new(ProducerGate::new());
        let Claim::Produce(permit) = gate.claim("k") else {
            panic!("expected producer claim");
        };
        let Claim::Wait(wait) = gate.claim("k") else {
            panic!("expected wait claim");
        };

        let waiter = tokio::spawn(async move {
            wait.wait(Duration::from_secs(5)).await
        });
        gate.release("k", permit, GateStatus::Done);
        assert_eq!(waiter.await.unwrap(), GateStatus::Done);
    }

    #[tokio::test]
    async fn waiter_times_out_on_wedged_producer() {
        let gate = ProducerGate::new();
        let Claim::Produce(_permit) = gate.claim("k") else {
            panic!("expected producer claim");
        };
        let Claim::Wait(wait) = gate.claim("k") else {
            panic!("expected wait claim");
        };
        let status = wait.wait(Duration::from_millis(20)).await;
        assert_eq!(status, GateStatus::Timeout);
    }

    #[tokio::test]
    async fn dropped_permit_lets_next_claim_produce() {
        let gate = ProducerGate::new();
        {
            let Claim::Produce(_permit) = gate.claim("k") else {
                panic!("expected producer claim");
            };
            // dropped without release
        }
        assert!(matches!(gate.claim("k"), Claim::Produce(_)));
    }

    #[tokio::test]
    async fn failed_release_wakes_waiters_to_recompete() {
        let gate = Arc::new(ProducerGate::new());
        let Claim::Produce(permit) = gate.claim("k") else {
            panic!("expected producer claim");
        };
        let Claim::Wait(wait) = gate.claim("k") else {
            panic!("expected wait claim");
        };
        gate.release("k", permit, GateStatus::Failed);
        assert_eq!(wait.wait(Duration::from_secs(1)).await, GateStatus::Failed);
        // The slot was removed; the waiter can now claim it.
        assert!(matches!(gate.claim("k"), Claim::Produce(_)));
    }
}
