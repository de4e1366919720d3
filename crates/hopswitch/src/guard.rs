//! Per-circuit exclusivity.

use dashmap::DashMap;
use hopswitch_core::CircuitKey;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Keyed async locks, one per incoming circuit key.
///
/// Operations on distinct keys never contend. Entries are dropped once no
/// task holds or waits on them.
#[derive(Default)]
pub struct CircuitLocks {
    locks: DashMap<CircuitKey, Arc<Mutex<()>>>,
}

impl CircuitLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(self: &Arc<Self>, key: CircuitKey) -> CircuitGuard {
        let mutex = self.locks.entry(key).or_default().clone();
        let guard = mutex.lock_owned().await;
        CircuitGuard {
            key,
            guard: Some(guard),
            locks: Arc::clone(self),
        }
    }

    /// Number of keys currently locked or awaited.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Held while a task owns a circuit.
pub struct CircuitGuard {
    key: CircuitKey,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<CircuitLocks>,
}

impl CircuitGuard {
    pub fn key(&self) -> CircuitKey {
        self.key
    }
}

impl Drop for CircuitGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold a clone of the mutex, so the entry survives for them.
        self.locks
            .locks
            .remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
    }
}
