use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hopswitch_core::{FailureReason, Preimage, Resolution};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::error::ChannelError;
use crate::traits::ChannelStateMachine;

/// In-memory channel state machine.
///
/// Keeps a ledger of the resolution applied to each incoming HTLC index.
/// Re-applying the recorded resolution is acknowledged without effect, so
/// the counters only move once per HTLC. Useful for tests and for running
/// the node without a real channel backend.
pub struct MemoryChannel {
    /// HTLC index -> applied resolution.
    resolutions: DashMap<u64, Resolution>,
    bandwidth: AtomicU64,
    settled: AtomicUsize,
    failed: AtomicUsize,
    online: AtomicBool,
}

impl MemoryChannel {
    pub fn new(bandwidth_msat: u64) -> Self {
        Self {
            resolutions: DashMap::new(),
            bandwidth: AtomicU64::new(bandwidth_msat),
            settled: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            online: AtomicBool::new(true),
        }
    }

    pub fn set_bandwidth(&self, bandwidth_msat: u64) {
        self.bandwidth.store(bandwidth_msat, Ordering::SeqCst);
    }

    /// While offline every apply call fails with [`ChannelError::Unavailable`].
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Number of distinct HTLCs settled.
    pub fn settled_count(&self) -> usize {
        self.settled.load(Ordering::SeqCst)
    }

    /// Number of distinct HTLCs failed.
    pub fn failed_count(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn resolution(&self, htlc_index: u64) -> Option<Resolution> {
        self.resolutions.get(&htlc_index).map(|r| r.clone())
    }

    fn apply(&self, htlc_index: u64, resolution: Resolution) -> Result<(), ChannelError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(ChannelError::Unavailable("channel offline".into()));
        }
        match self.resolutions.entry(htlc_index) {
            Entry::Occupied(existing) if *existing.get() == resolution => {
                tracing::debug!(htlc_index, "resolution already applied");
                Ok(())
            }
            Entry::Occupied(_) => Err(ChannelError::ConflictingResolution(htlc_index)),
            Entry::Vacant(slot) => {
                let counter = if resolution.is_settle() {
                    &self.settled
                } else {
                    &self.failed
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(htlc_index, %resolution, "resolution applied");
                slot.insert(resolution);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ChannelStateMachine for MemoryChannel {
    async fn apply_settlement(
        &self,
        htlc_index: u64,
        preimage: Preimage,
    ) -> Result<(), ChannelError> {
        self.apply(htlc_index, Resolution::Settle(preimage))
    }

    async fn apply_failure(
        &self,
        htlc_index: u64,
        reason: &FailureReason,
    ) -> Result<(), ChannelError> {
        self.apply(htlc_index, Resolution::Fail(reason.clone()))
    }

    fn available_bandwidth(&self) -> u64 {
        self.bandwidth.load(Ordering::SeqCst)
    }
}
