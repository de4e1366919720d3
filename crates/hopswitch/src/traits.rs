use async_trait::async_trait;
use hopswitch_core::{FailureReason, ForwardingInstruction, IncomingHtlc, Preimage};

use crate::error::{ChannelError, DecodeError};

/// Commitment state machine of one channel.
///
/// The switch finalizes incoming HTLCs through this interface. Each call's
/// successful return is the acknowledgment that lets the switch close the
/// circuit. Implementations must treat re-applying the resolution an index
/// already carries as an acknowledged no-op, since a resolution may be
/// replayed after a restart.
#[async_trait]
pub trait ChannelStateMachine: Send + Sync {
    /// Settle the incoming HTLC at `htlc_index` with `preimage`.
    async fn apply_settlement(&self, htlc_index: u64, preimage: Preimage)
        -> Result<(), ChannelError>;

    /// Fail the incoming HTLC at `htlc_index` back to the peer.
    async fn apply_failure(&self, htlc_index: u64, reason: &FailureReason)
        -> Result<(), ChannelError>;

    /// Outbound capacity in millisatoshi.
    fn available_bandwidth(&self) -> u64;
}

/// Onion layer: peels one hop off an incoming HTLC.
pub trait OnionDecoder: Send + Sync {
    fn decode(&self, htlc: &IncomingHtlc) -> Result<ForwardingInstruction, DecodeError>;
}
