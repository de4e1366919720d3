//! HTLC packets exchanged between links and the switch.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::{ChannelId, CircuitKey, PaymentHash};

/// An HTLC offered to us by a peer on one of our channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingHtlc {
    /// Where the HTLC sits on the incoming channel.
    pub key: CircuitKey,
    pub payment_hash: PaymentHash,
    /// Amount offered to us, in millisatoshi.
    pub amount_msat: u64,
    /// Absolute block height at which the HTLC expires.
    pub cltv_expiry: u32,
    /// Opaque routing packet, decoded by the onion layer.
    pub onion: Bytes,
}

/// Where a decoded HTLC goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NextHop {
    /// This node is the final recipient.
    Exit,
    /// Forward over the given local channel.
    Channel(ChannelId),
}

/// Result of peeling one layer off an [`IncomingHtlc`]'s onion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingInstruction {
    pub next_hop: NextHop,
    pub amount_to_forward_msat: u64,
    pub outgoing_cltv: u32,
    /// Onion for the next hop; empty at the exit hop.
    pub payload: Bytes,
}

/// An HTLC the switch asks a link to offer to its peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingHtlc {
    /// Slot reserved on the outgoing channel.
    pub key: CircuitKey,
    /// The HTLC this one was forwarded from.
    pub incoming: CircuitKey,
    pub payment_hash: PaymentHash,
    pub amount_msat: u64,
    pub cltv_expiry: u32,
    pub payload: Bytes,
}
