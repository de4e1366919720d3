use hopswitch_core::{ChannelId, CircuitKey, CoreError};
use hopswitch_store::{CircuitError, StoreError};

use crate::interceptor::InterceptedForward;

/// Switch-level errors.
///
/// Storage failures have no `From` conversion. They are raised only through
/// the switch's halt path.
#[derive(Debug, thiserror::Error)]
pub enum SwitchError {
    #[error("switch halted after a storage failure")]
    Halted,

    #[error("HTLC {0} is already in flight")]
    DuplicateHtlc(CircuitKey),

    #[error("preimage does not match the payment hash of circuit {0}")]
    PreimageMismatch(CircuitKey),

    #[error("link {link} reported HTLC {key}, which it does not carry")]
    ForeignHtlc { link: ChannelId, key: CircuitKey },

    #[error("an interceptor is already registered")]
    InterceptorRegistered,

    #[error("link {0} is already active")]
    LinkExists(ChannelId),

    #[error("invalid configuration: {0}")]
    Config(#[from] CoreError),

    #[error("storage failure: {0}")]
    Storage(StoreError),

    #[error(transparent)]
    Circuit(CircuitError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Errors raised by a link's queues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("unknown link {0}")]
    Unknown(ChannelId),

    #[error("link {0} is offline")]
    Offline(ChannelId),

    #[error("mailbox of link {0} is full")]
    MailboxFull(ChannelId),

    #[error("link {chan_id} has {available} msat available, {required} required")]
    InsufficientBandwidth {
        chan_id: ChannelId,
        available: u64,
        required: u64,
    },
}

/// Witness beacon errors.
#[derive(Debug, thiserror::Error)]
pub enum BeaconError {
    #[error("witness cache: {0}")]
    Cache(#[from] StoreError),
}

/// Errors returned by the terminal actions of an intercepted forward.
#[derive(Debug, thiserror::Error)]
pub enum InterceptError {
    #[error("intercepted HTLC {0} is no longer awaiting a decision")]
    Expired(CircuitKey),

    /// The preimage is for another hash. Carries the forward, still undecided.
    #[error("preimage does not match the payment hash of intercepted HTLC {}", .0.incoming_key())]
    PreimageMismatch(Box<InterceptedForward>),

    #[error("HTLC {0} waits on a witness and can only be settled")]
    SettleOnly(CircuitKey),

    #[error(transparent)]
    Witness(#[from] BeaconError),
}

impl InterceptError {
    /// Take back a forward refused by a mismatched settle.
    pub fn into_forward(self) -> Option<InterceptedForward> {
        match self {
            Self::PreimageMismatch(forward) => Some(*forward),
            _ => None,
        }
    }
}

/// Errors reported by a channel state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("HTLC {0} already carries a different resolution")]
    ConflictingResolution(u64),

    #[error("channel unavailable: {0}")]
    Unavailable(String),
}

/// Onion decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("hop payload truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("unknown hop tag {0}")]
    UnknownTag(u8),
}
