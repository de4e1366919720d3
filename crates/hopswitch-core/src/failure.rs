use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;
use crate::types::Preimage;

/// Classified reason an HTLC was failed back to its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureCode {
    /// The forwarding instruction could not be decoded.
    InvalidOnionPayload,
    /// The instruction names a channel this node does not know.
    UnknownNextPeer,
    /// The outgoing channel is offline, restarting, full or short on capacity.
    TemporaryChannelFailure,
    /// The outgoing channel is closed for good.
    PermanentChannelFailure,
    /// Final hop: the payment hash or amount is not acceptable.
    IncorrectPaymentDetails,
    /// The interceptor did not decide in time, or went away.
    InterceptorTimeout,
    /// The interceptor explicitly failed the HTLC.
    InterceptorRejected,
    /// The circuit stayed unresolved past the staleness timeout.
    CircuitTimeout,
}

impl FailureCode {
    /// Whether the sender may retry the payment along another path.
    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            Self::TemporaryChannelFailure
                | Self::UnknownNextPeer
                | Self::InterceptorTimeout
                | Self::CircuitTimeout
        )
    }

    /// Numeric code used in persisted records.
    pub fn to_wire(&self) -> u16 {
        match self {
            Self::InvalidOnionPayload => 1,
            Self::UnknownNextPeer => 2,
            Self::TemporaryChannelFailure => 3,
            Self::PermanentChannelFailure => 4,
            Self::IncorrectPaymentDetails => 5,
            Self::InterceptorTimeout => 6,
            Self::InterceptorRejected => 7,
            Self::CircuitTimeout => 8,
        }
    }

    pub fn from_wire(value: u16) -> Result<Self, CoreError> {
        match value {
            1 => Ok(Self::InvalidOnionPayload),
            2 => Ok(Self::UnknownNextPeer),
            3 => Ok(Self::TemporaryChannelFailure),
            4 => Ok(Self::PermanentChannelFailure),
            5 => Ok(Self::IncorrectPaymentDetails),
            6 => Ok(Self::InterceptorTimeout),
            7 => Ok(Self::InterceptorRejected),
            8 => Ok(Self::CircuitTimeout),
            other => Err(CoreError::UnknownFailureCode(other)),
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidOnionPayload => write!(f, "InvalidOnionPayload"),
            Self::UnknownNextPeer => write!(f, "UnknownNextPeer"),
            Self::TemporaryChannelFailure => write!(f, "TemporaryChannelFailure"),
            Self::PermanentChannelFailure => write!(f, "PermanentChannelFailure"),
            Self::IncorrectPaymentDetails => write!(f, "IncorrectPaymentDetails"),
            Self::InterceptorTimeout => write!(f, "InterceptorTimeout"),
            Self::InterceptorRejected => write!(f, "InterceptorRejected"),
            Self::CircuitTimeout => write!(f, "CircuitTimeout"),
        }
    }
}

/// A failure code plus an optional human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub code: FailureCode,
    pub message: Option<String>,
}

impl FailureReason {
    pub fn new(code: FailureCode) -> Self {
        Self { code, message: None }
    }

    pub fn with_message(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }
}

impl From<FailureCode> for FailureReason {
    fn from(code: FailureCode) -> Self {
        Self::new(code)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {}", self.code, msg),
            None => write!(f, "{}", self.code),
        }
    }
}

/// Terminal outcome of an HTLC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    Settle(Preimage),
    Fail(FailureReason),
}

impl Resolution {
    pub fn is_settle(&self) -> bool {
        matches!(self, Self::Settle(_))
    }

    pub fn preimage(&self) -> Option<&Preimage> {
        match self {
            Self::Settle(p) => Some(p),
            Self::Fail(_) => None,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Settle(_) => write!(f, "settle"),
            Self::Fail(reason) => write!(f, "fail({})", reason),
        }
    }
}
