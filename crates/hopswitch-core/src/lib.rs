//! HopSwitch core types.
//!
//! Payment hashes and preimages, circuit keys, HTLC packets, failure
//! classification and switch policy configuration shared by every crate.

pub mod config;
pub mod error;
pub mod failure;
pub mod packet;
pub mod types;

pub use config::{InterceptTimeoutPolicy, SwitchConfig};
pub use error::CoreError;
pub use failure::{FailureCode, FailureReason, Resolution};
pub use packet::{ForwardingInstruction, IncomingHtlc, NextHop, OutgoingHtlc};
pub use types::{ChannelId, CircuitKey, PaymentHash, Preimage};
