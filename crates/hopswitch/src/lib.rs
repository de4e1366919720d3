//! HopSwitch HTLC switch.
//!
//! Routes HTLCs between local channel links, tracks them as circuits,
//! fans revealed preimages out to every waiting HTLC and lets an external
//! hook take forwarding decisions.

pub mod adapters;
pub mod beacon;
pub mod error;
pub mod guard;
pub mod interceptor;
pub mod link;
pub mod switch;
pub mod traits;

pub use beacon::{Subscription, WitnessBeacon};
pub use error::{BeaconError, ChannelError, DecodeError, InterceptError, LinkError, SwitchError};
pub use interceptor::{InterceptedForward, InterceptorHandle};
pub use link::{Link, LinkEvent, LinkHandle, LinkStatus};
pub use switch::{ForwardOutcome, Switch};
pub use traits::{ChannelStateMachine, OnionDecoder};
