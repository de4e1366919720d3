//! External forwarding-decision hook.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hopswitch_core::{CircuitKey, FailureReason, ForwardingInstruction, IncomingHtlc, Preimage};
use std::sync::{Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};

use crate::beacon::WitnessBeacon;
use crate::error::{InterceptError, SwitchError};

/// Decision taken by the interceptor for one held HTLC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InterceptDecision {
    Settle(Preimage),
    Fail(FailureReason),
    Resume,
}

/// Who acts on the decision.
#[derive(Debug)]
enum Decider {
    /// The switch holds the HTLC and waits on this channel.
    Switch(oneshot::Sender<InterceptDecision>),
    /// A witness subscription waits on the beacon; only a settle means anything.
    Witness(WitnessBeacon),
}

/// A paused HTLC awaiting an external decision.
///
/// Every terminal action consumes the value, so at most one of them can ever
/// run. If the switch has already given up on the HTLC the action returns
/// [`InterceptError::Expired`].
///
/// Forwards offered by the witness beacon come from exit-hop HTLCs waiting
/// on a preimage. They can only be settled; the subscription keeps waiting
/// whatever the hook does with them.
#[derive(Debug)]
pub struct InterceptedForward {
    htlc: IncomingHtlc,
    instruction: ForwardingInstruction,
    extra: Bytes,
    deadline: Option<DateTime<Utc>>,
    decider: Decider,
}

impl InterceptedForward {
    pub(crate) fn new(
        htlc: IncomingHtlc,
        instruction: ForwardingInstruction,
        deadline: DateTime<Utc>,
    ) -> (Self, oneshot::Receiver<InterceptDecision>) {
        let (decision, rx) = oneshot::channel();
        (
            Self {
                htlc,
                instruction,
                extra: Bytes::new(),
                deadline: Some(deadline),
                decider: Decider::Switch(decision),
            },
            rx,
        )
    }

    pub(crate) fn witness(
        htlc: IncomingHtlc,
        instruction: ForwardingInstruction,
        extra: Bytes,
        beacon: WitnessBeacon,
    ) -> Self {
        Self {
            htlc,
            instruction,
            extra,
            deadline: None,
            decider: Decider::Witness(beacon),
        }
    }

    pub fn incoming_key(&self) -> CircuitKey {
        self.htlc.key
    }

    pub fn htlc(&self) -> &IncomingHtlc {
        &self.htlc
    }

    pub fn instruction(&self) -> &ForwardingInstruction {
        &self.instruction
    }

    /// Context attached by the subscriber of a witness forward. Empty for
    /// HTLCs held by the switch.
    pub fn extra(&self) -> &Bytes {
        &self.extra
    }

    /// When the switch stops waiting for a decision. `None` for witness
    /// forwards, which wait as long as their subscription.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    /// True if only [`settle`](Self::settle) applies.
    pub fn is_witness(&self) -> bool {
        matches!(self.decider, Decider::Witness(_))
    }

    /// Settle the HTLC locally with `preimage`.
    ///
    /// A preimage for another hash is refused and the forward is handed back
    /// inside [`InterceptError::PreimageMismatch`], still undecided.
    pub fn settle(self, preimage: Preimage) -> Result<(), InterceptError> {
        if !preimage.matches(&self.htlc.payment_hash) {
            tracing::warn!(incoming = %self.htlc.key, "interceptor settled with a wrong preimage");
            return Err(InterceptError::PreimageMismatch(Box::new(self)));
        }
        let key = self.htlc.key;
        match self.decider {
            Decider::Switch(decision) => decision
                .send(InterceptDecision::Settle(preimage))
                .map_err(|_| InterceptError::Expired(key)),
            Decider::Witness(beacon) => {
                beacon.add_preimages(&[preimage])?;
                tracing::info!(incoming = %key, "witness forward settled");
                Ok(())
            }
        }
    }

    pub fn fail(self, reason: FailureReason) -> Result<(), InterceptError> {
        self.decide(InterceptDecision::Fail(reason))
    }

    /// Let the switch forward the HTLC as if no interceptor were registered.
    pub fn resume(self) -> Result<(), InterceptError> {
        self.decide(InterceptDecision::Resume)
    }

    fn decide(self, decision: InterceptDecision) -> Result<(), InterceptError> {
        let key = self.htlc.key;
        match self.decider {
            Decider::Switch(tx) => tx.send(decision).map_err(|_| InterceptError::Expired(key)),
            Decider::Witness(_) => Err(InterceptError::SettleOnly(key)),
        }
    }
}

/// Receiving side of an interceptor registration.
///
/// Dropping the handle disconnects the hook, and every forward still
/// waiting on it is treated as timed out.
pub struct InterceptorHandle {
    rx: mpsc::Receiver<InterceptedForward>,
}

impl InterceptorHandle {
    pub async fn next(&mut self) -> Option<InterceptedForward> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<InterceptedForward> {
        self.rx.try_recv().ok()
    }
}

/// Holds the single active registration. Shared by the switch and the
/// witness beacon.
#[derive(Default)]
pub(crate) struct InterceptorSlot {
    tx: Mutex<Option<mpsc::Sender<InterceptedForward>>>,
}

impl InterceptorSlot {
    pub(crate) fn register(&self, capacity: usize) -> Result<InterceptorHandle, SwitchError> {
        let mut slot = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(SwitchError::InterceptorRegistered);
        }
        let (tx, rx) = mpsc::channel(capacity);
        *slot = Some(tx);
        tracing::info!("interceptor registered");
        Ok(InterceptorHandle { rx })
    }

    /// Sender of the live registration, if any.
    pub(crate) fn active(&self) -> Option<mpsc::Sender<InterceptedForward>> {
        let mut slot = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|tx| tx.is_closed()) {
            *slot = None;
            tracing::info!("interceptor disconnected");
        }
        slot.clone()
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.active().is_some()
    }
}
