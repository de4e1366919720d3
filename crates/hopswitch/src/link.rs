//! The switch's view of one channel's HTLC traffic.

use hopswitch_core::{ChannelId, CircuitKey, FailureReason, IncomingHtlc, OutgoingHtlc, Preimage};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use crate::error::LinkError;
use crate::traits::ChannelStateMachine;

/// Observable state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Active,
    /// Peer disconnected; the link is expected back.
    Restarting,
    Closed,
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Restarting => write!(f, "restarting"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

enum LinkState {
    Active(mpsc::Sender<OutgoingHtlc>),
    Restarting,
    Closed,
}

/// Reports a link sends to the switch.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A peer offered us an HTLC.
    IncomingAdd(IncomingHtlc),
    /// An HTLC we offered downstream was settled.
    Settled {
        outgoing: CircuitKey,
        preimage: Preimage,
    },
    /// An HTLC we offered downstream was failed.
    Failed {
        outgoing: CircuitKey,
        reason: FailureReason,
    },
    LinkDown,
}

/// Switch-side half of a link.
pub struct Link {
    channel_id: ChannelId,
    channel: Arc<dyn ChannelStateMachine>,
    state: RwLock<LinkState>,
    next_index: AtomicU64,
}

impl Link {
    /// Create an active link and the receiving end of its mailbox.
    pub fn new(
        channel_id: ChannelId,
        channel: Arc<dyn ChannelStateMachine>,
        mailbox_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<OutgoingHtlc>) {
        let (tx, rx) = mpsc::channel(mailbox_capacity);
        let link = Arc::new(Self {
            channel_id,
            channel,
            state: RwLock::new(LinkState::Active(tx)),
            next_index: AtomicU64::new(0),
        });
        (link, rx)
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn channel(&self) -> &Arc<dyn ChannelStateMachine> {
        &self.channel
    }

    pub async fn status(&self) -> LinkStatus {
        match &*self.state.read().await {
            LinkState::Active(_) => LinkStatus::Active,
            LinkState::Restarting => LinkStatus::Restarting,
            LinkState::Closed => LinkStatus::Closed,
        }
    }

    pub async fn is_active(&self) -> bool {
        self.status().await == LinkStatus::Active
    }

    /// Reserve the next HTLC index on this channel.
    pub fn reserve_index(&self) -> u64 {
        self.next_index.fetch_add(1, Ordering::SeqCst)
    }

    /// Make sure future indexes start at `next` or later.
    pub fn advance_index_to(&self, next: u64) {
        self.next_index.fetch_max(next, Ordering::SeqCst);
    }

    pub fn next_index(&self) -> u64 {
        self.next_index.load(Ordering::SeqCst)
    }

    /// Check that the channel can carry `amount_msat`.
    pub fn check_bandwidth(&self, amount_msat: u64) -> Result<(), LinkError> {
        let available = self.channel.available_bandwidth();
        if available < amount_msat {
            return Err(LinkError::InsufficientBandwidth {
                chan_id: self.channel_id,
                available,
                required: amount_msat,
            });
        }
        Ok(())
    }

    /// Hand an HTLC to the link without waiting.
    pub async fn enqueue(&self, htlc: OutgoingHtlc) -> Result<(), LinkError> {
        match &*self.state.read().await {
            LinkState::Active(tx) => tx.try_send(htlc).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => LinkError::MailboxFull(self.channel_id),
                mpsc::error::TrySendError::Closed(_) => LinkError::Offline(self.channel_id),
            }),
            _ => Err(LinkError::Offline(self.channel_id)),
        }
    }

    pub async fn mark_restarting(&self) {
        let mut state = self.state.write().await;
        if matches!(*state, LinkState::Active(_)) {
            *state = LinkState::Restarting;
            tracing::info!(chan_id = %self.channel_id, "link restarting");
        }
    }

    pub async fn close(&self) {
        *self.state.write().await = LinkState::Closed;
        tracing::info!(chan_id = %self.channel_id, "link closed");
    }
}

/// Link-side half: the outgoing mailbox plus the report queue into the switch.
pub struct LinkHandle {
    channel_id: ChannelId,
    mailbox: mpsc::Receiver<OutgoingHtlc>,
    reports: mpsc::Sender<LinkEvent>,
}

impl LinkHandle {
    pub(crate) fn new(
        channel_id: ChannelId,
        mailbox: mpsc::Receiver<OutgoingHtlc>,
        reports: mpsc::Sender<LinkEvent>,
    ) -> Self {
        Self {
            channel_id,
            mailbox,
            reports,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// Next HTLC the switch wants offered to the peer.
    pub async fn next_outgoing(&mut self) -> Option<OutgoingHtlc> {
        self.mailbox.recv().await
    }

    pub fn try_next_outgoing(&mut self) -> Option<OutgoingHtlc> {
        self.mailbox.try_recv().ok()
    }

    /// Send a report, waiting while this link's report queue is full.
    pub async fn report(&self, event: LinkEvent) -> Result<(), LinkError> {
        self.reports
            .send(event)
            .await
            .map_err(|_| LinkError::Offline(self.channel_id))
    }

    pub async fn report_incoming(&self, htlc: IncomingHtlc) -> Result<(), LinkError> {
        self.report(LinkEvent::IncomingAdd(htlc)).await
    }

    pub async fn report_settled(
        &self,
        outgoing: CircuitKey,
        preimage: Preimage,
    ) -> Result<(), LinkError> {
        self.report(LinkEvent::Settled { outgoing, preimage }).await
    }

    pub async fn report_failed(
        &self,
        outgoing: CircuitKey,
        reason: FailureReason,
    ) -> Result<(), LinkError> {
        self.report(LinkEvent::Failed { outgoing, reason }).await
    }

    pub async fn report_down(&self) -> Result<(), LinkError> {
        self.report(LinkEvent::LinkDown).await
    }
}
