//! HTLC switch: dispatch, circuit bookkeeping and resolution.
//!
//! Every step that touches a circuit runs under the per-circuit guard for
//! its incoming key, so interceptor decisions, downstream resolutions and
//! timers race safely: the first resolution wins and later ones are no-ops.

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use hopswitch_core::{
    ChannelId, CircuitKey, FailureCode, FailureReason, ForwardingInstruction, IncomingHtlc,
    NextHop, OutgoingHtlc, PaymentHash, Preimage, Resolution, SwitchConfig,
};
use hopswitch_store::{Circuit, CircuitError, CircuitMap, KvStore, NewCircuit, StoreError, WitnessCache};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::beacon::{Subscription, WitnessBeacon};
use crate::error::{BeaconError, ChannelError, LinkError, SwitchError};
use crate::guard::{CircuitGuard, CircuitLocks};
use crate::interceptor::{InterceptDecision, InterceptedForward, InterceptorHandle, InterceptorSlot};
use crate::link::{Link, LinkEvent, LinkHandle, LinkStatus};
use crate::traits::{ChannelStateMachine, OnionDecoder};

/// What the switch did with an incoming HTLC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Circuit opened and HTLC offered on the outgoing link.
    Forwarded { outgoing: CircuitKey },
    /// Held until the interceptor decides.
    Intercepted,
    /// Final hop, waiting for the preimage.
    AwaitingPreimage,
    /// Final hop, settled from the witness cache right away.
    Settled,
    /// Failed back upstream.
    Failed(FailureReason),
    /// Matched a circuit restored from a previous run.
    Reattached,
}

struct SwitchInner {
    config: SwitchConfig,
    circuits: CircuitMap,
    beacon: WitnessBeacon,
    decoder: Arc<dyn OnionDecoder>,
    links: DashMap<ChannelId, Arc<Link>>,
    locks: Arc<CircuitLocks>,
    /// HTLCs paused for the interceptor. They own no circuit yet.
    held: DashMap<CircuitKey, IncomingHtlc>,
    /// Shared with the beacon, which offers exit-hop subscriptions to it.
    interceptor: Arc<InterceptorSlot>,
    /// Cancel handles of per-circuit timers. Dropping one stops its task.
    timers: DashMap<CircuitKey, oneshot::Sender<()>>,
    /// Circuits loaded from disk whose HTLC has not been re-presented.
    restored: DashSet<CircuitKey>,
    halted: AtomicBool,
    started_at: DateTime<Utc>,
}

/// The HTLC switch. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Switch {
    inner: Arc<SwitchInner>,
}

impl Switch {
    /// Open the switch over `store`, restoring circuits left by a previous run.
    pub async fn open(
        config: SwitchConfig,
        store: Arc<dyn KvStore>,
        decoder: Arc<dyn OnionDecoder>,
    ) -> Result<Self, SwitchError> {
        config.validate()?;
        let circuits = CircuitMap::open(Arc::clone(&store)).map_err(|err| match err {
            CircuitError::Store(e) => SwitchError::Storage(e),
            other => SwitchError::Circuit(other),
        })?;

        let interceptor = Arc::new(InterceptorSlot::default());
        let switch = Self {
            inner: Arc::new(SwitchInner {
                config,
                circuits,
                beacon: WitnessBeacon::with_interceptor(
                    WitnessCache::new(store),
                    Arc::clone(&interceptor),
                ),
                decoder,
                links: DashMap::new(),
                locks: Arc::new(CircuitLocks::new()),
                held: DashMap::new(),
                interceptor,
                timers: DashMap::new(),
                restored: DashSet::new(),
                halted: AtomicBool::new(false),
                started_at: Utc::now(),
            }),
        };

        let restored = switch.inner.circuits.open_circuits();
        for circuit in &restored {
            switch.inner.restored.insert(circuit.incoming);
            if !circuit.is_resolved() {
                switch.arm_timer(circuit, None);
            }
        }
        tracing::info!(restored = restored.len(), "switch started");
        Ok(switch)
    }

    // ----- links -----

    /// Attach a link and start its report pump.
    ///
    /// Re-adding a link that is restarting or closed replaces it and replays
    /// every resolution still owed to its incoming HTLCs.
    pub async fn add_link(
        &self,
        channel_id: ChannelId,
        channel: Arc<dyn ChannelStateMachine>,
    ) -> Result<LinkHandle, SwitchError> {
        let previous = self.link(channel_id);
        if let Some(prev) = &previous {
            if prev.is_active().await {
                return Err(SwitchError::LinkExists(channel_id));
            }
        }

        let (link, mailbox) = Link::new(channel_id, channel, self.inner.config.link_mailbox_capacity);
        if let Some(prev) = previous {
            link.advance_index_to(prev.next_index());
        }
        for circuit in self.inner.circuits.circuits_through(channel_id) {
            if let Some(out) = circuit.outgoing {
                link.advance_index_to(out.htlc_index + 1);
            }
        }
        self.inner.links.insert(channel_id, Arc::clone(&link));

        let (reports, report_rx) = mpsc::channel(self.inner.config.link_report_capacity);
        self.spawn_report_pump(Arc::clone(&link), report_rx);
        tracing::info!(chan_id = %channel_id, "link added");

        self.replay_resolutions(channel_id).await;
        Ok(LinkHandle::new(channel_id, mailbox, reports))
    }

    /// Take a link down for good and drop it from the switch.
    pub async fn remove_link(&self, channel_id: ChannelId) -> Result<usize, SwitchError> {
        let failed = self.link_down(channel_id).await?;
        if let Some((_, link)) = self.inner.links.remove(&channel_id) {
            link.close().await;
        }
        Ok(failed)
    }

    /// Fail back every unresolved circuit forwarded over `channel_id`.
    ///
    /// Subscriptions are left alone. Returns the number of circuits failed.
    pub async fn link_down(&self, channel_id: ChannelId) -> Result<usize, SwitchError> {
        if let Some(link) = self.link(channel_id) {
            link.mark_restarting().await;
        }

        let reason = FailureReason::with_message(
            FailureCode::TemporaryChannelFailure,
            format!("link {} down", channel_id),
        );
        let mut failed = 0;
        for circuit in self.inner.circuits.circuits_through(channel_id) {
            if circuit.is_resolved() {
                continue;
            }
            let outgoing = circuit.outgoing;
            match self
                .resolve_where(circuit.incoming, Resolution::Fail(reason.clone()), |c| {
                    c.outgoing == outgoing
                })
                .await
            {
                Ok(true) => failed += 1,
                Ok(false) => {}
                Err(err) if self.is_halted() => return Err(err),
                Err(err) => {
                    tracing::warn!(incoming = %circuit.incoming, error = %err, "failed to fail back circuit");
                }
            }
        }

        tracing::info!(chan_id = %channel_id, failed, "link down");
        Ok(failed)
    }

    pub async fn link_status(&self, channel_id: ChannelId) -> Option<LinkStatus> {
        match self.link(channel_id) {
            Some(link) => Some(link.status().await),
            None => None,
        }
    }

    fn link(&self, channel_id: ChannelId) -> Option<Arc<Link>> {
        self.inner.links.get(&channel_id).map(|l| Arc::clone(&l))
    }

    fn spawn_report_pump(&self, link: Arc<Link>, mut reports: mpsc::Receiver<LinkEvent>) {
        let switch = self.clone();
        tokio::spawn(async move {
            let channel_id = link.channel_id();
            while let Some(event) = reports.recv().await {
                if let Err(err) = switch.handle_link_event(channel_id, event).await {
                    tracing::warn!(chan_id = %channel_id, error = %err, "link report not processed");
                }
            }

            // Every handle is gone. Treat it as a disconnect unless the link
            // was replaced in the meantime.
            let current = switch
                .link(channel_id)
                .is_some_and(|l| Arc::ptr_eq(&l, &link));
            if current && link.is_active().await {
                if let Err(err) = switch.link_down(channel_id).await {
                    tracing::warn!(chan_id = %channel_id, error = %err, "link teardown incomplete");
                }
            }
        });
    }

    /// Process one report from the link on `channel_id`.
    ///
    /// A link only speaks for HTLCs on its own channel. Reports about any
    /// other channel are rejected without touching a circuit.
    async fn handle_link_event(&self, channel_id: ChannelId, event: LinkEvent) -> Result<(), SwitchError> {
        let foreign = |key: CircuitKey| {
            tracing::warn!(chan_id = %channel_id, htlc = %key, "link reported an HTLC it does not carry");
            SwitchError::ForeignHtlc { link: channel_id, key }
        };
        match event {
            LinkEvent::IncomingAdd(htlc) => {
                if htlc.key.chan_id != channel_id {
                    return Err(foreign(htlc.key));
                }
                self.forward_htlc(htlc).await.map(|_| ())
            }
            LinkEvent::Settled { outgoing, preimage } => {
                if outgoing.chan_id != channel_id {
                    return Err(foreign(outgoing));
                }
                self.settle_circuit(outgoing, preimage).await.map(|_| ())
            }
            LinkEvent::Failed { outgoing, reason } => {
                if outgoing.chan_id != channel_id {
                    return Err(foreign(outgoing));
                }
                self.fail_circuit(outgoing, reason).await.map(|_| ())
            }
            LinkEvent::LinkDown => self.link_down(channel_id).await.map(|_| ()),
        }
    }

    // ----- forwarding -----

    /// Take an incoming HTLC and forward, intercept or accept it.
    pub async fn forward_htlc(&self, htlc: IncomingHtlc) -> Result<ForwardOutcome, SwitchError> {
        self.ensure_running()?;
        let key = htlc.key;
        let guard = self.inner.locks.lock(key).await;

        if let Some(circuit) = self.inner.circuits.lookup_by_incoming(&key) {
            // A resolved circuit still open is owed a delivery.
            let restored = self.inner.restored.remove(&key).is_some();
            if restored || circuit.is_resolved() {
                return self.reattach(&guard, circuit, &htlc).await;
            }
            tracing::warn!(incoming = %key, "HTLC already has an open circuit");
            return Err(SwitchError::DuplicateHtlc(key));
        }
        if self.inner.held.contains_key(&key) {
            tracing::warn!(incoming = %key, "HTLC already held for the interceptor");
            return Err(SwitchError::DuplicateHtlc(key));
        }

        let instruction = match self.inner.decoder.decode(&htlc) {
            Ok(instruction) => instruction,
            Err(err) => {
                let reason =
                    FailureReason::with_message(FailureCode::InvalidOnionPayload, err.to_string());
                return self.fail_uncircuited(&htlc, reason).await;
            }
        };
        // Exit HTLCs reach the hook through their beacon subscription.
        if let NextHop::Channel(next) = instruction.next_hop {
            if let Err(reason) = self.check_next_hop(next, instruction.amount_to_forward_msat).await {
                return self.fail_uncircuited(&htlc, reason).await;
            }
            if let Some(hook) = self.inner.interceptor.active() {
                return self.intercept(hook, htlc, instruction).await;
            }
        }
        self.dispatch(&guard, htlc, instruction).await
    }

    async fn check_next_hop(&self, next: ChannelId, amount_msat: u64) -> Result<Arc<Link>, FailureReason> {
        let Some(link) = self.link(next) else {
            return Err(FailureReason::with_message(
                FailureCode::UnknownNextPeer,
                LinkError::Unknown(next).to_string(),
            ));
        };
        if !link.is_active().await {
            return Err(FailureReason::with_message(
                FailureCode::TemporaryChannelFailure,
                LinkError::Offline(next).to_string(),
            ));
        }
        link.check_bandwidth(amount_msat).map_err(|err| {
            FailureReason::with_message(FailureCode::TemporaryChannelFailure, err.to_string())
        })?;
        Ok(link)
    }

    async fn dispatch(
        &self,
        guard: &CircuitGuard,
        htlc: IncomingHtlc,
        instruction: ForwardingInstruction,
    ) -> Result<ForwardOutcome, SwitchError> {
        match instruction.next_hop {
            NextHop::Channel(next) => self.forward_to_link(guard, htlc, instruction, next).await,
            NextHop::Exit => self.accept_exit(guard, htlc, instruction).await,
        }
    }

    async fn forward_to_link(
        &self,
        guard: &CircuitGuard,
        htlc: IncomingHtlc,
        instruction: ForwardingInstruction,
        next: ChannelId,
    ) -> Result<ForwardOutcome, SwitchError> {
        let link = match self.check_next_hop(next, instruction.amount_to_forward_msat).await {
            Ok(link) => link,
            Err(reason) => return self.fail_uncircuited(&htlc, reason).await,
        };

        let outgoing = CircuitKey::new(next, link.reserve_index());
        let circuit = self
            .inner
            .circuits
            .open_circuit(NewCircuit {
                incoming: htlc.key,
                outgoing: Some(outgoing),
                payment_hash: htlc.payment_hash,
                incoming_amount_msat: htlc.amount_msat,
                outgoing_amount_msat: instruction.amount_to_forward_msat,
                payload: instruction.payload.clone(),
            })
            .map_err(|err| self.circuit_failure(err))?;
        self.arm_timer(&circuit, None);

        let add = OutgoingHtlc {
            key: outgoing,
            incoming: htlc.key,
            payment_hash: htlc.payment_hash,
            amount_msat: instruction.amount_to_forward_msat,
            cltv_expiry: instruction.outgoing_cltv,
            payload: instruction.payload,
        };
        if let Err(err) = link.enqueue(add).await {
            tracing::warn!(incoming = %htlc.key, outgoing = %outgoing, error = %err, "outgoing link refused HTLC");
            let reason =
                FailureReason::with_message(FailureCode::TemporaryChannelFailure, err.to_string());
            self.resolve_locked(guard, Resolution::Fail(reason.clone()))
                .await?;
            return Ok(ForwardOutcome::Failed(reason));
        }

        tracing::info!(
            incoming = %htlc.key,
            outgoing = %outgoing,
            amount_msat = circuit.outgoing_amount_msat,
            "HTLC forwarded"
        );
        Ok(ForwardOutcome::Forwarded { outgoing })
    }

    async fn accept_exit(
        &self,
        guard: &CircuitGuard,
        htlc: IncomingHtlc,
        instruction: ForwardingInstruction,
    ) -> Result<ForwardOutcome, SwitchError> {
        let circuit = self
            .inner
            .circuits
            .open_circuit(NewCircuit {
                incoming: htlc.key,
                outgoing: None,
                payment_hash: htlc.payment_hash,
                incoming_amount_msat: htlc.amount_msat,
                outgoing_amount_msat: instruction.amount_to_forward_msat,
                payload: instruction.payload,
            })
            .map_err(|err| self.circuit_failure(err))?;
        self.await_preimage(guard, circuit, &htlc).await
    }

    /// Subscribe an exit circuit to its preimage, settling at once if known.
    ///
    /// The subscription carries the decoded hop payload, with the raw onion
    /// as extra context for an interceptor.
    async fn await_preimage(
        &self,
        guard: &CircuitGuard,
        circuit: Circuit,
        htlc: &IncomingHtlc,
    ) -> Result<ForwardOutcome, SwitchError> {
        let payload = ForwardingInstruction {
            next_hop: NextHop::Exit,
            amount_to_forward_msat: circuit.outgoing_amount_msat,
            outgoing_cltv: htlc.cltv_expiry,
            payload: circuit.payload.clone(),
        };
        let mut subscription = self
            .inner
            .beacon
            .subscribe_updates(circuit.incoming, htlc, payload, htlc.onion.clone())
            .map_err(|err| self.beacon_failure(err))?;

        if let Some(preimage) = subscription.try_recv() {
            subscription.cancel();
            self.resolve_locked(guard, Resolution::Settle(preimage))
                .await?;
            return Ok(ForwardOutcome::Settled);
        }

        tracing::debug!(incoming = %circuit.incoming, payment_hash = %circuit.payment_hash, "awaiting preimage");
        self.arm_timer(&circuit, Some(subscription));
        Ok(ForwardOutcome::AwaitingPreimage)
    }

    async fn reattach(
        &self,
        guard: &CircuitGuard,
        circuit: Circuit,
        htlc: &IncomingHtlc,
    ) -> Result<ForwardOutcome, SwitchError> {
        tracing::info!(incoming = %circuit.incoming, "HTLC re-presented for an open circuit");
        if let Some(resolution) = circuit.resolution.clone() {
            self.resolve_locked(guard, resolution).await?;
            return Ok(ForwardOutcome::Reattached);
        }
        if circuit.is_exit() {
            return self.await_preimage(guard, circuit, htlc).await;
        }
        Ok(ForwardOutcome::Reattached)
    }

    /// Fail an HTLC that never got a circuit.
    async fn fail_uncircuited(
        &self,
        htlc: &IncomingHtlc,
        reason: FailureReason,
    ) -> Result<ForwardOutcome, SwitchError> {
        tracing::info!(incoming = %htlc.key, %reason, "HTLC failed back");
        self.apply_uncircuited(htlc.key, &Resolution::Fail(reason.clone()))
            .await?;
        Ok(ForwardOutcome::Failed(reason))
    }

    async fn apply_uncircuited(&self, key: CircuitKey, resolution: &Resolution) -> Result<(), SwitchError> {
        self.ensure_running()?;
        let link = self
            .link(key.chan_id)
            .ok_or(LinkError::Unknown(key.chan_id))?;
        apply(&link, key.htlc_index, resolution).await?;
        Ok(())
    }

    // ----- interception -----

    /// Register the interception hook. Only one may be active at a time.
    ///
    /// The hook receives every forwardable HTLC, and every exit HTLC whose
    /// preimage is not yet known as a settle-only forward.
    pub fn register_interceptor(&self) -> Result<InterceptorHandle, SwitchError> {
        self.inner
            .interceptor
            .register(self.inner.config.interceptor_queue_capacity)
    }

    pub fn has_interceptor(&self) -> bool {
        self.inner.interceptor.is_registered()
    }

    /// Number of HTLCs waiting on the interceptor.
    pub fn held_count(&self) -> usize {
        self.inner.held.len()
    }

    async fn intercept(
        &self,
        hook: mpsc::Sender<InterceptedForward>,
        htlc: IncomingHtlc,
        instruction: ForwardingInstruction,
    ) -> Result<ForwardOutcome, SwitchError> {
        let timeout = self.inner.config.intercept_timeout;
        let deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let (forward, decision) = InterceptedForward::new(htlc.clone(), instruction.clone(), deadline);

        // A full or closed hook queue counts as the hook never answering.
        if hook.try_send(forward).is_err() {
            return self.fail_uncircuited(&htlc, self.timeout_reason()).await;
        }

        self.inner.held.insert(htlc.key, htlc.clone());
        tracing::debug!(incoming = %htlc.key, "HTLC held for the interceptor");

        let switch = self.clone();
        tokio::spawn(async move {
            let decision = tokio::select! {
                biased;
                decision = decision => decision.ok(),
                _ = tokio::time::sleep(timeout) => None,
                _ = hook.closed() => None,
            };
            if let Err(err) = switch.apply_decision(htlc.clone(), instruction, decision).await {
                tracing::warn!(incoming = %htlc.key, error = %err, "intercepted HTLC not resolved");
            }
        });
        Ok(ForwardOutcome::Intercepted)
    }

    async fn apply_decision(
        &self,
        htlc: IncomingHtlc,
        instruction: ForwardingInstruction,
        decision: Option<InterceptDecision>,
    ) -> Result<(), SwitchError> {
        let guard = self.inner.locks.lock(htlc.key).await;
        self.inner.held.remove(&htlc.key);

        match decision {
            Some(InterceptDecision::Settle(preimage)) => {
                self.ensure_running()?;
                self.inner
                    .beacon
                    .add_preimages(&[preimage])
                    .map_err(|err| self.beacon_failure(err))?;
                self.apply_uncircuited(htlc.key, &Resolution::Settle(preimage))
                    .await?;
                tracing::info!(incoming = %htlc.key, "intercepted HTLC settled");
            }
            Some(InterceptDecision::Fail(reason)) => {
                self.fail_uncircuited(&htlc, reason).await?;
            }
            Some(InterceptDecision::Resume) => {
                tracing::debug!(incoming = %htlc.key, "intercepted HTLC resumed");
                self.dispatch(&guard, htlc, instruction).await?;
            }
            None => {
                tracing::info!(incoming = %htlc.key, "no interceptor decision before the deadline");
                self.fail_uncircuited(&htlc, self.timeout_reason()).await?;
            }
        }
        Ok(())
    }

    fn timeout_reason(&self) -> FailureReason {
        FailureReason::with_message(
            self.inner.config.intercept_timeout_policy.failure_code(),
            "interceptor did not decide in time",
        )
    }

    // ----- resolution -----

    /// Settle the circuit whose outgoing HTLC is `outgoing`.
    ///
    /// Returns `false` when no such circuit is open. A preimage that does not
    /// hash to the circuit's payment hash is rejected and the circuit stays
    /// open.
    pub async fn settle_circuit(&self, outgoing: CircuitKey, preimage: Preimage) -> Result<bool, SwitchError> {
        self.ensure_running()?;
        let Some(circuit) = self.inner.circuits.lookup_by_outgoing(&outgoing) else {
            tracing::debug!(outgoing = %outgoing, "settle for unknown circuit ignored");
            return Ok(false);
        };
        if !preimage.matches(&circuit.payment_hash) {
            tracing::warn!(outgoing = %outgoing, "downstream settled with a wrong preimage");
            return Err(SwitchError::PreimageMismatch(circuit.incoming));
        }
        self.resolve_where(circuit.incoming, Resolution::Settle(preimage), |c| {
            c.outgoing == Some(outgoing)
        })
        .await
    }

    /// Fail the circuit whose outgoing HTLC is `outgoing`.
    pub async fn fail_circuit(&self, outgoing: CircuitKey, reason: FailureReason) -> Result<bool, SwitchError> {
        self.ensure_running()?;
        let Some(circuit) = self.inner.circuits.lookup_by_outgoing(&outgoing) else {
            tracing::debug!(outgoing = %outgoing, "fail for unknown circuit ignored");
            return Ok(false);
        };
        self.resolve_where(circuit.incoming, Resolution::Fail(reason), |c| {
            c.outgoing == Some(outgoing)
        })
        .await
    }

    /// Resolve the circuit opened for `incoming`, delivering upstream and
    /// closing it.
    ///
    /// Idempotent: replaying the resolution a circuit already carries only
    /// finishes its delivery, and a closed circuit is left alone.
    pub async fn close_circuit(&self, incoming: CircuitKey, resolution: Resolution) -> Result<bool, SwitchError> {
        self.resolve_where(incoming, resolution, |_| true).await
    }

    /// Add preimages learned outside the switch, such as accepted invoices.
    pub fn add_preimages(&self, preimages: &[Preimage]) -> Result<usize, SwitchError> {
        self.ensure_running()?;
        self.inner
            .beacon
            .add_preimages(preimages)
            .map_err(|err| self.beacon_failure(err))
    }

    pub fn lookup_preimage(&self, hash: &PaymentHash) -> Result<Option<Preimage>, SwitchError> {
        self.inner
            .beacon
            .lookup(hash)
            .map_err(|err| match err {
                BeaconError::Cache(e) => SwitchError::Storage(e),
            })
    }

    async fn resolve_where(
        &self,
        incoming: CircuitKey,
        resolution: Resolution,
        matches: impl FnOnce(&Circuit) -> bool,
    ) -> Result<bool, SwitchError> {
        let guard = self.inner.locks.lock(incoming).await;
        match self.inner.circuits.lookup_by_incoming(&incoming) {
            Some(circuit) if matches(&circuit) => self.resolve_locked(&guard, resolution).await,
            _ => Ok(false),
        }
    }

    /// Record, deliver and close. Caller holds the circuit's guard.
    async fn resolve_locked(&self, guard: &CircuitGuard, resolution: Resolution) -> Result<bool, SwitchError> {
        self.ensure_running()?;
        let key = guard.key();
        let Some(circuit) = self.inner.circuits.lookup_by_incoming(&key) else {
            return Ok(false);
        };

        match &circuit.resolution {
            Some(existing) if *existing != resolution => {
                tracing::debug!(incoming = %key, "circuit already resolved, later outcome ignored");
                return Ok(false);
            }
            Some(_) => {}
            None => {
                if let Resolution::Settle(preimage) = &resolution {
                    if !preimage.matches(&circuit.payment_hash) {
                        return Err(SwitchError::PreimageMismatch(key));
                    }
                    self.inner
                        .beacon
                        .add_preimages(&[*preimage])
                        .map_err(|err| self.beacon_failure(err))?;
                }
                self.inner
                    .circuits
                    .record_resolution(&key, resolution.clone())
                    .map_err(|err| self.circuit_failure(err))?;
                tracing::info!(incoming = %key, outgoing = ?circuit.outgoing, %resolution, "circuit resolved");
            }
        }
        self.cancel_timer(&key);

        let Some(link) = self.link(key.chan_id) else {
            tracing::debug!(incoming = %key, "incoming link absent, resolution kept for replay");
            return Ok(true);
        };
        if !link.is_active().await {
            tracing::debug!(incoming = %key, "incoming link inactive, resolution kept for replay");
            return Ok(true);
        }

        if let Err(err) = apply(&link, key.htlc_index, &resolution).await {
            tracing::warn!(incoming = %key, error = %err, "resolution not applied, will retry");
            self.arm_redelivery(&circuit, resolution);
            return Err(err.into());
        }
        self.inner
            .circuits
            .close_circuit(&key, &resolution)
            .map_err(|err| self.circuit_failure(err))?;
        self.inner.restored.remove(&key);
        Ok(true)
    }

    async fn replay_resolutions(&self, channel_id: ChannelId) {
        for circuit in self.inner.circuits.circuits_from(channel_id) {
            let Some(resolution) = circuit.resolution.clone() else {
                continue;
            };
            let created_at = circuit.created_at;
            let result = self
                .resolve_where(circuit.incoming, resolution, |c| c.created_at == created_at)
                .await;
            match result {
                Ok(_) => tracing::debug!(incoming = %circuit.incoming, "resolution replayed"),
                Err(err) => {
                    tracing::warn!(incoming = %circuit.incoming, error = %err, "resolution replay failed")
                }
            }
        }
    }

    // ----- timers -----

    /// Fail the circuit once it outlives the staleness timeout. With a
    /// subscription, settle it instead if the preimage shows up first.
    fn arm_timer(&self, circuit: &Circuit, subscription: Option<Subscription>) {
        let elapsed = (Utc::now() - circuit.created_at).to_std().unwrap_or_default();
        let remaining = self.inner.config.circuit_timeout.saturating_sub(elapsed);
        let (cancel, mut cancelled) = oneshot::channel::<()>();
        self.inner.timers.insert(circuit.incoming, cancel);

        let switch = self.clone();
        let key = circuit.incoming;
        let created_at = circuit.created_at;
        tokio::spawn(async move {
            let expired = || {
                Resolution::Fail(FailureReason::with_message(
                    FailureCode::CircuitTimeout,
                    "circuit unresolved past its deadline",
                ))
            };
            let resolution = match subscription {
                Some(mut subscription) => tokio::select! {
                    preimage = subscription.recv() => match preimage {
                        Some(preimage) => Resolution::Settle(preimage),
                        None => return,
                    },
                    _ = tokio::time::sleep(remaining) => expired(),
                    _ = &mut cancelled => return,
                },
                None => tokio::select! {
                    _ = tokio::time::sleep(remaining) => expired(),
                    _ = &mut cancelled => return,
                },
            };

            let result = switch
                .resolve_where(key, resolution, |c| c.created_at == created_at)
                .await;
            if let Err(err) = result {
                tracing::warn!(incoming = %key, error = %err, "timed resolution failed");
            }
        });
    }

    /// Retry delivering a recorded resolution the incoming channel refused.
    ///
    /// Each failed attempt arms the next one, until the delivery goes
    /// through or the circuit is closed by a replay.
    fn arm_redelivery(&self, circuit: &Circuit, resolution: Resolution) {
        let (cancel, cancelled) = oneshot::channel::<()>();
        self.inner.timers.insert(circuit.incoming, cancel);

        let switch = self.clone();
        let key = circuit.incoming;
        let created_at = circuit.created_at;
        let interval = self.inner.config.redelivery_interval;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancelled => return,
            }
            let result = switch
                .resolve_where(key, resolution, |c| c.created_at == created_at)
                .await;
            if let Err(err) = result {
                tracing::debug!(incoming = %key, error = %err, "redelivery attempt failed");
            }
        });
    }

    fn cancel_timer(&self, key: &CircuitKey) {
        self.inner.timers.remove(key);
    }

    // ----- state -----

    /// Every open circuit, ordered by incoming key.
    pub fn open_circuits(&self) -> Vec<Circuit> {
        self.inner.circuits.open_circuits()
    }

    pub fn circuit_count(&self) -> usize {
        self.inner.circuits.len()
    }

    pub fn lookup_by_incoming(&self, key: &CircuitKey) -> Option<Circuit> {
        self.inner.circuits.lookup_by_incoming(key)
    }

    pub fn lookup_by_outgoing(&self, key: &CircuitKey) -> Option<Circuit> {
        self.inner.circuits.lookup_by_outgoing(key)
    }

    pub fn beacon(&self) -> &WitnessBeacon {
        &self.inner.beacon
    }

    pub fn config(&self) -> &SwitchConfig {
        &self.inner.config
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    /// True once a storage failure has stopped forwarding.
    pub fn is_halted(&self) -> bool {
        self.inner.halted.load(Ordering::SeqCst)
    }

    /// Stop timers and close links. Circuits stay on disk.
    pub async fn shutdown(&self) {
        self.inner.timers.clear();
        let links: Vec<Arc<Link>> = self.inner.links.iter().map(|l| Arc::clone(&l)).collect();
        for link in links {
            link.close().await;
        }
        tracing::info!(open_circuits = self.circuit_count(), "switch stopped");
    }

    fn ensure_running(&self) -> Result<(), SwitchError> {
        if self.is_halted() {
            return Err(SwitchError::Halted);
        }
        Ok(())
    }

    fn halt(&self, err: StoreError) -> SwitchError {
        if !self.inner.halted.swap(true, Ordering::SeqCst) {
            tracing::error!(error = %err, "storage failure, forwarding halted");
        }
        SwitchError::Storage(err)
    }

    fn circuit_failure(&self, err: CircuitError) -> SwitchError {
        match err {
            CircuitError::Store(e) => self.halt(e),
            other => SwitchError::Circuit(other),
        }
    }

    fn beacon_failure(&self, err: BeaconError) -> SwitchError {
        match err {
            BeaconError::Cache(e) => self.halt(e),
        }
    }
}

async fn apply(link: &Link, htlc_index: u64, resolution: &Resolution) -> Result<(), ChannelError> {
    match resolution {
        Resolution::Settle(preimage) => link.channel().apply_settlement(htlc_index, *preimage).await,
        Resolution::Fail(reason) => link.channel().apply_failure(htlc_index, reason).await,
    }
}
