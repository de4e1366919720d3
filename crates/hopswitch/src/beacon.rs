//! Preimage fan-out to every HTLC waiting on a payment hash.

use bytes::Bytes;
use dashmap::DashMap;
use hopswitch_core::{CircuitKey, ForwardingInstruction, IncomingHtlc, PaymentHash, Preimage};
use hopswitch_store::WitnessCache;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::BeaconError;
use crate::interceptor::{InterceptedForward, InterceptorSlot};

struct Waiter {
    circuit_key: CircuitKey,
    tx: mpsc::Sender<Preimage>,
}

type Registry = DashMap<PaymentHash, HashMap<Uuid, Waiter>>;

/// Witness beacon: the witness cache plus a registry of live subscriptions.
///
/// The registry is sharded by payment hash. Subscribing checks the cache and
/// registers inside the shard lock for that hash, and delivery drains the
/// registry under the same lock after the cache write, so a subscriber either
/// finds the preimage cached or is registered in time to be drained.
///
/// When wired to an interceptor, every subscription still waiting after
/// registration is offered to it as a settle-only [`InterceptedForward`].
#[derive(Clone)]
pub struct WitnessBeacon {
    cache: WitnessCache,
    registry: Arc<Registry>,
    interceptor: Option<Arc<InterceptorSlot>>,
}

impl fmt::Debug for WitnessBeacon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WitnessBeacon")
            .field("hashes", &self.registry.len())
            .field("intercepted", &self.interceptor.is_some())
            .finish_non_exhaustive()
    }
}

impl WitnessBeacon {
    pub fn new(cache: WitnessCache) -> Self {
        Self {
            cache,
            registry: Arc::new(DashMap::new()),
            interceptor: None,
        }
    }

    pub(crate) fn with_interceptor(cache: WitnessCache, interceptor: Arc<InterceptorSlot>) -> Self {
        Self {
            interceptor: Some(interceptor),
            ..Self::new(cache)
        }
    }

    pub fn lookup(&self, hash: &PaymentHash) -> Result<Option<Preimage>, BeaconError> {
        Ok(self.cache.lookup_preimage(hash)?)
    }

    /// Store preimages and release every subscription waiting on them.
    ///
    /// Returns the number of subscriptions notified.
    pub fn add_preimages(&self, preimages: &[Preimage]) -> Result<usize, BeaconError> {
        let added = self.cache.add_preimages(preimages)?;
        if !added.is_empty() {
            tracing::info!(added = added.len(), "preimages added to witness cache");
        }

        let mut notified = 0;
        for preimage in preimages {
            let hash = preimage.hash();
            let Some((_, waiters)) = self.registry.remove(&hash) else {
                continue;
            };
            for (id, waiter) in waiters {
                // Each waiter has its own one-slot channel, so this never blocks.
                if waiter.tx.try_send(*preimage).is_ok() {
                    notified += 1;
                }
                tracing::debug!(
                    subscription = %id,
                    circuit = %waiter.circuit_key,
                    payment_hash = %hash,
                    "preimage delivered"
                );
            }
        }
        Ok(notified)
    }

    /// Register interest in the preimage of `htlc`, tracked as `circuit_key`.
    ///
    /// A preimage that is already known is delivered right away. Otherwise
    /// the registered interceptor, if any, is offered the HTLC with
    /// `payload` and `extra` as context; settling that forward releases this
    /// subscription and every other one on the same hash.
    pub fn subscribe_updates(
        &self,
        circuit_key: CircuitKey,
        htlc: &IncomingHtlc,
        payload: ForwardingInstruction,
        extra: Bytes,
    ) -> Result<Subscription, BeaconError> {
        let id = Uuid::now_v7();
        let payment_hash = htlc.payment_hash;
        let (tx, rx) = mpsc::channel(1);

        let cached = {
            let mut waiters = self.registry.entry(payment_hash).or_default();
            let cached = self.cache.lookup_preimage(&payment_hash);
            if let Ok(None) = cached {
                waiters.insert(
                    id,
                    Waiter {
                        circuit_key,
                        tx: tx.clone(),
                    },
                );
            }
            cached
        };
        let cached = match cached {
            Ok(cached) => cached,
            Err(err) => {
                self.registry.remove_if(&payment_hash, |_, w| w.is_empty());
                return Err(err.into());
            }
        };

        let delivered = match cached {
            Some(preimage) => {
                let _ = tx.try_send(preimage);
                self.registry.remove_if(&payment_hash, |_, w| w.is_empty());
                true
            }
            None => false,
        };

        tracing::debug!(
            subscription = %id,
            circuit = %circuit_key,
            payment_hash = %payment_hash,
            delivered,
            "subscription registered"
        );

        if !delivered {
            self.offer_to_interceptor(circuit_key, htlc, &payload, &extra);
        }

        Ok(Subscription {
            id,
            payment_hash,
            circuit_key,
            payload,
            extra,
            rx,
            registry: Arc::clone(&self.registry),
            cancelled: false,
        })
    }

    fn offer_to_interceptor(
        &self,
        circuit_key: CircuitKey,
        htlc: &IncomingHtlc,
        payload: &ForwardingInstruction,
        extra: &Bytes,
    ) {
        let Some(hook) = self.interceptor.as_ref().and_then(|slot| slot.active()) else {
            return;
        };
        let htlc = IncomingHtlc {
            key: circuit_key,
            ..htlc.clone()
        };
        let forward = InterceptedForward::witness(htlc, payload.clone(), extra.clone(), self.clone());
        if hook.try_send(forward).is_err() {
            // The subscription keeps waiting either way.
            tracing::warn!(circuit = %circuit_key, "interceptor queue full, witness forward dropped");
        }
    }

    /// Live subscriptions for `hash`.
    pub fn subscriber_count(&self, hash: &PaymentHash) -> usize {
        self.registry.get(hash).map(|w| w.len()).unwrap_or(0)
    }

    /// Live subscriptions across all hashes.
    pub fn total_subscribers(&self) -> usize {
        self.registry.iter().map(|w| w.len()).sum()
    }
}

/// A pending interest in one preimage.
///
/// Dropping the subscription cancels it.
pub struct Subscription {
    id: Uuid,
    payment_hash: PaymentHash,
    circuit_key: CircuitKey,
    payload: ForwardingInstruction,
    extra: Bytes,
    rx: mpsc::Receiver<Preimage>,
    registry: Arc<Registry>,
    cancelled: bool,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn payment_hash(&self) -> PaymentHash {
        self.payment_hash
    }

    pub fn circuit_key(&self) -> CircuitKey {
        self.circuit_key
    }

    /// Decoded hop payload of the subscribed HTLC.
    pub fn payload(&self) -> &ForwardingInstruction {
        &self.payload
    }

    pub fn extra(&self) -> &Bytes {
        &self.extra
    }

    /// Wait for the preimage. Returns `None` once cancelled.
    pub async fn recv(&mut self) -> Option<Preimage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Preimage> {
        self.rx.try_recv().ok()
    }

    /// Deregister without delivering. Safe to call repeatedly or after delivery.
    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        if let Some(mut waiters) = self.registry.get_mut(&self.payment_hash) {
            waiters.remove(&self.id);
        }
        self.registry
            .remove_if(&self.payment_hash, |_, w| w.is_empty());
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
