//! Persistent ledger of in-flight HTLCs.
//!
//! Every circuit is written to the [`KvStore`] before it becomes visible in
//! the in-memory indexes, so an HTLC released downstream always has a record
//! to rediscover after a crash. The indexes are `DashMap`s: operations on
//! different circuits only contend when they hash to the same shard.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hopswitch_core::{ChannelId, CircuitKey, PaymentHash, Resolution};
use serde::Serialize;
use std::sync::Arc;

use crate::error::CircuitError;
use crate::kv::{Bucket, KvStore};
use crate::record::{decode_circuit, encode_circuit};

/// One hop of a payment through this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Circuit {
    pub incoming: CircuitKey,
    /// `None` when this node is the final hop.
    pub outgoing: Option<CircuitKey>,
    pub payment_hash: PaymentHash,
    pub incoming_amount_msat: u64,
    pub outgoing_amount_msat: u64,
    /// Forwarding payload handed to the next hop.
    pub payload: Bytes,
    pub created_at: DateTime<Utc>,
    /// Terminal outcome, once known but not yet delivered upstream.
    pub resolution: Option<Resolution>,
}

impl Circuit {
    pub fn is_exit(&self) -> bool {
        self.outgoing.is_none()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Parameters of [`CircuitMap::open_circuit`].
#[derive(Debug, Clone)]
pub struct NewCircuit {
    pub incoming: CircuitKey,
    pub outgoing: Option<CircuitKey>,
    pub payment_hash: PaymentHash,
    pub incoming_amount_msat: u64,
    pub outgoing_amount_msat: u64,
    pub payload: Bytes,
}

pub struct CircuitMap {
    store: Arc<dyn KvStore>,
    circuits: DashMap<CircuitKey, Circuit>,
    /// outgoing key -> incoming key
    outgoing_index: DashMap<CircuitKey, CircuitKey>,
}

impl CircuitMap {
    /// Open the map, loading every circuit persisted by a previous run.
    pub fn open(store: Arc<dyn KvStore>) -> Result<Self, CircuitError> {
        let circuits = DashMap::new();
        let outgoing_index = DashMap::new();

        for (key, value) in store.scan(Bucket::Circuits)? {
            let circuit = decode_circuit(&value)?;
            if circuit.incoming.to_bytes().as_slice() != key.as_slice() {
                tracing::warn!(incoming = %circuit.incoming, "circuit stored under a foreign key");
            }
            if let Some(out) = circuit.outgoing {
                outgoing_index.insert(out, circuit.incoming);
            }
            circuits.insert(circuit.incoming, circuit);
        }

        tracing::info!(
            backend = store.backend(),
            restored = circuits.len(),
            "circuit map opened"
        );

        Ok(Self {
            store,
            circuits,
            outgoing_index,
        })
    }

    /// Persist and index a new circuit.
    ///
    /// Fails with [`CircuitError::DuplicateIncoming`] while another circuit
    /// holds the same incoming key.
    pub fn open_circuit(&self, new: NewCircuit) -> Result<Circuit, CircuitError> {
        let slot = match self.circuits.entry(new.incoming) {
            Entry::Occupied(_) => return Err(CircuitError::DuplicateIncoming(new.incoming)),
            Entry::Vacant(slot) => slot,
        };
        let out_slot = match new.outgoing {
            Some(out) => match self.outgoing_index.entry(out) {
                Entry::Occupied(_) => return Err(CircuitError::DuplicateOutgoing(out)),
                Entry::Vacant(v) => Some(v),
            },
            None => None,
        };

        let circuit = Circuit {
            incoming: new.incoming,
            outgoing: new.outgoing,
            payment_hash: new.payment_hash,
            incoming_amount_msat: new.incoming_amount_msat,
            outgoing_amount_msat: new.outgoing_amount_msat,
            payload: new.payload,
            created_at: Utc::now(),
            resolution: None,
        };
        self.store.put(
            Bucket::Circuits,
            &circuit.incoming.to_bytes(),
            &encode_circuit(&circuit),
        )?;

        if let Some(v) = out_slot {
            v.insert(circuit.incoming);
        }
        slot.insert(circuit.clone());

        tracing::debug!(
            incoming = %circuit.incoming,
            outgoing = ?circuit.outgoing,
            payment_hash = %circuit.payment_hash,
            "circuit opened"
        );
        Ok(circuit)
    }

    pub fn lookup_by_incoming(&self, key: &CircuitKey) -> Option<Circuit> {
        self.circuits.get(key).map(|c| c.clone())
    }

    pub fn lookup_by_outgoing(&self, key: &CircuitKey) -> Option<Circuit> {
        let incoming = self.outgoing_index.get(key).map(|k| *k)?;
        self.lookup_by_incoming(&incoming)
    }

    /// Durably attach a terminal outcome to an open circuit.
    ///
    /// Recording the same resolution twice is a no-op; a different one is
    /// rejected so the first outcome always wins.
    pub fn record_resolution(
        &self,
        key: &CircuitKey,
        resolution: Resolution,
    ) -> Result<Circuit, CircuitError> {
        let mut entry = self
            .circuits
            .get_mut(key)
            .ok_or(CircuitError::NotFound(*key))?;

        match &entry.resolution {
            Some(existing) if *existing == resolution => return Ok(entry.clone()),
            Some(_) => return Err(CircuitError::ConflictingResolution(*key)),
            None => {}
        }

        let mut updated = entry.clone();
        updated.resolution = Some(resolution);
        self.store
            .put(Bucket::Circuits, &key.to_bytes(), &encode_circuit(&updated))?;
        *entry = updated.clone();

        tracing::debug!(incoming = %key, "circuit resolution recorded");
        Ok(updated)
    }

    /// Remove a circuit whose resolution has reached the incoming link.
    ///
    /// Returns `false` if the circuit was already gone, which makes replays
    /// after a restart harmless.
    pub fn close_circuit(
        &self,
        key: &CircuitKey,
        resolution: &Resolution,
    ) -> Result<bool, CircuitError> {
        let Some(circuit) = self.lookup_by_incoming(key) else {
            return Ok(false);
        };
        if let Some(existing) = &circuit.resolution {
            if existing != resolution {
                return Err(CircuitError::ConflictingResolution(*key));
            }
        }

        self.store.delete(Bucket::Circuits, &key.to_bytes())?;
        self.circuits.remove(key);
        if let Some(out) = circuit.outgoing {
            self.outgoing_index.remove(&out);
        }

        tracing::debug!(incoming = %key, "circuit closed");
        Ok(true)
    }

    /// Snapshot of every open circuit, ordered by incoming key.
    pub fn open_circuits(&self) -> Vec<Circuit> {
        let mut all: Vec<Circuit> = self.circuits.iter().map(|c| c.clone()).collect();
        all.sort_by_key(|c| c.incoming);
        all
    }

    /// Open circuits whose outgoing HTLC sits on `chan_id`.
    pub fn circuits_through(&self, chan_id: ChannelId) -> Vec<Circuit> {
        self.circuits
            .iter()
            .filter(|c| c.outgoing.map(|o| o.chan_id) == Some(chan_id))
            .map(|c| c.clone())
            .collect()
    }

    /// Open circuits whose incoming HTLC sits on `chan_id`.
    pub fn circuits_from(&self, chan_id: ChannelId) -> Vec<Circuit> {
        self.circuits
            .iter()
            .filter(|c| c.incoming.chan_id == chan_id)
            .map(|c| c.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuits.is_empty()
    }
}
