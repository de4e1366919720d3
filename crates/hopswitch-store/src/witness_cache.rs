//! Durable store of revealed witnesses.

use hopswitch_core::{PaymentHash, Preimage};
use std::sync::Arc;

use crate::error::StoreError;
use crate::kv::{BatchOp, Bucket, KvStore};

/// Class of witness kept in the cache. Each class owns a key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WitnessType {
    /// Preimage of a SHA-256 payment hash.
    Sha256Preimage,
}

impl WitnessType {
    fn prefix(&self) -> u8 {
        match self {
            Self::Sha256Preimage => 0x01,
        }
    }

    fn key(&self, hash: &PaymentHash) -> Vec<u8> {
        let mut key = Vec::with_capacity(33);
        key.push(self.prefix());
        key.extend_from_slice(hash.as_bytes());
        key
    }
}

/// Append-only mapping from payment hash to preimage.
#[derive(Clone)]
pub struct WitnessCache {
    store: Arc<dyn KvStore>,
}

impl WitnessCache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Store preimages that are not yet known, in one atomic batch.
    ///
    /// Returns the preimages that were newly added. Entries already present
    /// are never overwritten.
    pub fn add_preimages(&self, preimages: &[Preimage]) -> Result<Vec<Preimage>, StoreError> {
        let ty = WitnessType::Sha256Preimage;
        let mut fresh = Vec::new();
        let mut ops = Vec::new();

        for preimage in preimages {
            let key = ty.key(&preimage.hash());
            if fresh.contains(preimage) || self.store.get(Bucket::Witnesses, &key)?.is_some() {
                continue;
            }
            ops.push(BatchOp::Put {
                bucket: Bucket::Witnesses,
                key,
                value: preimage.as_bytes().to_vec(),
            });
            fresh.push(*preimage);
        }

        if !ops.is_empty() {
            self.store.write(ops)?;
            tracing::debug!(added = fresh.len(), "witnesses stored");
        }
        Ok(fresh)
    }

    /// Look up the preimage for `hash`, if it has been revealed.
    pub fn lookup_preimage(&self, hash: &PaymentHash) -> Result<Option<Preimage>, StoreError> {
        let key = WitnessType::Sha256Preimage.key(hash);
        let Some(bytes) = self.store.get(Bucket::Witnesses, &key)? else {
            return Ok(None);
        };
        let preimage = Preimage::from_slice(&bytes)?;
        if !preimage.matches(hash) {
            return Err(StoreError::Corrupt(format!(
                "witness stored under {} does not hash to it",
                hash
            )));
        }
        Ok(Some(preimage))
    }

    /// Number of stored witnesses of the given type.
    pub fn count(&self, ty: WitnessType) -> Result<usize, StoreError> {
        Ok(self
            .store
            .scan(Bucket::Witnesses)?
            .iter()
            .filter(|(k, _)| k.first() == Some(&ty.prefix()))
            .count())
    }
}
