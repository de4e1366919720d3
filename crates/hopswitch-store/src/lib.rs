//! HopSwitch persistence layer.
//!
//! Key-value backends, the circuit map and the witness cache.

pub mod circuit_map;
pub mod error;
pub mod kv;
pub mod record;
pub mod witness_cache;

pub use circuit_map::{Circuit, CircuitMap, NewCircuit};
pub use error::{CircuitError, StoreError};
pub use kv::{BatchOp, Bucket, KvStore, MemoryStore, RocksStore};
pub use witness_cache::{WitnessCache, WitnessType};
