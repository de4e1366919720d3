//! Key-value backends behind the circuit map and witness cache.
//!
//! [`KvStore`] is the small interface the switch persists through. The
//! concrete backend is picked at startup: [`RocksStore`] for real nodes,
//! [`MemoryStore`] for tests and ephemeral runs.

use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use crate::error::StoreError;

/// Logical namespaces (column families).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Circuits,
    Witnesses,
}

impl Bucket {
    pub const ALL: [Bucket; 2] = [Bucket::Circuits, Bucket::Witnesses];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Circuits => "circuits",
            Self::Witnesses => "witnesses",
        }
    }
}

/// One mutation inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put {
        bucket: Bucket,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        bucket: Bucket,
        key: Vec<u8>,
    },
}

/// Transactional key-value storage.
///
/// A successful [`KvStore::write`] must be durable: the switch relies on it
/// before releasing an HTLC downstream.
pub trait KvStore: Send + Sync {
    /// Read a single value.
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Apply all operations atomically.
    fn write(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;

    /// Every entry of a bucket in key order.
    fn scan(&self, bucket: Bucket) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    /// Short backend name for logs and status output.
    fn backend(&self) -> &'static str;

    fn put(&self, bucket: Bucket, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.write(vec![BatchOp::Put {
            bucket,
            key: key.to_vec(),
            value: value.to_vec(),
        }])
    }

    fn delete(&self, bucket: Bucket, key: &[u8]) -> Result<(), StoreError> {
        self.write(vec![BatchOp::Delete {
            bucket,
            key: key.to_vec(),
        }])
    }
}

/// RocksDB-backed store, one column family per [`Bucket`].
pub struct RocksStore {
    db: DB,
    sync_writes: bool,
}

impl RocksStore {
    /// Open or create a RocksDB database at the given path with column families.
    pub fn open(path: &Path, sync_writes: bool) -> Result<Self, StoreError> {
        std::fs::create_dir_all(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors = Bucket::ALL
            .iter()
            .map(|b| ColumnFamilyDescriptor::new(b.name(), Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)?;
        tracing::info!(path = %path.display(), sync_writes, "rocksdb store opened");

        Ok(Self { db, sync_writes })
    }

    fn cf(&self, bucket: Bucket) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(bucket.name())
            .ok_or_else(|| StoreError::Backend(format!("column family '{}' not found", bucket.name())))
    }
}

impl KvStore for RocksStore {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(bucket)?;
        Ok(self.db.get_cf(&cf, key)?)
    }

    fn write(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                BatchOp::Put { bucket, key, value } => {
                    let cf = self.cf(bucket)?;
                    batch.put_cf(&cf, key, value);
                }
                BatchOp::Delete { bucket, key } => {
                    let cf = self.cf(bucket)?;
                    batch.delete_cf(&cf, key);
                }
            }
        }
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn scan(&self, bucket: Bucket) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let cf = self.cf(bucket)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn backend(&self) -> &'static str {
        "rocksdb"
    }
}

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-memory store with fault injection.
///
/// Data survives as long as the value does, so sharing one `Arc<MemoryStore>`
/// between two switch instances models a process restart.
#[derive(Default)]
pub struct MemoryStore {
    buckets: RwLock<HashMap<Bucket, Table>>,
    unavailable: AtomicBool,
    /// When set, writes succeed this many more times and then fail.
    write_budget: Mutex<Option<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Let `n` more writes succeed, then fail the rest. `None` lifts the limit.
    pub fn fail_writes_after(&self, n: Option<usize>) {
        if let Ok(mut budget) = self.write_budget.lock() {
            *budget = n;
        }
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }

    fn take_write_budget(&self) -> Result<(), StoreError> {
        let mut budget = self.write_budget.lock().map_err(|_| StoreError::Unavailable)?;
        match budget.as_mut() {
            Some(0) => Err(StoreError::Unavailable),
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl KvStore for MemoryStore {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_available()?;
        let buckets = self.buckets.read().map_err(|_| StoreError::Unavailable)?;
        Ok(buckets.get(&bucket).and_then(|t| t.get(key)).cloned())
    }

    fn write(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        self.check_available()?;
        self.take_write_budget()?;
        let mut buckets = self.buckets.write().map_err(|_| StoreError::Unavailable)?;
        for op in ops {
            match op {
                BatchOp::Put { bucket, key, value } => {
                    buckets.entry(bucket).or_default().insert(key, value);
                }
                BatchOp::Delete { bucket, key } => {
                    if let Some(table) = buckets.get_mut(&bucket) {
                        table.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn scan(&self, bucket: Bucket) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.check_available()?;
        let buckets = self.buckets.read().map_err(|_| StoreError::Unavailable)?;
        Ok(buckets
            .get(&bucket)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
