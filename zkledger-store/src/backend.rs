//! Ordered key/value backing store with a sled and an in-memory backend.

use std::{
    collections::BTreeMap,
    fs,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use sled::Db;
use tracing::{debug, info};

use crate::StoreError;

/// One row-level change inside a [`WriteBatch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// A set of changes applied atomically by [`RecordStore::apply`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put(key.into(), value.into()));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete(key.into()));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

/// Cloneable handle to the backing store shared by every persisted tree.
///
/// Clones share the backend and the read-only switch.
#[derive(Clone)]
pub struct RecordStore {
    backend: Arc<StoreBackend>,
    read_only: Arc<AtomicBool>,
}

enum StoreBackend {
    InMemory(Mutex<BTreeMap<Vec<u8>, Vec<u8>>>),
    Persistent(Db),
}

impl RecordStore {
    pub fn in_memory() -> Self {
        Self::with_backend(StoreBackend::InMemory(Mutex::new(BTreeMap::new())))
    }

    /// Open (or create) a sled database at `path`, creating parent directories.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|err| StoreError::Backend(sled::Error::Io(err)))?;
            }
        }
        let db = sled::open(path_ref)?;
        info!(path = %path_ref.display(), "opened record store");
        Ok(Self::with_backend(StoreBackend::Persistent(db)))
    }

    fn with_backend(backend: StoreBackend) -> Self {
        Self {
            backend: Arc::new(backend),
            read_only: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_persistent(&self) -> bool {
        matches!(&*self.backend, StoreBackend::Persistent(_))
    }

    /// Reject every write with [`StoreError::ReadOnly`] while set.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    fn ensure_writable(&self) -> Result<(), StoreError> {
        if self.is_read_only() {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }

    /// Insert a row that must not exist yet.
    ///
    /// Fails with [`StoreError::NoRowsAffected`] when `key` is already present,
    /// leaving the stored value untouched.
    pub fn insert_new(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.ensure_writable()?;
        match &*self.backend {
            StoreBackend::InMemory(rows) => {
                let mut guard = lock(rows)?;
                if guard.contains_key(key) {
                    return Err(StoreError::NoRowsAffected(describe(key)));
                }
                guard.insert(key.to_vec(), value.to_vec());
                Ok(())
            }
            StoreBackend::Persistent(db) => {
                let swapped = db.compare_and_swap(key, None::<&[u8]>, Some(value))?;
                if swapped.is_err() {
                    return Err(StoreError::NoRowsAffected(describe(key)));
                }
                db.flush()?;
                Ok(())
            }
        }
    }

    /// Apply every change in `batch` atomically and durably.
    ///
    /// Returns the number of rows written. An empty batch is reported as
    /// [`StoreError::NoRowsAffected`].
    pub fn apply(&self, batch: &WriteBatch) -> Result<usize, StoreError> {
        if batch.is_empty() {
            return Err(StoreError::NoRowsAffected("empty batch".into()));
        }
        self.ensure_writable()?;
        match &*self.backend {
            StoreBackend::InMemory(rows) => {
                let mut guard = lock(rows)?;
                for op in batch.ops() {
                    match op {
                        BatchOp::Put(key, value) => {
                            guard.insert(key.clone(), value.clone());
                        }
                        BatchOp::Delete(key) => {
                            guard.remove(key);
                        }
                    }
                }
            }
            StoreBackend::Persistent(db) => {
                let mut sled_batch = sled::Batch::default();
                for op in batch.ops() {
                    match op {
                        BatchOp::Put(key, value) => {
                            sled_batch.insert(key.as_slice(), value.as_slice())
                        }
                        BatchOp::Delete(key) => sled_batch.remove(key.as_slice()),
                    }
                }
                db.apply_batch(sled_batch)?;
                db.flush()?;
            }
        }
        debug!(rows = batch.len(), "applied batch");
        Ok(batch.len())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match &*self.backend {
            StoreBackend::InMemory(rows) => Ok(lock(rows)?.get(key).cloned()),
            StoreBackend::Persistent(db) => Ok(db.get(key)?.map(|value| value.to_vec())),
        }
    }

    /// All rows whose key starts with `prefix`, in ascending key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        match &*self.backend {
            StoreBackend::InMemory(rows) => Ok(lock(rows)?
                .range(prefix.to_vec()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()),
            StoreBackend::Persistent(db) => db
                .scan_prefix(prefix)
                .map(|row| -> Result<_, StoreError> {
                    let (key, value) = row?;
                    Ok((key.to_vec(), value.to_vec()))
                })
                .collect(),
        }
    }

    /// Delete every row under `prefix`, returning how many were removed.
    pub fn remove_prefix(&self, prefix: &[u8]) -> Result<usize, StoreError> {
        let keys: Vec<Vec<u8>> = self
            .scan_prefix(prefix)?
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        if keys.is_empty() {
            return Ok(0);
        }
        let mut batch = WriteBatch::new();
        for key in keys {
            batch.delete(key);
        }
        self.apply(&batch)
    }

}

fn lock(
    rows: &Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
) -> Result<MutexGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>>, StoreError> {
    rows.lock()
        .map_err(|_| StoreError::LockPoisoned("in-memory record store"))
}

fn describe(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(text) => format!("key '{text}' already exists"),
        Err(_) => format!("key 0x{} already exists", hex::encode(key)),
    }
}
