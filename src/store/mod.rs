//! Persistent key-value store
//!
//! The store is an in-memory map made crash-durable by a write-ahead
//! log and a periodic checkpoint:
//!
//! 1. Every mutation is appended (and fsynced) to the WAL *before* the
//!    in-memory map changes. An acknowledged mutation therefore
//!    survives `kill -9`.
//! 2. A checkpoint serializes the whole map to `data.pkl` atomically
//!    and then truncates the WAL, bounding recovery time.
//! 3. Startup loads the checkpoint (if any) and replays the WAL tail.
//!
//! One mutex guards both the map and the WAL handle. Holding it across
//! the append-then-mutate sequence totally orders mutations, makes
//! reads consistent with completed writes, and closes the window where
//! a write landing between a checkpoint snapshot and the WAL truncation
//! could be lost.

pub mod checkpoint;
pub mod log;
pub mod wal;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::Value;

use crate::error::{KvError, Result};
use crate::protocol::message::{Request, Response};
use self::log::WalRecord;
use self::wal::Wal;

/// Checkpoint file name within the data directory.
pub const CHECKPOINT_FILE: &str = "data.pkl";
/// WAL file name within the data directory.
pub const WAL_FILE: &str = "wal.log";

struct StoreInner {
    map: HashMap<String, Value>,
    wal: Wal,
}

impl StoreInner {
    fn apply(&mut self, record: WalRecord) {
        match record {
            WalRecord::Set { key, value } => {
                self.map.insert(key, value);
            }
            WalRecord::Delete { key } => {
                self.map.remove(&key);
            }
            WalRecord::BulkSet { items } => {
                for (key, value) in items {
                    self.map.insert(key, value);
                }
            }
        }
    }
}

/// The key-value store: map + WAL + checkpoint under one lock.
pub struct KvStore {
    data_dir: PathBuf,
    inner: Mutex<StoreInner>,
}

impl KvStore {
    /// Open the store in `data_dir`, creating the directory if needed,
    /// and run recovery: load the checkpoint, then replay the WAL.
    pub fn open(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;

        let wal_path = data_dir.join(WAL_FILE);
        let checkpoint_path = data_dir.join(CHECKPOINT_FILE);

        let map = checkpoint::load_snapshot(&checkpoint_path).unwrap_or_default();
        if !map.is_empty() {
            ::log::info!("Loaded {} keys from checkpoint", map.len());
        }

        let (records, clean_len) = Wal::recover(&wal_path)?;
        if !records.is_empty() {
            ::log::info!("Replaying {} operations from WAL", records.len());
        }
        match std::fs::metadata(&wal_path) {
            Ok(meta) if meta.len() > clean_len => {
                ::log::warn!(
                    "Trimming {} bytes of torn WAL tail",
                    meta.len() - clean_len
                );
                Wal::trim_to(&wal_path, clean_len)?;
            }
            _ => {}
        }

        let wal = Wal::open(wal_path)?;
        let mut inner = StoreInner { map, wal };
        for record in records {
            inner.apply(record);
        }

        ::log::info!("Recovery complete. Total keys: {}", inner.map.len());

        Ok(Self {
            data_dir,
            inner: Mutex::new(inner),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, StoreInner>> {
        self.inner
            .lock()
            .map_err(|_| KvError::Store("store lock poisoned".to_string()))
    }

    /// Set a key. Durable before it returns `Ok(true)`.
    pub fn set(&self, key: String, value: Value) -> Result<bool> {
        let mut inner = self.lock()?;
        inner.wal.append(&WalRecord::Set {
            key: key.clone(),
            value: value.clone(),
        })?;
        inner.map.insert(key, value);
        Ok(true)
    }

    /// Get the current value for a key, if any. Not logged.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        let inner = self.lock()?;
        Ok(inner.map.get(key).cloned())
    }

    /// Delete a key. Returns `Ok(false)` (and logs nothing) when the
    /// key is absent.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        if !inner.map.contains_key(key) {
            return Ok(false);
        }
        inner.wal.append(&WalRecord::Delete { key: key.to_string() })?;
        inner.map.remove(key);
        Ok(true)
    }

    /// Set every pair in `items` atomically: one WAL record covers the
    /// whole batch, so after any crash either all bindings are present
    /// or none are.
    pub fn bulk_set(&self, items: Vec<(String, Value)>) -> Result<bool> {
        let mut inner = self.lock()?;
        inner.wal.append(&WalRecord::BulkSet { items: items.clone() })?;
        for (key, value) in items {
            inner.map.insert(key, value);
        }
        Ok(true)
    }

    /// A copy of the whole map (for checkpointing or replication).
    pub fn snapshot(&self) -> Result<HashMap<String, Value>> {
        let inner = self.lock()?;
        Ok(inner.map.clone())
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.map.len()).unwrap_or(0)
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write a checkpoint and truncate the WAL.
    ///
    /// The lock is held across snapshot, rename, and truncation;
    /// mutations committed after this returns land in the fresh WAL.
    pub fn checkpoint(&self) -> Result<()> {
        let mut inner = self.lock()?;
        let checkpoint_path = self.data_dir.join(CHECKPOINT_FILE);
        checkpoint::write_snapshot(&checkpoint_path, &inner.map)?;
        inner.wal.truncate()?;
        ::log::info!("Checkpoint created with {} keys", inner.map.len());
        Ok(())
    }

    /// Execute one client data operation and build its reply.
    ///
    /// Control-plane requests do not belong to the store; a standalone
    /// node answers them the same way it answers any operation it does
    /// not recognize.
    pub fn execute(&self, request: &Request) -> Response {
        match request {
            Request::Set { key, value } => {
                match self.set(key.clone(), value.clone()) {
                    Ok(success) => Response::Success(success),
                    Err(e) => Response::Error(e.to_string()),
                }
            }
            Request::Get { key } => match self.get(key) {
                Ok(Some(value)) => Response::Value(value),
                Ok(None) => Response::NotFound,
                Err(e) => Response::Error(e.to_string()),
            },
            Request::Delete { key } => match self.delete(key) {
                Ok(success) => Response::Success(success),
                Err(e) => Response::Error(e.to_string()),
            },
            Request::BulkSet { items } => {
                let pairs = items
                    .iter()
                    .map(|item| (item.key.clone(), item.value.clone()))
                    .collect();
                match self.bulk_set(pairs) {
                    Ok(success) => Response::Success(success),
                    Err(e) => Response::Error(e.to_string()),
                }
            }
            _ => Response::Error("Unknown operation".to_string()),
        }
    }

    /// Graceful shutdown: final checkpoint, then close the WAL.
    pub fn shutdown(&self) -> Result<()> {
        ::log::info!("Shutting down store...");
        self.checkpoint()?;
        let mut inner = self.lock()?;
        inner.wal.close()?;
        ::log::info!("Store shutdown complete");
        Ok(())
    }
}
