//! Snapshot storage for documents.
//!
//! ```text
//! ┌─────────────┐  save_snapshot(op-log)   ┌──────────────────┐
//! │ SyncClient  │ ───────────────────────► │ SnapshotStore    │
//! │ Relay room  │ ◄─────────────────────── │  MemoryStore     │
//! └─────────────┘  load_snapshot → bytes?  │  RocksStore      │
//!                                          └──────────────────┘
//! ```
//!
//! Bytes are opaque here: normally `Replica::encode_state` output, but a
//! store seeded by an older tool may hold flattened UTF-8 text, which
//! `Replica::load` accepts as well.

#[cfg(feature = "rocksdb")]
pub mod rocks;

use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[cfg(feature = "rocksdb")]
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store lock poisoned")]
    Poisoned,
}

/// Load/save by document id.
pub trait SnapshotStore: Send + Sync {
    /// `Ok(None)` if nothing was ever saved for `doc_id`.
    fn load_snapshot(&self, doc_id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn save_snapshot(&self, doc_id: &str, bytes: &[u8]) -> Result<(), StoreError>;
}

/// In-process store, LZ4-compressed. Used by tests and the relay's
/// default configuration.
#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().map_or(0, |d| d.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compressed size of a stored snapshot.
    pub fn stored_size(&self, doc_id: &str) -> Option<usize> {
        self.docs.lock().ok()?.get(doc_id).map(Vec::len)
    }
}

impl SnapshotStore for MemoryStore {
    fn load_snapshot(&self, doc_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let docs = self.docs.lock().map_err(|_| StoreError::Poisoned)?;
        docs.get(doc_id)
            .map(|compressed| {
                lz4_flex::decompress_size_prepended(compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))
            })
            .transpose()
    }

    fn save_snapshot(&self, doc_id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let compressed = lz4_flex::compress_prepend_size(bytes);
        let mut docs = self.docs.lock().map_err(|_| StoreError::Poisoned)?;
        docs.insert(doc_id.to_string(), compressed);
        Ok(())
    }
}
