//! # Persistence Boundary
//!
//! Trust lists and payment history live in whatever storage the host
//! platform provides — a keychain-backed file, an app database, anything
//! that can hold a JSON blob under a string key. The protocol core only
//! sees this trait.
//!
//! Persistence failures are explicitly non-fatal: a payment device with a
//! broken disk should still pay. Callers log the failure and continue with
//! in-memory state.

use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;

/// Errors surfaced by a persistence backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or refused the operation.
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    /// The stored blob could not be encoded or decoded.
    #[error("storage serialization error: {0}")]
    Serialization(String),
}

/// Key-value persistence for JSON-serializable blobs.
pub trait TrustStore: Send + Sync {
    /// Fetch the blob stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;

    /// Store `value` under `key`, replacing any previous blob.
    fn put(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError>;
}

/// An in-memory store for tests and the simulator. Nothing survives the
/// process, which is exactly the behavior the registry must tolerate from
/// a failing real backend anyway.
#[derive(Default)]
pub struct MemoryTrustStore {
    entries: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrustStore for MemoryTrustStore {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        self.entries.write().insert(key.to_string(), value.clone());
        Ok(())
    }
}
