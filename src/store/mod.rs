//! Shared, versioned key-value store used as the only coordination channel
//! between workers.
//!
//! Every worker talks to the same store through the [`SharedStore`] trait.
//! There is no lock and no atomic increment: writers read a value together
//! with its [`Version`] and write back conditionally, retrying when another
//! writer got there first.

mod memory;

pub use memory::InMemoryStore;

use async_trait::async_trait;
use thiserror::Error;

/// Opaque token identifying one write of a key.
///
/// Versions are only compared for equality; they carry no ordering meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version(u64);

impl Version {
    /// Wrap a raw store version.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw value as handed out by the store.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A value read from the store along with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    pub value: Vec<u8>,
    pub version: Version,
}

/// Errors returned by store operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The key was modified since the caller read it.
    #[error("compare-and-swap mismatch on key {0}")]
    CasMismatch(String),

    /// A key that should have been seeded is absent.
    #[error("key not found: {0}")]
    NotFound(String),

    /// The store could not be reached or failed the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The stored value does not have the expected encoding.
    #[error("corrupt value under key {key}: expected 8 bytes, found {len}")]
    Corrupt { key: String, len: usize },

    /// The store does not implement the requested operation.
    #[error("operation not supported by store: {0}")]
    Unsupported(&'static str),
}

/// Versioned key-value store shared by every worker.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read a key. Returns `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<StoreEntry>, StoreError>;

    /// Write a key.
    ///
    /// With `expected: Some(version)` the write succeeds only if the key still
    /// holds that version, otherwise [`StoreError::CasMismatch`] is returned.
    /// With `expected: None` the write is unconditional.
    async fn set(
        &self,
        key: &str,
        value: &[u8],
        expected: Option<Version>,
    ) -> Result<(), StoreError>;

    /// Remove a key. Stores without deletion keep the default.
    async fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("delete"))
    }
}
