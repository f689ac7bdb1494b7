//! In-process implementation of [`SharedStore`].

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::{SharedStore, StoreEntry, StoreError, Version};

/// A versioned store held in memory and shared through an `Arc`.
///
/// Versions come from a single counter for the whole store, so a key that is
/// deleted and recreated never hands out a version an old reader still holds.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: DashMap<String, StoreEntry>,
    next_version: AtomicU64,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn bump_version(&self) -> Version {
        Version::new(self.next_version.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<StoreEntry>, StoreError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        expected: Option<Version>,
    ) -> Result<(), StoreError> {
        // The entry guard holds the shard lock, so the check and the write are atomic.
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if let Some(expected) = expected {
                    if occupied.get().version != expected {
                        trace!(key, "version mismatch");
                        return Err(StoreError::CasMismatch(key.to_string()));
                    }
                }
                let version = self.bump_version();
                occupied.insert(StoreEntry {
                    value: value.to_vec(),
                    version,
                });
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Err(StoreError::CasMismatch(key.to_string()));
                }
                let version = self.bump_version();
                vacant.insert(StoreEntry {
                    value: value.to_vec(),
                    version,
                });
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}
