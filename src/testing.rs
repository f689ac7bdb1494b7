//! Store wrappers used by the unit tests to force interleavings and faults.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;

use crate::ratelimit::KeyRateConfig;
use crate::store::{InMemoryStore, SharedStore, StoreEntry, StoreError, Version};

/// Rules with a single `gold` key allowing two requests per second, keyed by `x-api-key`.
pub(crate) fn gold_config() -> KeyRateConfig {
    KeyRateConfig::from_json(
        r#"{"limit_keys": [{"key": "gold", "query_per_second": 2}], "limit_by_header": "x-api-key"}"#,
    )
    .unwrap()
}

/// Yields to the scheduler between every read and write so concurrent tasks
/// interleave their get/set pairs.
#[derive(Debug, Default)]
pub(crate) struct YieldingStore {
    pub(crate) inner: InMemoryStore,
}

#[async_trait]
impl SharedStore for YieldingStore {
    async fn get(&self, key: &str) -> Result<Option<StoreEntry>, StoreError> {
        let entry = self.inner.get(key).await;
        tokio::task::yield_now().await;
        entry
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        expected: Option<Version>,
    ) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.inner.set(key, value, expected).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }
}

/// Rejects every conditional write to a token count, as if another worker
/// always won the race.
#[derive(Debug, Default)]
pub(crate) struct ConflictingStore {
    pub(crate) inner: InMemoryStore,
    pub(crate) rejected: AtomicU32,
}

impl ConflictingStore {
    pub(crate) fn rejected(&self) -> u32 {
        self.rejected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SharedStore for ConflictingStore {
    async fn get(&self, key: &str) -> Result<Option<StoreEntry>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        expected: Option<Version>,
    ) -> Result<(), StoreError> {
        if expected.is_some() && key.contains(":tokens:") {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::CasMismatch(key.to_string()));
        }
        self.inner.set(key, value, expected).await
    }
}

/// A store that cannot be reached.
#[derive(Debug, Default)]
pub(crate) struct UnavailableStore;

#[async_trait]
impl SharedStore for UnavailableStore {
    async fn get(&self, _key: &str) -> Result<Option<StoreEntry>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn set(
        &self,
        _key: &str,
        _value: &[u8],
        _expected: Option<Version>,
    ) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}

/// Behaves like an in-memory store until taken offline.
#[derive(Debug, Default)]
pub(crate) struct SwitchableStore {
    pub(crate) inner: InMemoryStore,
    offline: AtomicBool,
}

impl SwitchableStore {
    pub(crate) fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SharedStore for SwitchableStore {
    async fn get(&self, key: &str) -> Result<Option<StoreEntry>, StoreError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        expected: Option<Version>,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.inner.set(key, value, expected).await
    }
}

/// Fails every read and write of a token count once taken offline, while
/// refill markers stay reachable.
#[derive(Debug, Default)]
pub(crate) struct TokensOfflineStore {
    pub(crate) inner: InMemoryStore,
    offline: AtomicBool,
}

impl TokensOfflineStore {
    pub(crate) fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    fn check(&self, key: &str) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) && key.contains(":tokens:") {
            return Err(StoreError::Unavailable("token shard offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SharedStore for TokensOfflineStore {
    async fn get(&self, key: &str) -> Result<Option<StoreEntry>, StoreError> {
        self.check(key)?;
        self.inner.get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        expected: Option<Version>,
    ) -> Result<(), StoreError> {
        self.check(key)?;
        self.inner.set(key, value, expected).await
    }
}
