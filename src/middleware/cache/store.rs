//! Cache persistence backends.
//!
//! The coordinator only needs `get` and `set` with a per-item expiration;
//! consistency is whatever the backend offers (last write wins).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use moka::future::Cache;
use moka::Expiry;

use super::entry::MAX_KEY_LEN;

/// Error talking to a cache store. "Not found" is not an error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store protocol error: {0}")]
    Protocol(String),
    #[error("store operation timed out")]
    Timeout,
    #[error("key exceeds {} bytes", MAX_KEY_LEN)]
    KeyTooLong,
    #[error("no store servers configured")]
    NoServers,
    #[error("item not stored")]
    NotStored,
}

/// An item to write.
#[derive(Debug, Clone)]
pub struct StoreItem {
    pub key: String,
    pub value: Vec<u8>,
    /// Seconds until the store purges the item; 0 means never.
    pub expiration_secs: u32,
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set(&self, item: StoreItem) -> Result<(), StoreError>;
}

/// Default byte budget of a [`MemoryStore`].
pub const DEFAULT_MEMORY_CAPACITY: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone)]
struct MemoryItem {
    value: Bytes,
    /// `None` keeps the item until it is evicted for space.
    ttl: Option<Duration>,
}

/// Expires every item after its own TTL, counted from its last write.
struct ItemExpiry;

impl Expiry<String, MemoryItem> for ItemExpiry {
    fn expire_after_create(&self, _key: &String, item: &MemoryItem, _created_at: Instant) -> Option<Duration> {
        item.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        item: &MemoryItem,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        item.ttl
    }
}

/// In-process store honouring per-item expiration, bounded by a byte budget.
#[derive(Clone)]
pub struct MemoryStore {
    items: Cache<String, MemoryItem>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.items.entry_count())
            .field("weighted_size", &self.items.weighted_size())
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CAPACITY)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store holding at most `capacity_bytes` of keys and values.
    pub fn with_capacity(capacity_bytes: u64) -> Self {
        let items = Cache::builder()
            .max_capacity(capacity_bytes)
            .weigher(|key: &String, item: &MemoryItem| {
                u32::try_from(key.len() + item.value.len()).unwrap_or(u32::MAX)
            })
            .expire_after(ItemExpiry)
            .build();
        Self { items }
    }

    /// Live entries, after applying pending expirations and evictions.
    pub async fn len(&self) -> u64 {
        self.items.run_pending_tasks().await;
        self.items.entry_count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.items.get(key).await.map(|item| item.value.to_vec()))
    }

    async fn set(&self, item: StoreItem) -> Result<(), StoreError> {
        if item.key.len() > MAX_KEY_LEN {
            return Err(StoreError::KeyTooLong);
        }
        let ttl = (item.expiration_secs > 0).then(|| Duration::from_secs(u64::from(item.expiration_secs)));
        self.items
            .insert(
                item.key,
                MemoryItem {
                    value: Bytes::from(item.value),
                    ttl,
                },
            )
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.get("k").await.unwrap().is_none());

        store
            .set(StoreItem { key: "k".into(), value: b"v".to_vec(), expiration_secs: 0 })
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some(&b"v"[..]));

        // Last write wins.
        store
            .set(StoreItem { key: "k".into(), value: b"w".to_vec(), expiration_secs: 60 })
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some(&b"w"[..]));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_memory_store_rejects_long_keys() {
        let store = MemoryStore::new();
        let item = StoreItem { key: "k".repeat(MAX_KEY_LEN + 1), value: Vec::new(), expiration_secs: 0 };
        assert!(matches!(store.set(item).await, Err(StoreError::KeyTooLong)));
    }

    #[tokio::test]
    async fn test_memory_store_purges_unread_expired_items() {
        let store = MemoryStore::new();
        for i in 0..1000 {
            store
                .set(StoreItem { key: format!("old-{i}"), value: b"x".to_vec(), expiration_secs: 1 })
                .await
                .unwrap();
        }
        store
            .set(StoreItem { key: "kept".into(), value: b"y".to_vec(), expiration_secs: 0 })
            .await
            .unwrap();

        // Past the expiry plus one timer-wheel tick.
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert!(store.get("old-7").await.unwrap().is_none());
        // Items never read again are gone too.
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("kept").await.unwrap().as_deref(), Some(&b"y"[..]));
    }

    #[tokio::test]
    async fn test_rewrite_restarts_expiry() {
        let store = MemoryStore::new();
        store
            .set(StoreItem { key: "k".into(), value: b"short".to_vec(), expiration_secs: 1 })
            .await
            .unwrap();
        store
            .set(StoreItem { key: "k".into(), value: b"long".to_vec(), expiration_secs: 60 })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some(&b"long"[..]));
    }

    #[tokio::test]
    async fn test_memory_store_evicts_over_capacity() {
        let store = MemoryStore::with_capacity(1024);
        for i in 0..64 {
            store
                .set(StoreItem { key: format!("k{i:02}"), value: vec![0; 100], expiration_secs: 0 })
                .await
                .unwrap();
        }
        store.items.run_pending_tasks().await;
        assert!(store.items.weighted_size() <= 1024);
        assert!(store.len().await < 64);
    }
}
