//! KvStore trait abstraction over the transient key/value cache.
//!
//! Drafts, field locks and typing markers all live here, and all of them
//! expire on their own through TTLs. Every operation is atomic for a single
//! key; callers never get multi-key transactions.
//!
//! Implementations:
//! - `InMemoryKv` - process-local store with lazy expiry (tests, daemon)

use crate::clock::{Clock, Timestamp};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Outcome of a set-if-absent write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetIfAbsent {
    /// The key did not exist and now holds the new value.
    Created,
    /// The key already existed; nothing was written.
    Existed,
}

/// Transient key/value store with per-key TTLs.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a value. Expired keys read as absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a value unconditionally (last writer wins).
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Write a value only if the key is absent.
    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<SetIfAbsent>;

    /// Write a value only if the current value equals `expected`
    /// (`None` = the key must be absent). Returns whether the write happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete a key only if it currently holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// List live keys starting with `prefix`.
    async fn keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remaining lifetime of a key, `None` if absent.
    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>>;

    /// Drop expired entries. Stores with native expiry have nothing to do.
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
}

struct Entry {
    value: Vec<u8>,
    expires_at: Timestamp,
}

impl Entry {
    fn is_live(&self, now: Timestamp) -> bool {
        now < self.expires_at
    }
}

/// In-memory store with lazy expiry against an injected clock.
pub struct InMemoryKv {
    entries: RwLock<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    /// When false every call fails with `StoreError::Unavailable`
    available: AtomicBool,
}

impl InMemoryKv {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of entries held, including expired ones not yet purged.
    pub fn raw_len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store disabled".into()))
        }
    }

    fn expiry(&self, ttl: Duration) -> Timestamp {
        self.clock.now_ms().saturating_add(ttl.as_millis() as u64)
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        let now = self.clock.now_ms();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.check_available()?;
        let expires_at = self.expiry(ttl);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<SetIfAbsent> {
        self.check_available()?;
        let now = self.clock.now_ms();
        let expires_at = self.expiry(ttl);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(SetIfAbsent::Existed);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(SetIfAbsent::Created)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool> {
        self.check_available()?;
        let now = self.clock.now_ms();
        let expires_at = self.expiry(ttl);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let current = entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.as_slice());
        if current != expected {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        let now = self.clock.now_ms();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        Ok(entries.remove(key).is_some_and(|e| e.is_live(now)))
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        self.check_available()?;
        let now = self.clock.now_ms();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let matches = entries
            .get(key)
            .is_some_and(|e| e.is_live(now) && e.value == expected);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_available()?;
        let now = self.clock.now_ms();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>> {
        self.check_available()?;
        let now = self.clock.now_ms();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| Duration::from_millis(e.expires_at - now)))
    }

    async fn purge_expired(&self) -> Result<usize> {
        self.check_available()?;
        let now = self.clock.now_ms();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (Arc<ManualClock>, InMemoryKv) {
        let clock = Arc::new(ManualClock::new(1_000));
        let kv = InMemoryKv::new(clock.clone());
        (clock, kv)
    }

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_set_and_get() {
        let (_clock, kv) = store();
        kv.set_with_ttl("a", b"1", TTL).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(kv.get("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let (clock, kv) = store();
        kv.set_with_ttl("a", b"1", TTL).await.unwrap();

        clock.advance(Duration::from_secs(9));
        assert_eq!(
            kv.ttl_remaining("a").await.unwrap(),
            Some(Duration::from_secs(1))
        );

        clock.advance(Duration::from_secs(1));
        assert_eq!(kv.get("a").await.unwrap(), None);
        assert_eq!(kv.ttl_remaining("a").await.unwrap(), None);
        assert!(kv.keys_by_prefix("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_if_absent() {
        let (clock, kv) = store();
        assert_eq!(
            kv.set_if_absent_with_ttl("k", b"first", TTL).await.unwrap(),
            SetIfAbsent::Created
        );
        assert_eq!(
            kv.set_if_absent_with_ttl("k", b"second", TTL).await.unwrap(),
            SetIfAbsent::Existed
        );
        assert_eq!(kv.get("k").await.unwrap(), Some(b"first".to_vec()));

        // An expired key counts as absent
        clock.advance(TTL);
        assert_eq!(
            kv.set_if_absent_with_ttl("k", b"third", TTL).await.unwrap(),
            SetIfAbsent::Created
        );
        assert_eq!(kv.get("k").await.unwrap(), Some(b"third".to_vec()));
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let (_clock, kv) = store();

        assert!(kv.compare_and_swap("k", None, b"v1", TTL).await.unwrap());
        assert!(!kv.compare_and_swap("k", None, b"v2", TTL).await.unwrap());
        assert!(!kv.compare_and_swap("k", Some(b"nope"), b"v2", TTL).await.unwrap());
        assert!(kv.compare_and_swap("k", Some(b"v1"), b"v2", TTL).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn test_delete_if_equals() {
        let (_clock, kv) = store();
        kv.set_with_ttl("k", b"mine", TTL).await.unwrap();

        assert!(!kv.delete_if_equals("k", b"theirs").await.unwrap());
        assert!(kv.get("k").await.unwrap().is_some());

        assert!(kv.delete_if_equals("k", b"mine").await.unwrap());
        assert!(kv.get("k").await.unwrap().is_none());
        assert!(!kv.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_by_prefix_sorted() {
        let (_clock, kv) = store();
        kv.set_with_ttl("lock:d1:title", b"x", TTL).await.unwrap();
        kv.set_with_ttl("lock:d1:genre", b"x", TTL).await.unwrap();
        kv.set_with_ttl("lock:d2:title", b"x", TTL).await.unwrap();

        let keys = kv.keys_by_prefix("lock:d1:").await.unwrap();
        assert_eq!(keys, vec!["lock:d1:genre", "lock:d1:title"]);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (clock, kv) = store();
        kv.set_with_ttl("short", b"x", Duration::from_secs(1)).await.unwrap();
        kv.set_with_ttl("long", b"x", Duration::from_secs(60)).await.unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(kv.raw_len(), 2);
        assert_eq!(kv.purge_expired().await.unwrap(), 1);
        assert_eq!(kv.raw_len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let (_clock, kv) = store();
        kv.set_available(false);
        assert!(matches!(
            kv.get("k").await,
            Err(StoreError::Unavailable(_))
        ));
        kv.set_available(true);
        assert!(kv.get("k").await.is_ok());
    }
}
