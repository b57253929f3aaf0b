//! Snapshot Store Adapter: typed access to draft snapshots in the KvStore.
//!
//! Snapshots are stored as JSON. Reads keep the raw bytes so a later write
//! can compare-and-swap against exactly what was read.

use crate::draft::{DraftError, Result};
use crate::keys::{self, DRAFT_PREFIX};
use crate::snapshot::DraftSnapshot;
use crate::store::{KvStore, SetIfAbsent};
use std::sync::Arc;
use std::time::Duration;

/// A snapshot together with the bytes it was decoded from.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub snapshot: DraftSnapshot,
    raw: Vec<u8>,
}

impl StoredSnapshot {
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

pub struct SnapshotStore<S: KvStore> {
    kv: Arc<S>,
    ttl: Duration,
}

impl<S: KvStore> SnapshotStore<S> {
    pub fn new(kv: Arc<S>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    pub async fn get(
        &self,
        owner_user_id: &str,
        document_id: &str,
    ) -> Result<Option<StoredSnapshot>> {
        let key = keys::draft_key(owner_user_id, document_id);
        match self.kv.get(&key).await? {
            Some(raw) => {
                let snapshot = decode(&raw)?;
                Ok(Some(StoredSnapshot { snapshot, raw }))
            }
            None => Ok(None),
        }
    }

    /// Unconditional write with a refreshed TTL.
    pub async fn put(&self, snapshot: &DraftSnapshot) -> Result<StoredSnapshot> {
        let raw = encode(snapshot)?;
        self.kv
            .set_with_ttl(&key_of(snapshot), &raw, self.ttl)
            .await?;
        Ok(StoredSnapshot {
            snapshot: snapshot.clone(),
            raw,
        })
    }

    /// Write only if no snapshot exists. `None` if one already did.
    pub async fn put_if_absent(&self, snapshot: &DraftSnapshot) -> Result<Option<StoredSnapshot>> {
        let raw = encode(snapshot)?;
        match self
            .kv
            .set_if_absent_with_ttl(&key_of(snapshot), &raw, self.ttl)
            .await?
        {
            SetIfAbsent::Created => Ok(Some(StoredSnapshot {
                snapshot: snapshot.clone(),
                raw,
            })),
            SetIfAbsent::Existed => Ok(None),
        }
    }

    /// Replace `expected` (or absence) with `snapshot`. `None` if the stored
    /// snapshot moved since `expected` was read.
    pub async fn replace(
        &self,
        expected: Option<&StoredSnapshot>,
        snapshot: &DraftSnapshot,
    ) -> Result<Option<StoredSnapshot>> {
        let raw = encode(snapshot)?;
        let swapped = self
            .kv
            .compare_and_swap(
                &key_of(snapshot),
                expected.map(StoredSnapshot::raw),
                &raw,
                self.ttl,
            )
            .await?;
        Ok(swapped.then(|| StoredSnapshot {
            snapshot: snapshot.clone(),
            raw,
        }))
    }

    pub async fn delete(&self, owner_user_id: &str, document_id: &str) -> Result<bool> {
        Ok(self
            .kv
            .delete(&keys::draft_key(owner_user_id, document_id))
            .await?)
    }

    /// Delete only if the stored snapshot is still `expected`.
    pub async fn delete_if_unchanged(&self, expected: &StoredSnapshot) -> Result<bool> {
        Ok(self
            .kv
            .delete_if_equals(&key_of(&expected.snapshot), expected.raw())
            .await?)
    }

    /// Number of live drafts across all documents.
    pub async fn count(&self) -> Result<usize> {
        Ok(self.kv.keys_by_prefix(DRAFT_PREFIX).await?.len())
    }
}

fn key_of(snapshot: &DraftSnapshot) -> String {
    keys::draft_key(&snapshot.owner_user_id, &snapshot.document_id)
}

pub(crate) fn encode<V: serde::Serialize>(value: &V) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| DraftError::Serialization(e.to_string()))
}

pub(crate) fn decode<V: serde::de::DeserializeOwned>(raw: &[u8]) -> Result<V> {
    serde_json::from_slice(raw).map_err(|e| DraftError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::snapshot::fields;
    use crate::store::InMemoryKv;
    use serde_json::json;

    fn store() -> (Arc<ManualClock>, Arc<InMemoryKv>, SnapshotStore<InMemoryKv>) {
        let clock = Arc::new(ManualClock::new(0));
        let kv = Arc::new(InMemoryKv::new(clock.clone()));
        let store = SnapshotStore::new(Arc::clone(&kv), Duration::from_secs(60));
        (clock, kv, store)
    }

    fn snapshot(version: u64, title: &str) -> DraftSnapshot {
        DraftSnapshot {
            owner_user_id: "alice".into(),
            document_id: "doc".into(),
            fields: fields([("title", json!(title))]),
            version,
            last_modified_at: version * 10,
            origin_device_id: "laptop".into(),
        }
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (_clock, _kv, store) = store();
        store.put(&snapshot(1, "X")).await.unwrap();

        let stored = store.get("alice", "doc").await.unwrap().unwrap();
        assert_eq!(stored.snapshot, snapshot(1, "X"));
        assert!(store.get("alice", "other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replace_detects_moved_snapshot() {
        let (_clock, _kv, store) = store();
        let v1 = store.put(&snapshot(1, "X")).await.unwrap();

        // Someone else writes v2 after we read v1
        store.put(&snapshot(2, "Y")).await.unwrap();

        assert!(store.replace(Some(&v1), &snapshot(2, "Z")).await.unwrap().is_none());
        let current = store.get("alice", "doc").await.unwrap().unwrap();
        assert_eq!(current.snapshot.fields["title"], json!("Y"));
    }

    #[tokio::test]
    async fn test_replace_absent_requires_absence() {
        let (_clock, _kv, store) = store();
        assert!(store.replace(None, &snapshot(1, "X")).await.unwrap().is_some());
        assert!(store.replace(None, &snapshot(1, "Y")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_expires_after_ttl() {
        let (clock, _kv, store) = store();
        store.put(&snapshot(1, "X")).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);

        clock.advance(Duration::from_secs(60));
        assert!(store.get("alice", "doc").await.unwrap().is_none());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_serialization_error() {
        let (_clock, kv, store) = store();
        kv.set_with_ttl("draft:alice:doc", b"not json", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(matches!(
            store.get("alice", "doc").await,
            Err(DraftError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_if_unchanged() {
        let (_clock, _kv, store) = store();
        let v1 = store.put(&snapshot(1, "X")).await.unwrap();
        let v2 = store.put(&snapshot(2, "Y")).await.unwrap();

        assert!(!store.delete_if_unchanged(&v1).await.unwrap());
        assert!(store.delete_if_unchanged(&v2).await.unwrap());
        assert!(store.get("alice", "doc").await.unwrap().is_none());
    }
}
