//! Draft Loader: returns the current snapshot, materializing it from durable
//! storage on cold start.

use crate::draft::{DraftError, DraftSync, Result};
use crate::durable::DurableStore;
use crate::keys;
use crate::snapshot::{DraftSnapshot, ORIGIN_DURABLE};
use crate::snapshot_store::StoredSnapshot;
use crate::store::KvStore;
use crate::transport::BroadcastTransport;
use tracing::debug;

impl<S: KvStore, D: DurableStore, T: BroadcastTransport> DraftSync<S, D, T> {
    /// Current draft snapshot for `(owner, document)`.
    ///
    /// If no transient snapshot exists, the committed record is loaded and
    /// stored as version 1 with origin `origin:durable`. Fails with
    /// `NotFound` when neither exists.
    pub async fn load(&self, owner_user_id: &str, document_id: &str) -> Result<DraftSnapshot> {
        keys::validate_id("ownerUserId", owner_user_id)?;
        keys::validate_id("documentId", document_id)?;

        match self.load_stored(owner_user_id, document_id).await? {
            Some(stored) => Ok(stored.snapshot),
            None => Err(DraftError::NotFound {
                owner_user_id: owner_user_id.to_string(),
                document_id: document_id.to_string(),
            }),
        }
    }

    /// Load path shared with the conflict engine. `None` means there is
    /// neither a draft nor a durable record.
    pub(crate) async fn load_stored(
        &self,
        owner_user_id: &str,
        document_id: &str,
    ) -> Result<Option<StoredSnapshot>> {
        if let Some(stored) = self.snapshots.get(owner_user_id, document_id).await? {
            return Ok(Some(stored));
        }

        let record = self
            .durable
            .read_document(owner_user_id, document_id)
            .await
            .map_err(DraftError::DurableUnavailable)?;
        let Some(record) = record else {
            debug!("No draft or durable record for {}/{}", owner_user_id, document_id);
            return Ok(None);
        };

        let snapshot = DraftSnapshot {
            owner_user_id: owner_user_id.to_string(),
            document_id: document_id.to_string(),
            fields: record.fields,
            version: 1,
            last_modified_at: record.updated_at,
            origin_device_id: ORIGIN_DURABLE.to_string(),
        };

        if let Some(stored) = self.snapshots.put_if_absent(&snapshot).await? {
            debug!("Cold start: materialized {}/{} from durable storage", owner_user_id, document_id);
            return Ok(Some(stored));
        }

        // A concurrent load or proposal got there first; serve its snapshot.
        match self.snapshots.get(owner_user_id, document_id).await? {
            Some(stored) => Ok(Some(stored)),
            None => Ok(Some(self.snapshots.put(&snapshot).await?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::draft::test_support::Fixture;
    use crate::draft::DraftError;
    use crate::durable::DurableRecord;
    use crate::snapshot::{fields, DraftSnapshot, ORIGIN_DURABLE};
    use serde_json::json;

    #[tokio::test]
    async fn test_cold_start_materializes_version_one() {
        let fx = Fixture::new();
        fx.sync.durable().insert(
            "alice",
            "doc",
            DurableRecord {
                fields: fields([("title", json!("Committed"))]),
                updated_at: 500,
            },
        );

        let snapshot = fx.sync.load("alice", "doc").await.unwrap();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.origin_device_id, ORIGIN_DURABLE);
        assert_eq!(snapshot.last_modified_at, 500);
        assert_eq!(snapshot.fields["title"], json!("Committed"));

        // Second load is served from the transient store
        fx.sync.durable().insert(
            "alice",
            "doc",
            DurableRecord {
                fields: fields([("title", json!("Changed underneath"))]),
                updated_at: 900,
            },
        );
        let again = fx.sync.load("alice", "doc").await.unwrap();
        assert_eq!(again, snapshot);
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let fx = Fixture::new();
        let err = fx.sync.load("alice", "nothing").await.unwrap_err();
        assert!(matches!(err, DraftError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_load_prefers_existing_draft() {
        let fx = Fixture::new();
        fx.sync.durable().insert(
            "alice",
            "doc",
            DurableRecord {
                fields: fields([("title", json!("Old"))]),
                updated_at: 1,
            },
        );
        let candidate = DraftSnapshot::candidate(
            "alice",
            "doc",
            "laptop",
            fields([("title", json!("Draft"))]),
            fx.now(),
        );
        fx.sync.propose(candidate).await.unwrap();

        let snapshot = fx.sync.load("alice", "doc").await.unwrap();
        assert_eq!(snapshot.fields["title"], json!("Draft"));
        assert_eq!(snapshot.origin_device_id, "laptop");
    }

    #[tokio::test]
    async fn test_load_rejects_bad_ids() {
        let fx = Fixture::new();
        assert!(matches!(
            fx.sync.load("", "doc").await,
            Err(DraftError::InvalidInput(_))
        ));
        assert!(matches!(
            fx.sync.load("alice", "a:b").await,
            Err(DraftError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_load_with_store_down() {
        let fx = Fixture::new();
        fx.sync.kv().set_available(false);
        assert!(matches!(
            fx.sync.load("alice", "doc").await,
            Err(DraftError::StorageUnavailable(_))
        ));
    }
}
