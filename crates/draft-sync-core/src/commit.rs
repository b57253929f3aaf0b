//! Commit Coordinator: flushes the accepted draft into durable storage.

use crate::clock::Timestamp;
use crate::draft::{ConcurrencyMode, DraftError, DraftSync, Result};
use crate::durable::DurableStore;
use crate::keys;
use crate::store::KvStore;
use crate::transport::BroadcastTransport;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "outcome",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum CommitOutcome {
    Committed {
        /// Draft version that was written
        version: u64,
        committed_at: Timestamp,
    },
    /// No transient draft exists; durable storage is already current.
    NothingToCommit,
}

impl<S: KvStore, D: DurableStore, T: BroadcastTransport> DraftSync<S, D, T> {
    /// Write the current draft's fields to durable storage and drop the
    /// transient copy, so the next `load` cold-starts from what was committed.
    ///
    /// If the durable write fails the draft is left untouched and
    /// `PersistFailed` is returned.
    pub async fn commit(&self, owner_user_id: &str, document_id: &str) -> Result<CommitOutcome> {
        keys::validate_id("ownerUserId", owner_user_id)?;
        keys::validate_id("documentId", document_id)?;

        let Some(stored) = self.snapshots.get(owner_user_id, document_id).await? else {
            debug!("Nothing to commit for {}/{}", owner_user_id, document_id);
            return Ok(CommitOutcome::NothingToCommit);
        };

        let committed_at = self.clock.now_ms();
        if let Err(e) = self
            .durable
            .write_document(owner_user_id, document_id, &stored.snapshot.fields, committed_at)
            .await
        {
            warn!(
                "Commit of {}/{} v{} failed: {}",
                owner_user_id, document_id, stored.snapshot.version, e
            );
            return Err(DraftError::PersistFailed(e));
        }

        let removed = match self.config.concurrency {
            ConcurrencyMode::CompareAndSwap => self.snapshots.delete_if_unchanged(&stored).await?,
            ConcurrencyMode::LastWriterWins => self.snapshots.delete(owner_user_id, document_id).await?,
        };
        if !removed {
            // A newer proposal landed after the read; it stays as the draft
            debug!(
                "Draft {}/{} moved past v{} during commit, keeping it",
                owner_user_id, document_id, stored.snapshot.version
            );
        }

        info!(
            "Committed {}/{} v{} at {}",
            owner_user_id, document_id, stored.snapshot.version, committed_at
        );
        Ok(CommitOutcome::Committed {
            version: stored.snapshot.version,
            committed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::test_support::Fixture;
    use crate::draft::SyncConfig;
    use crate::snapshot::{fields, DraftSnapshot, ORIGIN_DURABLE};
    use serde_json::json;
    use std::time::Duration;

    async fn propose_twice(fx: &Fixture) {
        for title in ["Draft 1", "Draft 2"] {
            fx.clock.advance(Duration::from_millis(5));
            let c = DraftSnapshot::candidate(
                "alice",
                "doc",
                "laptop",
                fields([("title", json!(title)), ("genre", json!("Drama"))]),
                fx.now(),
            );
            assert!(fx.sync.propose(c).await.unwrap().is_accepted());
        }
    }

    #[tokio::test]
    async fn test_commit_then_load_resets_version() {
        let fx = Fixture::new();
        propose_twice(&fx).await;

        let outcome = fx.sync.commit("alice", "doc").await.unwrap();
        assert_eq!(
            outcome,
            CommitOutcome::Committed {
                version: 2,
                committed_at: fx.now()
            }
        );

        let record = fx.sync.durable().get("alice", "doc").unwrap();
        assert_eq!(record.fields["title"], json!("Draft 2"));
        assert_eq!(record.updated_at, fx.now());

        let loaded = fx.sync.load("alice", "doc").await.unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.origin_device_id, ORIGIN_DURABLE);
        assert_eq!(loaded.fields, record.fields);
    }

    #[tokio::test]
    async fn test_nothing_to_commit() {
        let fx = Fixture::new();
        assert_eq!(
            fx.sync.commit("alice", "doc").await.unwrap(),
            CommitOutcome::NothingToCommit
        );
        assert!(fx.sync.durable().get("alice", "doc").is_none());
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_draft() {
        let fx = Fixture::new();
        propose_twice(&fx).await;
        fx.sync.durable().set_fail_writes(true);

        let err = fx.sync.commit("alice", "doc").await.unwrap_err();
        assert!(matches!(err, DraftError::PersistFailed(_)));
        assert!(err.is_retryable());

        let draft = fx.sync.load("alice", "doc").await.unwrap();
        assert_eq!(draft.version, 2);
        assert_eq!(draft.fields["title"], json!("Draft 2"));

        // Retry once storage recovers
        fx.sync.durable().set_fail_writes(false);
        assert!(matches!(
            fx.sync.commit("alice", "doc").await.unwrap(),
            CommitOutcome::Committed { version: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_commit_last_writer_wins_removes_draft() {
        let fx = Fixture::with_config(SyncConfig {
            concurrency: ConcurrencyMode::LastWriterWins,
            ..SyncConfig::default()
        });
        propose_twice(&fx).await;

        assert!(matches!(
            fx.sync.commit("alice", "doc").await.unwrap(),
            CommitOutcome::Committed { version: 2, .. }
        ));
        assert_eq!(fx.sync.load("alice", "doc").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_commit_does_not_broadcast() {
        let fx = Fixture::new();
        propose_twice(&fx).await;
        fx.take_deliveries();

        fx.sync.commit("alice", "doc").await.unwrap();
        assert!(fx.take_deliveries().is_empty());
    }
}
