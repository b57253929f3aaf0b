//! Advisory sweep over the transient store.
//!
//! Every key expires on its own; the sweep only reclaims memory in stores
//! that expire lazily and reports what is live. Nothing depends on it running.

use crate::draft::{DraftSync, Result};
use crate::durable::DurableStore;
use crate::keys::{LOCK_PREFIX, TYPING_PREFIX};
use crate::store::KvStore;
use crate::transport::BroadcastTransport;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepStats {
    pub drafts: usize,
    pub locks: usize,
    pub typing_markers: usize,
    /// Expired entries dropped by this pass
    pub purged: usize,
}

impl<S: KvStore, D: DurableStore, T: BroadcastTransport> DraftSync<S, D, T> {
    pub async fn sweep(&self) -> Result<SweepStats> {
        let purged = self.kv.purge_expired().await?;
        let stats = SweepStats {
            drafts: self.snapshots.count().await?,
            locks: self.kv.keys_by_prefix(LOCK_PREFIX).await?.len(),
            typing_markers: self.kv.keys_by_prefix(TYPING_PREFIX).await?.len(),
            purged,
        };
        debug!("Sweep: {:?}", stats);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::test_support::Fixture;
    use crate::snapshot::{fields, DraftSnapshot};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sweep_counts_and_purges() {
        let fx = Fixture::new();
        let c = DraftSnapshot::candidate("alice", "doc", "laptop", fields([("a", json!(1))]), fx.now());
        fx.sync.propose(c).await.unwrap();
        fx.sync.acquire_lock("doc", "a", "alice", "laptop").await.unwrap();
        fx.sync.set_typing("doc", "a", "alice", "laptop", true).await.unwrap();
        fx.sync.set_typing("doc", "b", "bob", "tablet", true).await.unwrap();

        assert_eq!(
            fx.sync.sweep().await.unwrap(),
            SweepStats {
                drafts: 1,
                locks: 1,
                typing_markers: 2,
                purged: 0
            }
        );

        // Typing markers expire first
        fx.clock.advance(Duration::from_secs(30));
        assert_eq!(
            fx.sync.sweep().await.unwrap(),
            SweepStats {
                drafts: 1,
                locks: 1,
                typing_markers: 0,
                purged: 2
            }
        );
        assert_eq!(fx.sync.kv().raw_len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_on_empty_store() {
        let fx = Fixture::new();
        assert_eq!(fx.sync.sweep().await.unwrap(), SweepStats::default());
    }
}
