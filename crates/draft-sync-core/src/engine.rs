//! Version & Conflict Engine: optimistic concurrency for draft proposals.
//!
//! A proposal is checked against the snapshot read immediately beforehand.
//! A field conflicts when its value differs from the server's AND the server
//! accepted a write strictly after the candidate's claimed edit time. Any
//! conflict rejects the whole proposal; otherwise the candidate's fields
//! become `serverVersion + 1`.
//!
//! Under `ConcurrencyMode::CompareAndSwap` the write only lands if the stored
//! snapshot is still the one that was checked, so a racing proposal that
//! slipped in between is surfaced as `Conflicted` instead of being lost.

use crate::draft::{validate_candidate, ConcurrencyMode, DraftSync, Result};
use crate::durable::DurableStore;
use crate::snapshot::{diff_fields, Conflict, DraftSnapshot, Fields};
use crate::snapshot_store::StoredSnapshot;
use crate::store::KvStore;
use crate::transport::BroadcastTransport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Result of `propose` or `resolve`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "outcome",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ProposeOutcome {
    Accepted {
        version: u64,
    },
    /// Nothing was written. `conflicts` lists every diverging field.
    Conflicted {
        conflicts: Vec<Conflict>,
        server_version: u64,
    },
}

impl ProposeOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ProposeOutcome::Accepted { .. })
    }
}

/// Which side a diverging field takes during `resolve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Server,
    Client,
}

/// How `resolve` settles fields where server and client disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "choices", rename_all = "snake_case")]
pub enum ResolutionStrategy {
    ServerWins,
    ClientWins,
    /// Per-field choice; unlisted fields keep the server value
    PerField(BTreeMap<String, Side>),
}

impl ResolutionStrategy {
    fn side_for(&self, field: &str) -> Side {
        match self {
            ResolutionStrategy::ServerWins => Side::Server,
            ResolutionStrategy::ClientWins => Side::Client,
            ResolutionStrategy::PerField(choices) => {
                choices.get(field).copied().unwrap_or(Side::Server)
            }
        }
    }
}

/// Merge candidate fields into the server's according to `strategy`.
///
/// The result holds the union of both field sets.
pub(crate) fn merge_fields(server: &Fields, client: &Fields, strategy: &ResolutionStrategy) -> Fields {
    let mut merged = server.clone();
    for (name, client_value) in client {
        match server.get(name) {
            Some(server_value) if server_value != client_value => {
                if strategy.side_for(name) == Side::Client {
                    merged.insert(name.clone(), client_value.clone());
                }
            }
            Some(_) => {}
            None => {
                merged.insert(name.clone(), client_value.clone());
            }
        }
    }
    merged
}

impl<S: KvStore, D: DurableStore, T: BroadcastTransport> DraftSync<S, D, T> {
    /// Submit a candidate snapshot from one of the owner's devices.
    ///
    /// Store failures surface as `StorageUnavailable`; they are never read as
    /// "no conflict".
    pub async fn propose(&self, candidate: DraftSnapshot) -> Result<ProposeOutcome> {
        let origin_user_id = candidate.owner_user_id.clone();
        self.propose_as(&origin_user_id, candidate).await
    }

    /// Submit a candidate snapshot on behalf of `origin_user_id`, who may be
    /// an editor other than the owner. The accepted write's broadcast skips
    /// only that user's `originDeviceId`.
    pub async fn propose_as(
        &self,
        origin_user_id: &str,
        candidate: DraftSnapshot,
    ) -> Result<ProposeOutcome> {
        validate_candidate(&candidate)?;
        crate::keys::validate_id("originUserId", origin_user_id)?;

        let current = self
            .load_stored(&candidate.owner_user_id, &candidate.document_id)
            .await?;

        let Some(current) = current else {
            let accepted = self.accepted_snapshot(&candidate, candidate.fields.clone(), 1);
            return self.write_accepted(None, accepted, &candidate, origin_user_id).await;
        };

        let conflicts = diff_fields(&current.snapshot, &candidate, true);
        if !conflicts.is_empty() {
            debug!(
                "Proposal from {} on {}/{} conflicts on {} field(s) against v{}",
                candidate.origin_device_id,
                candidate.owner_user_id,
                candidate.document_id,
                conflicts.len(),
                current.snapshot.version
            );
            return Ok(ProposeOutcome::Conflicted {
                conflicts,
                server_version: current.snapshot.version,
            });
        }

        let accepted = self.accepted_snapshot(
            &candidate,
            candidate.fields.clone(),
            current.snapshot.version + 1,
        );
        self.write_accepted(Some(&current), accepted, &candidate, origin_user_id)
            .await
    }

    /// Settle a conflict with an explicit strategy and write the merge as the
    /// next version. No recency test is applied.
    pub async fn resolve(
        &self,
        candidate: DraftSnapshot,
        strategy: ResolutionStrategy,
    ) -> Result<ProposeOutcome> {
        let origin_user_id = candidate.owner_user_id.clone();
        self.resolve_as(&origin_user_id, candidate, strategy).await
    }

    /// `resolve` on behalf of `origin_user_id`; see `propose_as`.
    pub async fn resolve_as(
        &self,
        origin_user_id: &str,
        candidate: DraftSnapshot,
        strategy: ResolutionStrategy,
    ) -> Result<ProposeOutcome> {
        validate_candidate(&candidate)?;
        crate::keys::validate_id("originUserId", origin_user_id)?;
        if let ResolutionStrategy::PerField(choices) = &strategy {
            for name in choices.keys() {
                crate::keys::validate_field(name)?;
            }
        }

        let current = self
            .load_stored(&candidate.owner_user_id, &candidate.document_id)
            .await?;

        let Some(current) = current else {
            let accepted = self.accepted_snapshot(&candidate, candidate.fields.clone(), 1);
            return self.write_accepted(None, accepted, &candidate, origin_user_id).await;
        };

        let merged = merge_fields(&current.snapshot.fields, &candidate.fields, &strategy);
        debug!(
            "Resolving {}/{} against v{} with {:?}",
            candidate.owner_user_id, candidate.document_id, current.snapshot.version, strategy
        );
        let accepted = self.accepted_snapshot(&candidate, merged, current.snapshot.version + 1);
        self.write_accepted(Some(&current), accepted, &candidate, origin_user_id)
            .await
    }

    fn accepted_snapshot(&self, candidate: &DraftSnapshot, fields: Fields, version: u64) -> DraftSnapshot {
        DraftSnapshot {
            owner_user_id: candidate.owner_user_id.clone(),
            document_id: candidate.document_id.clone(),
            fields,
            version,
            last_modified_at: self.clock.now_ms(),
            origin_device_id: candidate.origin_device_id.clone(),
        }
    }

    /// Persist an accepted snapshot over `base` and broadcast it.
    async fn write_accepted(
        &self,
        base: Option<&StoredSnapshot>,
        accepted: DraftSnapshot,
        candidate: &DraftSnapshot,
        origin_user_id: &str,
    ) -> Result<ProposeOutcome> {
        match self.config.concurrency {
            ConcurrencyMode::CompareAndSwap => {
                if self.snapshots.replace(base, &accepted).await?.is_none() {
                    return self.lost_race(candidate).await;
                }
            }
            ConcurrencyMode::LastWriterWins => {
                self.snapshots.put(&accepted).await?;
            }
        }

        info!(
            "Accepted {}/{} v{} from {}/{}",
            accepted.owner_user_id,
            accepted.document_id,
            accepted.version,
            origin_user_id,
            accepted.origin_device_id
        );
        self.dispatcher.draft_updated(&accepted, origin_user_id).await;

        Ok(ProposeOutcome::Accepted {
            version: accepted.version,
        })
    }

    /// The stored snapshot moved between the check and the write.
    async fn lost_race(&self, candidate: &DraftSnapshot) -> Result<ProposeOutcome> {
        let now = self
            .snapshots
            .get(&candidate.owner_user_id, &candidate.document_id)
            .await?;
        let (conflicts, server_version) = match now {
            Some(stored) => (
                diff_fields(&stored.snapshot, candidate, false),
                stored.snapshot.version,
            ),
            // Committed (or expired) in between; the client should reload
            None => (Vec::new(), 0),
        };
        debug!(
            "Proposal from {} on {}/{} lost a write race (server now v{})",
            candidate.origin_device_id, candidate.owner_user_id, candidate.document_id, server_version
        );
        Ok(ProposeOutcome::Conflicted {
            conflicts,
            server_version,
        })
    }
}
