//! DraftSnapshot: the in-progress, not-yet-committed state of a document.

use crate::clock::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Field name → arbitrary structured value. The engine never looks inside
/// values, it only compares them for equality.
pub type Fields = BTreeMap<String, Value>;

/// Device id recorded on snapshots materialized from durable storage.
pub const ORIGIN_DURABLE: &str = "origin:durable";

/// Current state of one draft document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftSnapshot {
    /// Missing ids decode as empty and are rejected by validation
    #[serde(default)]
    pub owner_user_id: String,
    #[serde(default)]
    pub document_id: String,
    #[serde(default)]
    pub fields: Fields,
    /// Starts at 1; never decreases across accepted writes
    #[serde(default)]
    pub version: u64,
    /// Server: time of last accepted write. Candidate: client's claimed edit time.
    #[serde(default)]
    pub last_modified_at: Timestamp,
    #[serde(default)]
    pub origin_device_id: String,
}

impl DraftSnapshot {
    /// Build a candidate snapshot as a client would submit it.
    pub fn candidate(
        owner_user_id: impl Into<String>,
        document_id: impl Into<String>,
        device_id: impl Into<String>,
        fields: Fields,
        claimed_at: Timestamp,
    ) -> Self {
        Self {
            owner_user_id: owner_user_id.into(),
            document_id: document_id.into(),
            fields,
            version: 0,
            last_modified_at: claimed_at,
            origin_device_id: device_id.into(),
        }
    }

    /// Whether this snapshot was materialized from durable storage
    /// rather than produced by a device.
    pub fn is_cold_start(&self) -> bool {
        self.origin_device_id == ORIGIN_DURABLE
    }
}

/// A field where the server's accepted value diverges from a proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub field: String,
    /// `None` when the server snapshot does not have the field at all
    pub server_value: Option<Value>,
    pub client_value: Value,
    pub server_timestamp: Timestamp,
    pub client_timestamp: Timestamp,
}

/// Compare candidate fields against the server snapshot.
///
/// With `require_newer_server`, a differing field only counts when the
/// server's last write is strictly newer than the candidate's claimed time.
pub(crate) fn diff_fields(
    server: &DraftSnapshot,
    candidate: &DraftSnapshot,
    require_newer_server: bool,
) -> Vec<Conflict> {
    if require_newer_server && server.last_modified_at <= candidate.last_modified_at {
        return Vec::new();
    }

    candidate
        .fields
        .iter()
        .filter(|(name, value)| server.fields.get(*name) != Some(*value))
        .map(|(name, value)| Conflict {
            field: name.clone(),
            server_value: server.fields.get(name).cloned(),
            client_value: value.clone(),
            server_timestamp: server.last_modified_at,
            client_timestamp: candidate.last_modified_at,
        })
        .collect()
}

/// Build a `Fields` map from `(name, value)` pairs.
///
/// ```
/// use draft_sync_core::snapshot::fields;
/// use serde_json::json;
///
/// let f = fields([("title", json!("X")), ("tags", json!(["a", "b"]))]);
/// assert_eq!(f["title"], json!("X"));
/// ```
pub fn fields<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Fields {
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
