//! Typing Indicator Tracker: short-lived presence markers per field.

use crate::draft::{DraftSync, Result};
use crate::durable::DurableStore;
use crate::keys;
use crate::store::KvStore;
use crate::transport::BroadcastTransport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Marker value; only the key carries information.
const TYPING_MARKER: &[u8] = b"1";

/// Someone currently typing in a field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Typist {
    pub user_id: String,
    pub device_id: String,
}

impl<S: KvStore, D: DurableStore, T: BroadcastTransport> DraftSync<S, D, T> {
    /// Mark or unmark a device as typing in `field`. Marking again extends
    /// the marker's lifetime. Every call is broadcast.
    pub async fn set_typing(
        &self,
        document_id: &str,
        field: &str,
        user_id: &str,
        device_id: &str,
        is_typing: bool,
    ) -> Result<()> {
        keys::validate_id("documentId", document_id)?;
        keys::validate_field(field)?;
        keys::validate_id("userId", user_id)?;
        keys::validate_id("deviceId", device_id)?;

        let key = keys::typing_key(document_id, field, user_id, device_id);
        if is_typing {
            self.kv
                .set_with_ttl(&key, TYPING_MARKER, self.config.typing_ttl)
                .await?;
        } else {
            self.kv.delete(&key).await?;
        }
        debug!(
            "Typing {} on {}/{} by {}/{}",
            if is_typing { "started" } else { "stopped" },
            document_id,
            field,
            user_id,
            device_id
        );

        self.dispatcher
            .typing_changed(document_id, field, user_id, device_id, is_typing, self.clock.now_ms())
            .await;
        Ok(())
    }

    /// Point-in-time view of who is typing where.
    pub async fn list_typing(&self, document_id: &str) -> Result<BTreeMap<String, Vec<Typist>>> {
        keys::validate_id("documentId", document_id)?;

        let mut by_field: BTreeMap<String, Vec<Typist>> = BTreeMap::new();
        for key in self.kv.keys_by_prefix(&keys::typing_prefix(document_id)).await? {
            let Some(parsed) = keys::parse_typing_key(document_id, &key) else {
                continue;
            };
            by_field.entry(parsed.field).or_default().push(Typist {
                user_id: parsed.user_id,
                device_id: parsed.device_id,
            });
        }
        Ok(by_field)
    }

    /// Drop every marker a device holds on a document, announcing each as
    /// stopped. Returns how many were removed.
    pub async fn clear_device_typing(
        &self,
        document_id: &str,
        user_id: &str,
        device_id: &str,
    ) -> Result<usize> {
        keys::validate_id("documentId", document_id)?;

        let mut cleared = 0;
        for key in self.kv.keys_by_prefix(&keys::typing_prefix(document_id)).await? {
            let Some(parsed) = keys::parse_typing_key(document_id, &key) else {
                continue;
            };
            if parsed.user_id != user_id || parsed.device_id != device_id {
                continue;
            }
            if self.kv.delete(&key).await? {
                cleared += 1;
                self.dispatcher
                    .typing_changed(document_id, &parsed.field, user_id, device_id, false, self.clock.now_ms())
                    .await;
            }
        }
        Ok(cleared)
    }
}
