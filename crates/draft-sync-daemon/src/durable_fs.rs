//! Durable document store on the native filesystem using tokio::fs.
//!
//! Layout: `{base}/{owner}/{document}.json`, one file per document. Ids are
//! escaped so they can never leave their directory. Writes go to a temp file
//! that is renamed over the record.

use async_trait::async_trait;
use draft_sync_core::durable::{DurableError, Result};
use draft_sync_core::{DurableRecord, DurableStore, Fields, Timestamp};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;

pub struct JsonDocumentStore {
    base_path: PathBuf,
}

impl JsonDocumentStore {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn record_path(&self, owner_user_id: &str, document_id: &str) -> PathBuf {
        self.base_path
            .join(escape(owner_user_id))
            .join(format!("{}.json", escape(document_id)))
    }
}

/// Keep `[A-Za-z0-9_-]`, percent-encode every other byte.
fn escape(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

#[async_trait]
impl DurableStore for JsonDocumentStore {
    async fn read_document(
        &self,
        owner_user_id: &str,
        document_id: &str,
    ) -> Result<Option<DurableRecord>> {
        let path = self.record_path(owner_user_id, document_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DurableError::Unavailable(format!("{}: {}", path.display(), e))),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| DurableError::Corrupt(format!("{}: {}", path.display(), e)))
    }

    async fn write_document(
        &self,
        owner_user_id: &str,
        document_id: &str,
        fields: &Fields,
        commit_time: Timestamp,
    ) -> Result<()> {
        let path = self.record_path(owner_user_id, document_id);
        let record = DurableRecord {
            fields: fields.clone(),
            updated_at: commit_time,
        };
        let bytes = serde_json::to_vec_pretty(&record)
            .map_err(|e| DurableError::Write(e.to_string()))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DurableError::Write(format!("{}: {}", parent.display(), e)))?;
        }

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes)
            .await
            .map_err(|e| DurableError::Write(format!("{}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| DurableError::Write(format!("{}: {}", path.display(), e)))
    }
}
