//! DurableStore trait for the authoritative document record.
//!
//! The engine only reads it on cold start and writes it on commit.
//!
//! Implementations:
//! - `InMemoryDurable` - For testing
//! - `JsonDocumentStore` (in draft-sync-daemon) - one JSON file per document

use crate::clock::Timestamp;
use crate::snapshot::Fields;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DurableError {
    #[error("Durable store unavailable: {0}")]
    Unavailable(String),

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, DurableError>;

/// The committed state of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableRecord {
    pub fields: Fields,
    /// Commit time of the last write
    pub updated_at: Timestamp,
}

/// Durable record store.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Read the committed record, `None` if the document does not exist.
    async fn read_document(
        &self,
        owner_user_id: &str,
        document_id: &str,
    ) -> Result<Option<DurableRecord>>;

    /// Replace the committed fields of a document.
    async fn write_document(
        &self,
        owner_user_id: &str,
        document_id: &str,
        fields: &Fields,
        commit_time: Timestamp,
    ) -> Result<()>;
}

/// In-memory durable store for testing.
#[derive(Default)]
pub struct InMemoryDurable {
    records: RwLock<HashMap<(String, String), DurableRecord>>,
    /// When set, writes fail with `DurableError::Write`
    fail_writes: AtomicBool,
}

impl InMemoryDurable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record, as if it had been committed earlier.
    pub fn insert(&self, owner_user_id: &str, document_id: &str, record: DurableRecord) {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((owner_user_id.to_string(), document_id.to_string()), record);
    }

    /// Make subsequent writes fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, owner_user_id: &str, document_id: &str) -> Option<DurableRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(owner_user_id.to_string(), document_id.to_string()))
            .cloned()
    }
}

#[async_trait]
impl DurableStore for InMemoryDurable {
    async fn read_document(
        &self,
        owner_user_id: &str,
        document_id: &str,
    ) -> Result<Option<DurableRecord>> {
        Ok(self.get(owner_user_id, document_id))
    }

    async fn write_document(
        &self,
        owner_user_id: &str,
        document_id: &str,
        fields: &Fields,
        commit_time: Timestamp,
    ) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DurableError::Write("simulated write failure".into()));
        }
        self.insert(
            owner_user_id,
            document_id,
            DurableRecord {
                fields: fields.clone(),
                updated_at: commit_time,
            },
        );
        Ok(())
    }
}
