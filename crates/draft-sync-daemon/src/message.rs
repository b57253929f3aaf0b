//! Wire protocol messages.
//!
//! Every frame is a JSON object sent as a text WebSocket frame. The first
//! client frame must be `hello`; after that the client sends `request`s and
//! receives `response`/`error` replies plus `event`s for fan-out.

use draft_sync_core::{DraftError, DraftEvent, DraftSnapshot, ResolutionStrategy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Maximum frame size (1MiB). Larger frames are dropped unread.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Frame sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Identify the user and device behind this connection.
    Hello { user_id: String, device_id: String },
    Request { id: u64, op: Operation },
}

impl ClientMessage {
    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed {
            id: request_id(text),
            reason: e.to_string(),
        })
    }
}

/// Best-effort extraction of a request id from a frame that failed to parse.
fn request_id(text: &str) -> Option<u64> {
    serde_json::from_str::<Value>(text)
        .ok()?
        .get("id")?
        .as_u64()
}

/// An engine operation requested by a client.
///
/// Lock and typing operations act as the connection's own user and device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Operation {
    Subscribe {
        document_id: String,
    },
    Unsubscribe {
        document_id: String,
    },
    Load {
        owner_user_id: String,
        document_id: String,
    },
    /// `snapshot.originDeviceId` is replaced with the connection's device.
    Propose {
        snapshot: DraftSnapshot,
    },
    Resolve {
        snapshot: DraftSnapshot,
        strategy: ResolutionStrategy,
    },
    AcquireLock {
        document_id: String,
        field: String,
    },
    ReleaseLock {
        document_id: String,
        field: String,
    },
    ListLocks {
        document_id: String,
    },
    SetTyping {
        document_id: String,
        field: String,
        is_typing: bool,
    },
    ListTyping {
        document_id: String,
    },
    Commit {
        owner_user_id: String,
        document_id: String,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Subscribe { .. } => "subscribe",
            Operation::Unsubscribe { .. } => "unsubscribe",
            Operation::Load { .. } => "load",
            Operation::Propose { .. } => "propose",
            Operation::Resolve { .. } => "resolve",
            Operation::AcquireLock { .. } => "acquireLock",
            Operation::ReleaseLock { .. } => "releaseLock",
            Operation::ListLocks { .. } => "listLocks",
            Operation::SetTyping { .. } => "setTyping",
            Operation::ListTyping { .. } => "listTyping",
            Operation::Commit { .. } => "commit",
        }
    }
}

/// Frame sent by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Welcome {
        connection_id: String,
    },
    Response {
        id: u64,
        result: Value,
    },
    Error {
        id: Option<u64>,
        code: ErrorCode,
        message: String,
    },
    Event {
        event: DraftEvent,
    },
}

impl ServerMessage {
    pub fn error(id: Option<u64>, code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            id,
            code,
            message: message.into(),
        }
    }

    pub fn to_text(&self) -> String {
        // Only string keys and plain data, cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidInput,
    NotFound,
    StorageUnavailable,
    PersistFailed,
    Internal,
    Protocol,
}

impl From<&DraftError> for ErrorCode {
    fn from(e: &DraftError) -> Self {
        match e {
            DraftError::InvalidInput(_) => ErrorCode::InvalidInput,
            DraftError::NotFound { .. } => ErrorCode::NotFound,
            DraftError::StorageUnavailable(_) | DraftError::DurableUnavailable(_) => {
                ErrorCode::StorageUnavailable
            }
            DraftError::PersistFailed(_) => ErrorCode::PersistFailed,
            DraftError::Serialization(_) => ErrorCode::Internal,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("Malformed frame: {reason}")]
    Malformed { id: Option<u64>, reason: String },

    #[error("Send hello before any request")]
    NotIdentified { id: u64 },

    #[error("Connection already identified")]
    AlreadyIdentified,
}

impl ProtocolError {
    pub fn into_message(self) -> ServerMessage {
        let id = match &self {
            ProtocolError::Malformed { id, .. } => *id,
            ProtocolError::NotIdentified { id } => Some(*id),
            ProtocolError::AlreadyIdentified => None,
        };
        ServerMessage::error(id, ErrorCode::Protocol, self.to_string())
    }
}
