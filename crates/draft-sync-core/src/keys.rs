//! Key layout in the transient store.
//!
//! ```text
//! draft:{owner}:{document}
//! lock:{document}:{field}
//! typing:{document}:{field}:{user}:{device}
//! ```
//!
//! Identifiers may not contain `:` so prefix scans never bleed into another
//! document. Field names may, since they are always either the key suffix or
//! parsed from the right.

use thiserror::Error;

pub const DRAFT_PREFIX: &str = "draft:";
pub const LOCK_PREFIX: &str = "lock:";
pub const TYPING_PREFIX: &str = "typing:";

const SEPARATOR: char = ':';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("{0} must not contain ':' (got {1:?})")]
    Separator(&'static str, String),
}

/// Validate an identifier (user, device, owner or document id).
pub fn validate_id(what: &'static str, id: &str) -> Result<(), KeyError> {
    if id.trim().is_empty() {
        return Err(KeyError::Empty(what));
    }
    if id.contains(SEPARATOR) {
        return Err(KeyError::Separator(what, id.to_string()));
    }
    Ok(())
}

/// Validate a field name.
pub fn validate_field(field: &str) -> Result<(), KeyError> {
    if field.trim().is_empty() {
        return Err(KeyError::Empty("field"));
    }
    Ok(())
}

pub fn draft_key(owner_user_id: &str, document_id: &str) -> String {
    format!("{DRAFT_PREFIX}{owner_user_id}:{document_id}")
}

pub fn lock_key(document_id: &str, field: &str) -> String {
    format!("{LOCK_PREFIX}{document_id}:{field}")
}

/// Prefix covering every lock on a document.
pub fn lock_prefix(document_id: &str) -> String {
    format!("{LOCK_PREFIX}{document_id}:")
}

pub fn typing_key(document_id: &str, field: &str, user_id: &str, device_id: &str) -> String {
    format!("{TYPING_PREFIX}{document_id}:{field}:{user_id}:{device_id}")
}

/// Prefix covering every typing marker on a document.
pub fn typing_prefix(document_id: &str) -> String {
    format!("{TYPING_PREFIX}{document_id}:")
}

/// A parsed typing marker key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingKey {
    pub field: String,
    pub user_id: String,
    pub device_id: String,
}

/// Parse a typing key found under `typing_prefix(document_id)`.
pub fn parse_typing_key(document_id: &str, key: &str) -> Option<TypingKey> {
    let rest = key.strip_prefix(&typing_prefix(document_id))?;
    let mut parts = rest.rsplitn(3, SEPARATOR);
    let device_id = parts.next()?;
    let user_id = parts.next()?;
    let field = parts.next()?;
    if field.is_empty() || user_id.is_empty() || device_id.is_empty() {
        return None;
    }
    Some(TypingKey {
        field: field.to_string(),
        user_id: user_id.to_string(),
        device_id: device_id.to_string(),
    })
}
