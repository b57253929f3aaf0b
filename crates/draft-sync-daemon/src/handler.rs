//! Maps client requests onto engine operations.

use crate::message::{ErrorCode, Operation, ServerMessage};
use crate::registry::{ClientRegistry, Identity};
use draft_sync_core::{
    BroadcastTransport, DraftError, DraftSync, DurableStore, KvStore, LockOutcome,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Run one request for a connection and build the reply.
pub async fn handle_request<S, D>(
    engine: &DraftSync<S, D, ClientRegistry>,
    conn_id: &str,
    identity: &Identity,
    id: u64,
    op: Operation,
) -> ServerMessage
where
    S: KvStore,
    D: DurableStore,
{
    let name = op.name();
    debug!("{} request {} ({}) from {}/{}", conn_id, id, name, identity.user_id, identity.device_id);

    match dispatch(engine, conn_id, identity, op).await {
        Ok(result) => ServerMessage::Response { id, result },
        Err(e) => {
            if e.is_retryable() {
                warn!("{} failed for {}: {}", name, conn_id, e);
            } else {
                debug!("{} rejected for {}: {}", name, conn_id, e);
            }
            ServerMessage::error(Some(id), ErrorCode::from(&e), e.to_string())
        }
    }
}

async fn dispatch<S, D>(
    engine: &DraftSync<S, D, ClientRegistry>,
    conn_id: &str,
    identity: &Identity,
    op: Operation,
) -> Result<Value, DraftError>
where
    S: KvStore,
    D: DurableStore,
{
    let registry = engine.transport();
    let user = identity.user_id.as_str();
    let device = identity.device_id.as_str();

    match op {
        Operation::Subscribe { document_id } => {
            draft_sync_core::keys::validate_id("documentId", &document_id)?;
            registry.join(conn_id, &document_id);
            Ok(json!({ "documentId": document_id }))
        }
        Operation::Unsubscribe { document_id } => {
            registry.leave(conn_id, &document_id);
            Ok(json!({ "documentId": document_id }))
        }
        Operation::Load {
            owner_user_id,
            document_id,
        } => {
            let snapshot = engine.load(&owner_user_id, &document_id).await?;
            registry.join(conn_id, &document_id);
            to_value(&snapshot)
        }
        Operation::Propose { mut snapshot } => {
            snapshot.origin_device_id = device.to_string();
            let document_id = snapshot.document_id.clone();
            let outcome = engine.propose_as(user, snapshot).await?;
            registry.join(conn_id, &document_id);
            to_value(&outcome)
        }
        Operation::Resolve {
            mut snapshot,
            strategy,
        } => {
            snapshot.origin_device_id = device.to_string();
            let document_id = snapshot.document_id.clone();
            let outcome = engine.resolve_as(user, snapshot, strategy).await?;
            registry.join(conn_id, &document_id);
            to_value(&outcome)
        }
        Operation::AcquireLock { document_id, field } => {
            let outcome = engine.acquire_lock(&document_id, &field, user, device).await?;
            // Disconnect cleanup already ran for this connection
            if !registry.join(conn_id, &document_id) && matches!(outcome, LockOutcome::Granted { .. }) {
                debug!("{} left while acquiring {}/{}, releasing", conn_id, document_id, field);
                engine.release_lock(&document_id, &field, user, device).await?;
            }
            to_value(&outcome)
        }
        Operation::ReleaseLock { document_id, field } => {
            let outcome = engine.release_lock(&document_id, &field, user, device).await?;
            Ok(json!({ "outcome": outcome }))
        }
        Operation::ListLocks { document_id } => to_value(&engine.field_locks(&document_id).await?),
        Operation::SetTyping {
            document_id,
            field,
            is_typing,
        } => {
            engine
                .set_typing(&document_id, &field, user, device, is_typing)
                .await?;
            if !registry.join(conn_id, &document_id) && is_typing {
                engine
                    .set_typing(&document_id, &field, user, device, false)
                    .await?;
            }
            Ok(Value::Null)
        }
        Operation::ListTyping { document_id } => to_value(&engine.list_typing(&document_id).await?),
        Operation::Commit {
            owner_user_id,
            document_id,
        } => to_value(&engine.commit(&owner_user_id, &document_id).await?),
    }
}

/// Drop a departed device's locks and typing markers on every document it
/// had joined.
pub async fn release_departed<S, D, T>(
    engine: &DraftSync<S, D, T>,
    identity: &Identity,
    rooms: &[String],
) where
    S: KvStore,
    D: DurableStore,
    T: BroadcastTransport,
{
    for document_id in rooms {
        match engine
            .release_device_locks(document_id, &identity.user_id, &identity.device_id)
            .await
        {
            Ok(0) => {}
            Ok(n) => debug!("Released {} lock(s) on {} for {}", n, document_id, identity.device_id),
            Err(e) => warn!("Failed to release locks on {} for {}: {}", document_id, identity.device_id, e),
        }
        if let Err(e) = engine
            .clear_device_typing(document_id, &identity.user_id, &identity.device_id)
            .await
        {
            warn!("Failed to clear typing on {} for {}: {}", document_id, identity.device_id, e);
        }
    }
}

fn to_value<V: Serialize>(value: &V) -> Result<Value, DraftError> {
    serde_json::to_value(value).map_err(|e| DraftError::Serialization(e.to_string()))
}
