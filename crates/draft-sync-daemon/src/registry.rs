//! Connected clients, their identities and document rooms.
//!
//! `ClientRegistry` is the daemon's `BroadcastTransport`. It is cheap to
//! clone; all clones share the same table. Sending never blocks: every
//! connection owns an unbounded outbox drained by its writer task.

use crate::message::ServerMessage;
use async_trait::async_trait;
use draft_sync_core::transport::{Result, TransportError};
use draft_sync_core::{BroadcastTransport, DraftEvent};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

/// The user and device behind a connection, known after `hello`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub device_id: String,
}

struct Client {
    outbox: mpsc::UnboundedSender<ServerMessage>,
    identity: Option<Identity>,
    rooms: HashSet<String>,
}

/// What is left of a connection once it is removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departed {
    pub identity: Option<Identity>,
    pub rooms: Vec<String>,
}

#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<RwLock<HashMap<String, Client>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, conn_id: &str, outbox: mpsc::UnboundedSender<ServerMessage>) {
        self.write().insert(
            conn_id.to_string(),
            Client {
                outbox,
                identity: None,
                rooms: HashSet::new(),
            },
        );
    }

    /// Attach an identity. Returns false if the connection is unknown or
    /// already identified.
    pub fn identify(&self, conn_id: &str, identity: Identity) -> bool {
        match self.write().get_mut(conn_id) {
            Some(client) if client.identity.is_none() => {
                client.identity = Some(identity);
                true
            }
            _ => false,
        }
    }

    pub fn identity(&self, conn_id: &str) -> Option<Identity> {
        self.read().get(conn_id)?.identity.clone()
    }

    /// Subscribe a connection to a document room. False if the connection
    /// is already gone.
    pub fn join(&self, conn_id: &str, document_id: &str) -> bool {
        let mut clients = self.write();
        let Some(client) = clients.get_mut(conn_id) else {
            return false;
        };
        if client.rooms.insert(document_id.to_string()) {
            debug!("{} joined room {}", conn_id, document_id);
        }
        true
    }

    pub fn leave(&self, conn_id: &str, document_id: &str) {
        if let Some(client) = self.write().get_mut(conn_id) {
            client.rooms.remove(document_id);
        }
    }

    pub fn rooms(&self, conn_id: &str) -> Vec<String> {
        let mut rooms: Vec<_> = self
            .read()
            .get(conn_id)
            .map(|c| c.rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    pub fn remove(&self, conn_id: &str) -> Option<Departed> {
        let client = self.write().remove(conn_id)?;
        let mut rooms: Vec<_> = client.rooms.into_iter().collect();
        rooms.sort();
        Some(Departed {
            identity: client.identity,
            rooms,
        })
    }

    /// Queue a message for one connection. False if it is gone.
    pub fn send(&self, conn_id: &str, message: ServerMessage) -> bool {
        match self.read().get(conn_id) {
            Some(client) => client.outbox.send(message).is_ok(),
            None => false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.read().len()
    }

    /// Deliver `event` to every connection `select` picks, skipping the
    /// (user, device) that caused it.
    fn fan_out(&self, event: &DraftEvent, select: impl Fn(&Client) -> bool) -> Result<()> {
        let (origin_user, origin_device) = event.origin();
        let mut failed = 0;
        for client in self.read().values() {
            if !select(client) {
                continue;
            }
            if client
                .identity
                .as_ref()
                .is_some_and(|id| id.user_id == origin_user && id.device_id == origin_device)
            {
                continue;
            }
            let message = ServerMessage::Event {
                event: event.clone(),
            };
            if client.outbox.send(message).is_err() {
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(TransportError::SendFailed(format!(
                "{} connection(s) closed before delivery",
                failed
            )));
        }
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Client>> {
        self.clients.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Client>> {
        self.clients.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BroadcastTransport for ClientRegistry {
    /// Connections already in the document's room get the event from the
    /// room broadcast instead.
    async fn send_to_user(&self, user_id: &str, event: &DraftEvent) -> Result<()> {
        let document_id = event.document_id();
        self.fan_out(event, |client| {
            client
                .identity
                .as_ref()
                .is_some_and(|id| id.user_id == user_id)
                && !client.rooms.contains(document_id)
        })
    }

    async fn broadcast_to_document_room(&self, document_id: &str, event: &DraftEvent) -> Result<()> {
        self.fan_out(event, |client| client.rooms.contains(document_id))
    }
}
