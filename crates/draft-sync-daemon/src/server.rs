//! WebSocket server accepting client connections.
//!
//! Manages connection lifecycle and turns raw frames into `ServerEvent`s.
//! The hello handshake is encapsulated: callers see `Request`s only for
//! identified connections, and protocol violations are answered here.
//! HTTP upgrades run on their own tasks so a slow client never holds up
//! `poll_event`.

use crate::connection::{ClientConnection, ConnectionEvent};
use crate::message::{ClientMessage, Operation, ProtocolError, ServerMessage};
use crate::registry::{ClientRegistry, Departed, Identity};
use anyhow::Result;
use draft_sync_core::keys;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, warn};

/// Time a new TCP connection gets to complete the WebSocket upgrade.
pub const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

type Upgraded = (WebSocketStream<TcpStream>, SocketAddr);

/// Event emitted by the server once frames have been parsed and checked.
#[derive(Debug)]
pub enum ServerEvent {
    /// A client completed `hello`.
    Identified { conn_id: String, identity: Identity },
    /// A request from an identified client.
    Request {
        conn_id: String,
        identity: Identity,
        id: u64,
        op: Operation,
    },
    /// A connection went away.
    Disconnected { conn_id: String, departed: Departed },
}

/// WebSocket server managing client connections.
pub struct WebSocketServer {
    registry: ClientRegistry,
    connections: HashMap<String, ClientConnection>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    upgraded_tx: mpsc::UnboundedSender<Upgraded>,
    upgraded_rx: mpsc::UnboundedReceiver<Upgraded>,
}

impl WebSocketServer {
    pub fn new(registry: ClientRegistry) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (upgraded_tx, upgraded_rx) = mpsc::unbounded_channel();

        Self {
            registry,
            connections: HashMap::new(),
            event_tx,
            event_rx,
            upgraded_tx,
            upgraded_rx,
        }
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("WebSocket server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Start the WebSocket upgrade for a new TCP connection.
    ///
    /// Returns immediately; the upgraded stream is picked up by `poll_event`.
    pub fn accept_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let upgraded_tx = self.upgraded_tx.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(UPGRADE_TIMEOUT, accept_async(stream)).await {
                Ok(Ok(ws_stream)) => {
                    let _ = upgraded_tx.send((ws_stream, addr));
                }
                Ok(Err(e)) => {
                    // Health checks connect and close without completing the
                    // WebSocket handshake
                    let err_str = e.to_string();
                    if err_str.contains("Handshake not finished")
                        || err_str.contains("Connection reset")
                        || err_str.contains("unexpected EOF")
                    {
                        debug!("Connection closed before handshake from {}", addr);
                    } else {
                        error!("WebSocket upgrade failed for {}: {}", addr, e);
                    }
                }
                Err(_) => {
                    warn!("WebSocket upgrade from {} timed out", addr);
                }
            }
        });
    }

    fn register_connection(&mut self, ws_stream: WebSocketStream<TcpStream>, addr: SocketAddr) {
        let conn_id = uuid::Uuid::new_v4().to_string();
        info!("New connection from {} (conn_id: {})", addr, conn_id);

        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        self.registry.register(&conn_id, outbox_tx);
        let conn = ClientConnection::new(conn_id.clone(), ws_stream, outbox_rx, self.event_tx.clone());
        self.connections.insert(conn_id, conn);
    }

    /// Wait for the next server event.
    ///
    /// Malformed frames and requests before `hello` are answered with a
    /// `protocol` error and never surface.
    pub async fn poll_event(&mut self) -> Option<ServerEvent> {
        loop {
            let event = tokio::select! {
                Some((ws_stream, addr)) = self.upgraded_rx.recv() => {
                    self.register_connection(ws_stream, addr);
                    continue;
                }
                event = self.event_rx.recv() => event?,
            };

            match event {
                ConnectionEvent::Frame { conn_id, text } => {
                    match self.on_frame(&conn_id, &text) {
                        Ok(event) => return Some(event),
                        Err(e) => {
                            debug!("Protocol error from {}: {}", conn_id, e);
                            self.registry.send(&conn_id, e.into_message());
                        }
                    }
                }
                ConnectionEvent::Closed { conn_id } => {
                    self.connections.remove(&conn_id);
                    if let Some(departed) = self.registry.remove(&conn_id) {
                        info!("Connection closed: {}", conn_id);
                        return Some(ServerEvent::Disconnected { conn_id, departed });
                    }
                }
            }
        }
    }

    fn on_frame(&self, conn_id: &str, text: &str) -> Result<ServerEvent, ProtocolError> {
        match ClientMessage::from_text(text)? {
            ClientMessage::Hello { user_id, device_id } => {
                if let Err(e) = keys::validate_id("userId", &user_id)
                    .and_then(|_| keys::validate_id("deviceId", &device_id))
                {
                    warn!("Rejected hello from {}: {}", conn_id, e);
                    return Err(ProtocolError::Malformed {
                        id: None,
                        reason: e.to_string(),
                    });
                }
                let identity = Identity { user_id, device_id };
                if !self.registry.identify(conn_id, identity.clone()) {
                    return Err(ProtocolError::AlreadyIdentified);
                }
                self.registry.send(
                    conn_id,
                    ServerMessage::Welcome {
                        connection_id: conn_id.to_string(),
                    },
                );
                Ok(ServerEvent::Identified {
                    conn_id: conn_id.to_string(),
                    identity,
                })
            }
            ClientMessage::Request { id, op } => {
                let Some(identity) = self.registry.identity(conn_id) else {
                    return Err(ProtocolError::NotIdentified { id });
                };
                Ok(ServerEvent::Request {
                    conn_id: conn_id.to_string(),
                    identity,
                    id,
                    op,
                })
            }
        }
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
