//! The daemon's main event loop.

use crate::durable_fs::JsonDocumentStore;
use crate::handler::{handle_request, release_departed};
use crate::registry::ClientRegistry;
use crate::server::{ServerEvent, WebSocketServer};
use draft_sync_core::{DraftSync, DurableStore, InMemoryKv, KvStore};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Engine as deployed by the binary.
pub type Engine = DraftSync<InMemoryKv, JsonDocumentStore, ClientRegistry>;

/// Daemon state: the shared engine plus the WebSocket server feeding it.
pub struct Daemon<S: KvStore, D: DurableStore> {
    engine: Arc<DraftSync<S, D, ClientRegistry>>,
    server: WebSocketServer,
}

impl<S, D> Daemon<S, D>
where
    S: KvStore + 'static,
    D: DurableStore + 'static,
{
    /// The server shares the engine's registry so engine broadcasts reach
    /// the connections it accepts.
    pub fn new(engine: Arc<DraftSync<S, D, ClientRegistry>>) -> Self {
        let server = WebSocketServer::new(engine.transport().clone());
        Self { engine, server }
    }

    pub fn engine(&self) -> &Arc<DraftSync<S, D, ClientRegistry>> {
        &self.engine
    }

    /// Serve connections from `listener` until `shutdown` resolves.
    pub async fn run<F>(mut self, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            self.server.accept_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }

                Some(event) = self.server.poll_event() => {
                    self.on_event(event);
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        info!(
            "Closing {} connection(s)",
            self.server.connection_count()
        );
    }

    fn on_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::Identified { conn_id, identity } => {
                info!(
                    "{} identified as {}/{}",
                    conn_id, identity.user_id, identity.device_id
                );
            }
            ServerEvent::Request {
                conn_id,
                identity,
                id,
                op,
            } => {
                // Requests run concurrently; replies carry the request id
                let engine = Arc::clone(&self.engine);
                tokio::spawn(async move {
                    let reply = handle_request(&engine, &conn_id, &identity, id, op).await;
                    if !engine.transport().send(&conn_id, reply) {
                        debug!("Dropped reply {} for closed connection {}", id, conn_id);
                    }
                });
            }
            ServerEvent::Disconnected { conn_id, departed } => {
                let Some(identity) = departed.identity else {
                    debug!("{} left before hello", conn_id);
                    return;
                };
                if departed.rooms.is_empty() {
                    return;
                }
                let engine = Arc::clone(&self.engine);
                tokio::spawn(async move {
                    release_departed(&engine, &identity, &departed.rooms).await;
                });
            }
        }
    }
}
