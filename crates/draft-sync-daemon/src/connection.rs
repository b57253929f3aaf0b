//! Individual client connection management.
//!
//! Each connection wraps a WebSocket stream split into a read task, which
//! forwards text frames to the server's event channel, and a write task,
//! which drains the connection's outbox.

use crate::message::{ServerMessage, MAX_MESSAGE_SIZE};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, error, warn};

/// Event emitted by a connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A text frame from the client
    Frame { conn_id: String, text: String },
    /// Connection was closed
    Closed { conn_id: String },
}

/// A single WebSocket connection to a client.
pub struct ClientConnection {
    pub conn_id: String,
    read_task: Option<JoinHandle<()>>,
    write_task: Option<JoinHandle<()>>,
}

impl ClientConnection {
    /// Start the read and write tasks for an upgraded stream.
    pub fn new(
        conn_id: String,
        ws_stream: WebSocketStream<TcpStream>,
        outbox: mpsc::UnboundedReceiver<ServerMessage>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (write, read) = ws_stream.split();

        let read_conn_id = conn_id.clone();
        let read_task = tokio::spawn(async move {
            Self::read_loop(read_conn_id, read, event_tx).await;
        });

        let write_conn_id = conn_id.clone();
        let write_task = tokio::spawn(async move {
            Self::write_loop(write_conn_id, write, outbox).await;
        });

        Self {
            conn_id,
            read_task: Some(read_task),
            write_task: Some(write_task),
        }
    }

    /// Read loop that forwards frames to the event channel.
    async fn read_loop(
        conn_id: String,
        mut read: futures::stream::SplitStream<WebSocketStream<TcpStream>>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let text = match msg {
                        Message::Text(text) => text.to_string(),
                        Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                            Ok(text) => text,
                            Err(_) => {
                                warn!("Non UTF-8 binary frame from {}, dropping", conn_id);
                                continue;
                            }
                        },
                        Message::Close(_) => {
                            debug!("Received close frame from {}", conn_id);
                            break;
                        }
                        _ => continue,
                    };

                    if text.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            "Frame from {} exceeds max size ({} > {}), dropping",
                            conn_id,
                            text.len(),
                            MAX_MESSAGE_SIZE
                        );
                        continue;
                    }

                    let _ = event_tx.send(ConnectionEvent::Frame {
                        conn_id: conn_id.clone(),
                        text,
                    });
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection {} closed", conn_id);
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", conn_id, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", conn_id);
                    break;
                }
            }
        }

        let _ = event_tx.send(ConnectionEvent::Closed { conn_id });
    }

    /// Write loop; ends when the outbox closes or the socket fails.
    async fn write_loop(
        conn_id: String,
        mut write: futures::stream::SplitSink<WebSocketStream<TcpStream>, Message>,
        mut outbox: mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        while let Some(message) = outbox.recv().await {
            if let Err(e) = write.send(Message::Text(message.to_text().into())).await {
                debug!("Failed to write to {}: {}", conn_id, e);
                break;
            }
        }
        let _ = write.send(Message::Close(None)).await;
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        if let Some(task) = self.write_task.take() {
            task.abort();
        }
    }
}
