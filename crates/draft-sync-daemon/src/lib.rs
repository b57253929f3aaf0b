//! draft-sync-daemon library: the WebSocket front end of the draft engine.
//!
//! The binary wires these pieces together; integration tests drive them
//! directly.

pub mod config;
pub mod connection;
pub mod daemon;
pub mod durable_fs;
pub mod handler;
pub mod message;
pub mod registry;
pub mod server;
pub mod sweeper;

pub use config::Args;
pub use daemon::{Daemon, Engine};
pub use durable_fs::JsonDocumentStore;
pub use message::{ClientMessage, ErrorCode, Operation, ServerMessage, MAX_MESSAGE_SIZE};
pub use registry::{ClientRegistry, Identity};
pub use server::{ServerEvent, WebSocketServer};
pub use sweeper::Sweeper;
