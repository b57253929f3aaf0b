//! draft-sync-core: collaborative draft synchronization for multi-device editing.
//!
//! This crate provides the core functionality for:
//! - Versioned draft snapshots with optimistic conflict detection
//! - Cold start of drafts from durable storage and commit back to it
//! - Per-field locks and typing indicators with TTL expiry
//! - KvStore, DurableStore and BroadcastTransport trait abstractions
//!
//! Everything hangs off one [`DraftSync`] value built at startup:
//!
//! ```
//! use draft_sync_core::{
//!     DraftSnapshot, DraftSync, EventBus, EventBusTransport, InMemoryDurable, InMemoryKv,
//!     ProposeOutcome, SyncConfig, SystemClock,
//! };
//! use draft_sync_core::snapshot::fields;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let clock = Arc::new(SystemClock);
//! let sync = DraftSync::new(
//!     SyncConfig::default(),
//!     Arc::new(InMemoryKv::new(clock.clone())),
//!     Arc::new(InMemoryDurable::new()),
//!     EventBusTransport::new(Arc::new(EventBus::new())),
//!     clock,
//! );
//!
//! let candidate = DraftSnapshot::candidate("alice", "doc-1", "laptop", fields([("title", json!("X"))]), 0);
//! assert_eq!(sync.propose(candidate).await.unwrap(), ProposeOutcome::Accepted { version: 1 });
//! # }
//! ```

pub mod clock;
pub mod commit;
pub mod dispatcher;
pub mod draft;
pub mod durable;
pub mod engine;
pub mod events;
pub mod keys;
pub mod loader;
pub mod locks;
pub mod snapshot;
pub mod snapshot_store;
pub mod store;
pub mod sweep;
pub mod transport;
pub mod typing;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use commit::CommitOutcome;
pub use draft::{ConcurrencyMode, DraftError, DraftSync, SyncConfig};
pub use durable::{DurableError, DurableRecord, DurableStore, InMemoryDurable};
pub use engine::{ProposeOutcome, ResolutionStrategy, Side};
pub use events::{Audience, Delivery, DraftEvent, EventBus, LockAction, Subscription};
pub use locks::{FieldLock, LockOutcome, ReleaseOutcome};
pub use snapshot::{Conflict, DraftSnapshot, Fields, ORIGIN_DURABLE};
pub use store::{InMemoryKv, KvStore, SetIfAbsent, StoreError};
pub use sweep::SweepStats;
pub use transport::{BroadcastTransport, EventBusTransport, TransportError};
pub use typing::Typist;
