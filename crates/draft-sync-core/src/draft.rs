//! DraftSync: the engine instance, its configuration and error type.
//!
//! One `DraftSync` is constructed at process start and shared by reference
//! (usually `Arc`) with every request handler. The components of the engine
//! are `impl` blocks on this struct, split across modules:
//!
//! - `loader` - cold start from durable storage
//! - `engine` - propose / resolve (version & conflict engine)
//! - `locks` - field lock manager
//! - `typing` - typing indicator tracker
//! - `commit` - commit coordinator
//! - `sweep` - advisory statistics pass

use crate::clock::Clock;
use crate::dispatcher::Dispatcher;
use crate::durable::{DurableError, DurableStore};
use crate::keys::{self, KeyError};
use crate::snapshot::DraftSnapshot;
use crate::snapshot_store::SnapshotStore;
use crate::store::{KvStore, StoreError};
use crate::transport::BroadcastTransport;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DraftError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No draft or durable record for {owner_user_id}/{document_id}")]
    NotFound {
        owner_user_id: String,
        document_id: String,
    },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] StoreError),

    #[error("Durable storage unavailable: {0}")]
    DurableUnavailable(DurableError),

    #[error("Persist failed: {0}")]
    PersistFailed(DurableError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<KeyError> for DraftError {
    fn from(e: KeyError) -> Self {
        DraftError::InvalidInput(e.to_string())
    }
}

impl DraftError {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DraftError::StorageUnavailable(_)
                | DraftError::DurableUnavailable(_)
                | DraftError::PersistFailed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DraftError>;

/// How an accepted proposal is written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyMode {
    /// Write only if the stored snapshot is still the one the conflict
    /// check read; a lost race is reported as `Conflicted`.
    #[default]
    CompareAndSwap,
    /// Plain overwrite. Two racing proposals can both pass the conflict
    /// check and the later write silently wins.
    LastWriterWins,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Lifetime of a transient draft snapshot, refreshed on every accepted write
    pub draft_ttl: Duration,
    /// Lifetime of a field lock
    pub lock_ttl: Duration,
    /// Lifetime of a typing marker, refreshed on every `set_typing(true)`
    pub typing_ttl: Duration,
    pub concurrency: ConcurrencyMode,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            draft_ttl: Duration::from_secs(60 * 60),
            lock_ttl: Duration::from_secs(5 * 60),
            typing_ttl: Duration::from_secs(30),
            concurrency: ConcurrencyMode::CompareAndSwap,
        }
    }
}

/// The draft synchronization engine.
pub struct DraftSync<S: KvStore, D: DurableStore, T: BroadcastTransport> {
    pub(crate) config: SyncConfig,
    pub(crate) kv: Arc<S>,
    pub(crate) snapshots: SnapshotStore<S>,
    pub(crate) durable: Arc<D>,
    pub(crate) dispatcher: Dispatcher<T>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl<S: KvStore, D: DurableStore, T: BroadcastTransport> DraftSync<S, D, T> {
    pub fn new(
        config: SyncConfig,
        kv: Arc<S>,
        durable: Arc<D>,
        transport: T,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let snapshots = SnapshotStore::new(Arc::clone(&kv), config.draft_ttl);
        Self {
            config,
            kv,
            snapshots,
            durable,
            dispatcher: Dispatcher::new(transport),
            clock,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn kv(&self) -> &Arc<S> {
        &self.kv
    }

    pub fn durable(&self) -> &Arc<D> {
        &self.durable
    }

    pub fn transport(&self) -> &T {
        self.dispatcher.transport()
    }
}

/// Validate the identifying fields of a submitted snapshot.
pub(crate) fn validate_candidate(candidate: &DraftSnapshot) -> Result<()> {
    keys::validate_id("ownerUserId", &candidate.owner_user_id)?;
    keys::validate_id("documentId", &candidate.document_id)?;
    keys::validate_id("originDeviceId", &candidate.origin_device_id)?;
    for name in candidate.fields.keys() {
        keys::validate_field(name)?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared fixture for the component tests.

    use super::*;
    use crate::clock::ManualClock;
    use crate::durable::InMemoryDurable;
    use crate::events::{Delivery, EventBus, Subscription};
    use crate::store::InMemoryKv;
    use crate::transport::EventBusTransport;
    use std::sync::Mutex;

    pub type TestSync = DraftSync<InMemoryKv, InMemoryDurable, EventBusTransport>;

    pub struct Fixture {
        pub sync: TestSync,
        pub clock: Arc<ManualClock>,
        pub deliveries: Arc<Mutex<Vec<Delivery>>>,
        _sub: Subscription,
    }

    impl Fixture {
        pub fn new() -> Self {
            Self::with_config(SyncConfig::default())
        }

        pub fn with_config(config: SyncConfig) -> Self {
            let clock = Arc::new(ManualClock::new(1_000_000));
            let kv = Arc::new(InMemoryKv::new(clock.clone()));
            let durable = Arc::new(InMemoryDurable::new());
            let bus = Arc::new(EventBus::new());
            let deliveries = Arc::new(Mutex::new(Vec::new()));
            let deliveries_clone = Arc::clone(&deliveries);
            let sub = bus.subscribe(move |d| deliveries_clone.lock().unwrap().push(d));
            let sync = DraftSync::new(
                config,
                kv,
                durable,
                EventBusTransport::new(bus),
                clock.clone(),
            );
            Self {
                sync,
                clock,
                deliveries,
                _sub: sub,
            }
        }

        pub fn now(&self) -> u64 {
            self.clock.now_ms()
        }

        /// Drain deliveries recorded so far.
        pub fn take_deliveries(&self) -> Vec<Delivery> {
            std::mem::take(&mut *self.deliveries.lock().unwrap())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::fields;
    use serde_json::json;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.lock_ttl, Duration::from_secs(300));
        assert_eq!(config.typing_ttl, Duration::from_secs(30));
        assert_eq!(config.concurrency, ConcurrencyMode::CompareAndSwap);
    }

    #[test]
    fn test_validate_candidate() {
        let ok = DraftSnapshot::candidate("alice", "doc", "laptop", fields([("title", json!("X"))]), 1);
        assert!(validate_candidate(&ok).is_ok());

        let no_owner = DraftSnapshot::candidate("", "doc", "laptop", Default::default(), 1);
        assert!(matches!(
            validate_candidate(&no_owner),
            Err(DraftError::InvalidInput(_))
        ));

        let no_device = DraftSnapshot::candidate("alice", "doc", "", Default::default(), 1);
        assert!(validate_candidate(&no_device).is_err());

        let blank_field = DraftSnapshot::candidate("alice", "doc", "laptop", fields([(" ", json!(1))]), 1);
        assert!(validate_candidate(&blank_field).is_err());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(DraftError::StorageUnavailable(StoreError::Unavailable("x".into())).is_retryable());
        assert!(DraftError::PersistFailed(DurableError::Write("x".into())).is_retryable());
        assert!(!DraftError::InvalidInput("x".into()).is_retryable());
        assert!(
            !DraftError::NotFound {
                owner_user_id: "a".into(),
                document_id: "d".into()
            }
            .is_retryable()
        );
    }
}
