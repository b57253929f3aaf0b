//! Event infrastructure for draft-sync-core.
//!
//! Provides `DraftEvent`, the payload fanned out to other participants, and
//! `EventBus` for in-process subscriptions (used by `EventBusTransport`).

use crate::clock::Timestamp;
use crate::snapshot::DraftSnapshot;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Lock transition carried by a `field_lock` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockAction {
    Lock,
    Unlock,
}

/// State change broadcast to the other devices and editors of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum DraftEvent {
    /// A proposal was accepted; carries the full new snapshot.
    DraftSync {
        document_id: String,
        /// User whose device proposed the write; the device is
        /// `snapshot.originDeviceId`
        origin_user_id: String,
        snapshot: DraftSnapshot,
    },
    /// A field lock was granted or released.
    FieldLock {
        document_id: String,
        field: String,
        action: LockAction,
        user_id: String,
        device_id: String,
        timestamp: Timestamp,
    },
    /// An editor started or stopped typing in a field.
    TypingIndicator {
        document_id: String,
        field: String,
        user_id: String,
        device_id: String,
        is_typing: bool,
        timestamp: Timestamp,
    },
}

impl DraftEvent {
    pub fn document_id(&self) -> &str {
        match self {
            DraftEvent::DraftSync { document_id, .. }
            | DraftEvent::FieldLock { document_id, .. }
            | DraftEvent::TypingIndicator { document_id, .. } => document_id,
        }
    }

    /// `(userId, deviceId)` whose action produced the event, so that device
    /// can skip its own echo.
    pub fn origin(&self) -> (&str, &str) {
        match self {
            DraftEvent::DraftSync {
                origin_user_id,
                snapshot,
                ..
            } => (origin_user_id, &snapshot.origin_device_id),
            DraftEvent::FieldLock {
                user_id, device_id, ..
            }
            | DraftEvent::TypingIndicator {
                user_id, device_id, ..
            } => (user_id, device_id),
        }
    }
}

/// Who an event is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// Every connected device of one user
    User(String),
    /// Every participant of one document
    DocumentRoom(String),
}

/// An addressed event as published on the `EventBus`.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub audience: Audience,
    pub event: DraftEvent,
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(Delivery) + Send + Sync>;

/// Event bus for publishing deliveries to in-process subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to deliveries. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(Delivery) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds a read lock
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Emit a delivery to all subscribers.
    pub fn emit(&self, delivery: Delivery) {
        // Clone the list so a callback may subscribe without deadlocking
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(delivery.clone());
        }
    }
}
