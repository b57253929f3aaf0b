//! Broadcast Dispatcher: turns accepted state transitions into `DraftEvent`s.
//!
//! Fan-out is notification only. A transport failure is logged and swallowed;
//! it never rolls back the snapshot write or lock grant that triggered it.

use crate::clock::Timestamp;
use crate::events::{DraftEvent, LockAction};
use crate::snapshot::DraftSnapshot;
use crate::transport::BroadcastTransport;
use tracing::{debug, warn};

pub struct Dispatcher<T: BroadcastTransport> {
    transport: T,
}

impl<T: BroadcastTransport> Dispatcher<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// An accepted snapshot: the owner's other devices and the document room.
    pub async fn draft_updated(&self, snapshot: &DraftSnapshot, origin_user_id: &str) {
        let event = DraftEvent::DraftSync {
            document_id: snapshot.document_id.clone(),
            origin_user_id: origin_user_id.to_string(),
            snapshot: snapshot.clone(),
        };
        if let Err(e) = self
            .transport
            .send_to_user(&snapshot.owner_user_id, &event)
            .await
        {
            warn!(
                "Failed to notify {} of draft {} v{}: {}",
                snapshot.owner_user_id, snapshot.document_id, snapshot.version, e
            );
        }
        self.to_room(&event).await;
    }

    pub async fn field_lock_changed(
        &self,
        document_id: &str,
        field: &str,
        action: LockAction,
        user_id: &str,
        device_id: &str,
        timestamp: Timestamp,
    ) {
        self.to_room(&DraftEvent::FieldLock {
            document_id: document_id.to_string(),
            field: field.to_string(),
            action,
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            timestamp,
        })
        .await;
    }

    pub async fn typing_changed(
        &self,
        document_id: &str,
        field: &str,
        user_id: &str,
        device_id: &str,
        is_typing: bool,
        timestamp: Timestamp,
    ) {
        self.to_room(&DraftEvent::TypingIndicator {
            document_id: document_id.to_string(),
            field: field.to_string(),
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            is_typing,
            timestamp,
        })
        .await;
    }

    async fn to_room(&self, event: &DraftEvent) {
        let document_id = event.document_id();
        match self
            .transport
            .broadcast_to_document_room(document_id, event)
            .await
        {
            Ok(()) => debug!("Broadcast {} event to room {}", kind(event), document_id),
            Err(e) => warn!(
                "Failed to broadcast {} event to room {}: {}",
                kind(event),
                document_id,
                e
            ),
        }
    }
}

fn kind(event: &DraftEvent) -> &'static str {
    match event {
        DraftEvent::DraftSync { .. } => "draft_sync",
        DraftEvent::FieldLock { .. } => "field_lock",
        DraftEvent::TypingIndicator { .. } => "typing_indicator",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Audience, Delivery, EventBus};
    use crate::snapshot::fields;
    use crate::transport::EventBusTransport;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn collect(bus: &Arc<EventBus>) -> (Arc<Mutex<Vec<Delivery>>>, crate::events::Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let sub = bus.subscribe(move |d| seen_clone.lock().unwrap().push(d));
        (seen, sub)
    }

    fn snapshot() -> DraftSnapshot {
        DraftSnapshot {
            owner_user_id: "alice".into(),
            document_id: "doc".into(),
            fields: fields([("title", json!("X"))]),
            version: 2,
            last_modified_at: 10,
            origin_device_id: "laptop".into(),
        }
    }

    #[tokio::test]
    async fn test_draft_update_reaches_owner_and_room() {
        let bus = Arc::new(EventBus::new());
        let (seen, _sub) = collect(&bus);
        let dispatcher = Dispatcher::new(EventBusTransport::new(bus));

        dispatcher.draft_updated(&snapshot(), "bob").await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].event.origin(), ("bob", "laptop"));
        assert_eq!(seen[0].audience, Audience::User("alice".into()));
        assert_eq!(seen[1].audience, Audience::DocumentRoom("doc".into()));
        assert!(matches!(
            &seen[1].event,
            DraftEvent::DraftSync { snapshot, .. } if snapshot.version == 2
        ));
    }

    #[tokio::test]
    async fn test_transport_failure_is_swallowed() {
        let bus = Arc::new(EventBus::new());
        let (seen, _sub) = collect(&bus);
        let transport = EventBusTransport::new(bus);
        transport.set_available(false);
        let dispatcher = Dispatcher::new(transport);

        // Must not panic or propagate
        dispatcher
            .typing_changed("doc", "title", "alice", "laptop", true, 1)
            .await;

        assert!(seen.lock().unwrap().is_empty());
    }
}
