//! BroadcastTransport trait for real-time fan-out to connected devices.
//!
//! Implementations:
//! - `EventBusTransport` - publishes onto an in-process `EventBus`
//! - `ClientRegistry` (in draft-sync-daemon) - WebSocket clients grouped in rooms

use crate::events::{Audience, Delivery, DraftEvent, EventBus};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Send failed: {0}")]
    SendFailed(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Fan-out capability. Delivery is best effort.
#[async_trait]
pub trait BroadcastTransport: Send + Sync {
    /// Deliver to every connected device of a user.
    async fn send_to_user(&self, user_id: &str, event: &DraftEvent) -> Result<()>;

    /// Deliver to every participant of a document.
    async fn broadcast_to_document_room(&self, document_id: &str, event: &DraftEvent)
        -> Result<()>;
}

/// Transport that publishes deliveries on an in-process `EventBus`.
pub struct EventBusTransport {
    bus: Arc<EventBus>,
    /// When false every send fails with `TransportError::Unavailable`
    available: AtomicBool,
}

impl EventBusTransport {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            available: AtomicBool::new(true),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Simulate the transport going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn publish(&self, audience: Audience, event: &DraftEvent) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("event bus transport disabled".into()));
        }
        self.bus.emit(Delivery {
            audience,
            event: event.clone(),
        });
        Ok(())
    }
}

#[async_trait]
impl BroadcastTransport for EventBusTransport {
    async fn send_to_user(&self, user_id: &str, event: &DraftEvent) -> Result<()> {
        self.publish(Audience::User(user_id.to_string()), event)
    }

    async fn broadcast_to_document_room(
        &self,
        document_id: &str,
        event: &DraftEvent,
    ) -> Result<()> {
        self.publish(Audience::DocumentRoom(document_id.to_string()), event)
    }
}
