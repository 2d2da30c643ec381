//! Broker abstraction for async delivery.
//!
//! This module contains:
//! - `Broker` trait: topic publish and consumer-group subscribe
//! - `MessageHandler` trait: for processing delivered messages
//! - `Envelope`: the wire message (id, topic, serialized body)
//! - `Topology`: deterministic topic and consumer-group naming
//! - Implementations: in-process channel broker, mock
//!
//! Delivery is at-least-once. Nothing is ordered across topics or across the
//! members of a consumer group, so handlers must tolerate duplicates and
//! out-of-order arrival (an `Updated` may be seen before its `Created`).

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::event::{Event, EventId};

pub mod channel;
pub mod mock;
mod topology;

pub use channel::{ChannelBroker, ChannelConfig};
pub use mock::MockBroker;
pub use topology::Topology;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A message as carried by the broker.
///
/// `message_id` is unique per message and is the de-duplication key on the
/// consumer side. For event messages it equals the event's `EventId`.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message_id: EventId,
    pub topic: String,
    pub body: Vec<u8>,
}

impl Envelope {
    /// Build an envelope for an event.
    pub fn for_event(topic: impl Into<String>, event: &Event) -> Result<Self> {
        Ok(Self {
            message_id: event.event_id,
            topic: topic.into(),
            body: serde_json::to_vec(event)?,
        })
    }

    /// Build an envelope for any serializable message under a given id.
    pub fn for_message<T: Serialize>(
        topic: impl Into<String>,
        message_id: EventId,
        message: &T,
    ) -> Result<Self> {
        Ok(Self {
            message_id,
            topic: topic.into(),
            body: serde_json::to_vec(message)?,
        })
    }

    /// Decode the body as an event.
    pub fn decode_event(&self) -> std::result::Result<Event, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Handler verdict for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Processed (or deliberately routed elsewhere); remove from the queue.
    Ack,
    /// Not processed; the broker redelivers it later.
    Nack,
}

/// Handler for messages delivered to a consumer group.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: Arc<Envelope>) -> Delivery;
}

/// Interface for the pub/sub transport.
///
/// Implementations:
/// - `ChannelBroker`: in-process queues, one per (topic, consumer group)
/// - `MockBroker`: records publishes for testing
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a message. `Ok` means the broker accepted it.
    async fn publish(&self, envelope: Envelope) -> Result<()>;

    /// Subscribe a consumer group to a topic.
    ///
    /// Every group receives its own copy of each message; members of one group
    /// compete for messages.
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ItemPayload, EventBody};
    use uuid::Uuid;

    #[test]
    fn test_event_envelope_uses_event_id() {
        let event = Event::new(EventBody::Removed { id: Uuid::new_v4() });
        let envelope = Envelope::for_event("items.removed", &event).unwrap();

        assert_eq!(envelope.message_id, event.event_id);
        assert_eq!(envelope.decode_event().unwrap(), event);
    }

    #[test]
    fn test_malformed_body_fails_to_decode() {
        let envelope = Envelope {
            message_id: EventId::new(),
            topic: "items.created".to_string(),
            body: b"{not json".to_vec(),
        };
        assert!(envelope.decode_event().is_err());
    }

    #[test]
    fn test_message_envelope_keeps_given_id() {
        let id = EventId::new();
        let payload = ItemPayload::default();
        let envelope = Envelope::for_message("x.fault", id, &payload).unwrap();
        assert_eq!(envelope.message_id, id);
    }
}
