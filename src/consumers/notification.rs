//! Forwarding of item events to a notification hub.
//!
//! The hub is outside the local database, so the relay runs under a
//! best-effort inbox: a crash after sending and before recording can send a
//! notice twice.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::event::{Event, EventBody, EventId, ItemPayload};
use crate::inbox::SideEffect;
use crate::pipeline::HandlerError;

/// A message pushed to connected clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Notice {
    ItemCreated { event_id: EventId, item: ItemPayload },
    ItemRemoved { event_id: EventId, id: Uuid },
}

/// Destination for notices.
#[async_trait]
pub trait NotificationHub: Send + Sync {
    async fn send(&self, notice: Notice) -> Result<(), HandlerError>;
}

/// In-process hub backed by an unbounded channel.
pub struct ChannelHub {
    sender: mpsc::UnboundedSender<Notice>,
}

impl ChannelHub {
    /// Create a hub and the receiver its notices arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl NotificationHub for ChannelHub {
    async fn send(&self, notice: Notice) -> Result<(), HandlerError> {
        self.sender
            .send(notice)
            .map_err(|_| HandlerError::transient("notification hub is closed"))
    }
}

/// Sends a notice for every created or removed item.
pub struct NotificationRelay {
    hub: Arc<dyn NotificationHub>,
}

impl NotificationRelay {
    pub fn new(hub: Arc<dyn NotificationHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl SideEffect for NotificationRelay {
    async fn apply(&self, event: &Event) -> Result<(), HandlerError> {
        let notice = match &event.body {
            EventBody::Created(item) => Notice::ItemCreated {
                event_id: event.event_id,
                item: item.clone(),
            },
            EventBody::Removed { id } => Notice::ItemRemoved {
                event_id: event.event_id,
                id: *id,
            },
            EventBody::Updated(_) => return Ok(()),
        };

        self.hub.send(notice).await?;
        debug!(event_id = %event.event_id, "Notice sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{now, ItemPatch};

    #[tokio::test]
    async fn test_created_and_removed_are_forwarded() {
        let (hub, mut receiver) = ChannelHub::new();
        let relay = NotificationRelay::new(Arc::new(hub));
        let item = ItemPayload {
            id: Uuid::new_v4(),
            model: "GT".to_string(),
            updated_at: now(),
            ..Default::default()
        };
        let created = Event::created(item.clone());
        let removed = Event::removed(item.id);

        relay.apply(&created).await.unwrap();
        relay.apply(&Event::updated(ItemPatch::from_payload(&item))).await.unwrap();
        relay.apply(&removed).await.unwrap();

        assert_eq!(
            receiver.recv().await,
            Some(Notice::ItemCreated {
                event_id: created.event_id,
                item
            })
        );
        assert!(matches!(receiver.recv().await, Some(Notice::ItemRemoved { .. })));
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_hub_is_transient() {
        let (hub, receiver) = ChannelHub::new();
        drop(receiver);
        let relay = NotificationRelay::new(Arc::new(hub));

        let err = relay.apply(&Event::removed(Uuid::new_v4())).await.unwrap_err();
        assert_eq!(err.kind, crate::pipeline::ErrorKind::Transient);
    }
}
