//! Mock broker implementation for testing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Broker, BusError, Envelope, MessageHandler, Result};

/// Mock broker that records publishes.
///
/// Subscribed handlers are invoked inline on publish so tests can observe
/// consumer effects without background tasks.
#[derive(Default)]
pub struct MockBroker {
    published: RwLock<Vec<Envelope>>,
    fail_on_publish: RwLock<bool>,
    /// Number of upcoming publishes that fail before publishing recovers.
    fail_next: RwLock<usize>,
    handlers: RwLock<HashMap<String, Vec<Arc<dyn MessageHandler>>>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    /// Fail the next `count` publishes, then succeed.
    pub async fn fail_next(&self, count: usize) {
        *self.fail_next.write().await = count;
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn published(&self) -> Vec<Envelope> {
        self.published.read().await.clone()
    }

    pub async fn published_to(&self, topic: &str) -> Vec<Envelope> {
        self.published
            .read()
            .await
            .iter()
            .filter(|e| e.topic == topic)
            .cloned()
            .collect()
    }

    pub async fn take_published(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.published.write().await)
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn publish(&self, envelope: Envelope) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(BusError::Connection("Mock publish failure".to_string()));
        }
        {
            let mut fail_next = self.fail_next.write().await;
            if *fail_next > 0 {
                *fail_next -= 1;
                return Err(BusError::Connection("Mock publish failure".to_string()));
            }
        }

        self.published.write().await.push(envelope.clone());

        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .handlers
            .read()
            .await
            .get(&envelope.topic)
            .cloned()
            .unwrap_or_default();
        let envelope = Arc::new(envelope);
        for handler in handlers {
            handler.handle(envelope.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        _group: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        self.handlers
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(handler);
        Ok(())
    }
}
