//! In-memory channel-based broker for single-process deployments.
//!
//! Each (topic, consumer group) pair owns an unbounded mpsc queue. Publishing
//! fans a message out to every group subscribed to the topic; within a group,
//! `concurrency` workers compete for messages. A nacked message is re-queued
//! after `redelivery_delay`, so nothing is ordered within a group.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Broker, BusError, Delivery, Envelope, MessageHandler, Result};
use crate::config::MessagingConfig;
use crate::shutdown::{Shutdown, ShutdownSignal};

/// Configuration for the channel broker.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Workers per consumer group.
    pub concurrency: usize,
    /// Delay before a nacked message is queued again.
    pub redelivery_delay: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::from(&MessagingConfig::default())
    }
}

impl From<&MessagingConfig> for ChannelConfig {
    fn from(config: &MessagingConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            redelivery_delay: config.redelivery_delay(),
        }
    }
}

type Queue = mpsc::UnboundedSender<Arc<Envelope>>;

/// Consumer-group queues of one topic.
#[derive(Default)]
struct TopicQueues {
    groups: HashMap<String, Queue>,
}

/// In-process broker with consumer-group semantics.
pub struct ChannelBroker {
    config: ChannelConfig,
    topics: RwLock<HashMap<String, TopicQueues>>,
    shutdown: Shutdown,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ChannelBroker {
    pub fn new(config: ChannelConfig) -> Self {
        info!(
            concurrency = config.concurrency,
            redelivery_ms = config.redelivery_delay.as_millis() as u64,
            "Channel broker initialized"
        );
        Self {
            config,
            topics: RwLock::new(HashMap::new()),
            shutdown: Shutdown::new(),
            workers: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Consumer groups currently subscribed to `topic`, sorted.
    pub async fn groups(&self, topic: &str) -> Vec<String> {
        let topics = self.topics.read().await;
        let mut groups: Vec<String> = topics
            .get(topic)
            .map(|t| t.groups.keys().cloned().collect())
            .unwrap_or_default();
        groups.sort();
        groups
    }

    /// Stop all workers. In-flight deliveries run to completion first.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        let handles: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("Channel broker stopped");
    }

    fn track(&self, handle: JoinHandle<()>) {
        match self.workers.lock() {
            Ok(mut workers) => workers.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }
}

impl Default for ChannelBroker {
    fn default() -> Self {
        Self::new(ChannelConfig::default())
    }
}

#[async_trait]
impl Broker for ChannelBroker {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(topic = %envelope.topic, message_id = %envelope.message_id))]
    async fn publish(&self, envelope: Envelope) -> Result<()> {
        if self.shutdown.is_triggered() {
            return Err(BusError::Connection("broker is shut down".to_string()));
        }

        let envelope = Arc::new(envelope);
        let topics = self.topics.read().await;
        let Some(queues) = topics.get(&envelope.topic) else {
            debug!("Published message (no consumer groups)");
            return Ok(());
        };

        for (group, queue) in &queues.groups {
            queue.send(envelope.clone()).map_err(|_| {
                BusError::Publish(format!("queue for group {} is closed", group))
            })?;
        }

        debug!(groups = queues.groups.len(), "Published message");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let mut topics = self.topics.write().await;
        let queues = topics.entry(topic.to_string()).or_default();
        if queues.groups.contains_key(group) {
            return Err(BusError::Subscribe(format!(
                "group {} is already subscribed to {}",
                group, topic
            )));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(Mutex::new(receiver));
        queues.groups.insert(group.to_string(), sender.clone());

        for _ in 0..self.config.concurrency {
            let worker = GroupWorker {
                topic: topic.to_string(),
                group: group.to_string(),
                receiver: receiver.clone(),
                requeue: sender.clone(),
                handler: handler.clone(),
                redelivery_delay: self.config.redelivery_delay,
            };
            self.track(tokio::spawn(worker.run(self.shutdown.signal())));
        }

        info!(
            topic = %topic,
            group = %group,
            workers = self.config.concurrency,
            "Consumer group subscribed to channel broker"
        );
        Ok(())
    }
}

/// One competing consumer of a group queue.
struct GroupWorker {
    topic: String,
    group: String,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Arc<Envelope>>>>,
    requeue: Queue,
    handler: Arc<dyn MessageHandler>,
    redelivery_delay: Duration,
}

impl GroupWorker {
    async fn run(self, mut signal: ShutdownSignal) {
        loop {
            let next = {
                let mut receiver = self.receiver.lock().await;
                tokio::select! {
                    biased;
                    _ = signal.cancelled() => None,
                    message = receiver.recv() => message,
                }
            };
            let Some(envelope) = next else {
                break;
            };

            if self.handler.handle(envelope.clone()).await == Delivery::Nack {
                self.schedule_redelivery(envelope, signal.clone());
            }
        }
        debug!(topic = %self.topic, group = %self.group, "Channel worker stopped");
    }

    fn schedule_redelivery(&self, envelope: Arc<Envelope>, mut signal: ShutdownSignal) {
        let requeue = self.requeue.clone();
        let delay = self.redelivery_delay;
        let group = self.group.clone();
        tokio::spawn(async move {
            if !signal.sleep(delay).await {
                return;
            }
            if requeue.send(envelope.clone()).is_err() {
                warn!(
                    group = %group,
                    message_id = %envelope.message_id,
                    "Dropped redelivery, queue closed"
                );
            }
        });
    }
}
