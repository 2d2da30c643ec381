//! Background relay from the outbox to the broker.
//!
//! Each poll reads the oldest pending records, publishes them in order and
//! marks each delivered once the broker accepted it. The first publish failure
//! ends the poll so later records never overtake an earlier one; the failed
//! record stays pending and is retried on the next poll.
//!
//! Several relays may poll the same outbox. A record can then be published
//! more than once, but `mark_delivered` is a compare-and-set so exactly one
//! relay records the delivery. Consumers de-duplicate by event id.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{OutboxRecord, SqliteOutbox};
use crate::bus::{Broker, Envelope, Topology};
use crate::config::OutboxConfig;
use crate::shutdown::ShutdownSignal;
use crate::storage::Result;

/// Counts from one relay poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    /// Records the broker accepted.
    pub published: usize,
    /// Published records this relay marked delivered.
    pub marked: usize,
    /// Published records another relay had already marked.
    pub lost_race: usize,
    /// Records whose publish failed (at most one per poll).
    pub failed: usize,
}

/// Drains pending outbox records to the broker.
pub struct OutboxRelay {
    outbox: SqliteOutbox,
    broker: Arc<dyn Broker>,
    topology: Topology,
    batch_size: u32,
    poll_interval: Duration,
}

impl OutboxRelay {
    pub fn new(
        outbox: SqliteOutbox,
        broker: Arc<dyn Broker>,
        config: &OutboxConfig,
        topology: Topology,
    ) -> Self {
        Self {
            outbox,
            broker,
            topology,
            batch_size: config.batch_size.max(1),
            poll_interval: config.poll_interval(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Run one poll.
    pub async fn run_once(&self) -> Result<RelayReport> {
        let batch = self.outbox.pending_batch(self.batch_size).await?;
        let mut report = RelayReport::default();

        for record in batch {
            let envelope = self.envelope(&record);
            if let Err(e) = self.broker.publish(envelope).await {
                warn!(
                    event_id = %record.event_id,
                    attempts = record.attempts + 1,
                    error = %e,
                    "Outbox publish failed, stopping batch"
                );
                self.outbox
                    .record_failure(record.event_id, &e.to_string())
                    .await?;
                report.failed += 1;
                break;
            }
            report.published += 1;

            if self.outbox.mark_delivered(record.event_id).await? {
                report.marked += 1;
                debug!(event_id = %record.event_id, "Outbox record delivered");
            } else {
                report.lost_race += 1;
                debug!(
                    event_id = %record.event_id,
                    "Outbox record already delivered by another relay"
                );
            }
        }

        if report.published > 0 || report.failed > 0 {
            info!(
                published = report.published,
                marked = report.marked,
                lost_race = report.lost_race,
                failed = report.failed,
                "Outbox relay poll complete"
            );
        }
        Ok(report)
    }

    fn envelope(&self, record: &OutboxRecord) -> Envelope {
        Envelope {
            message_id: record.event_id,
            topic: self.topology.topic(record.event_type),
            body: record.event_data.clone().into_bytes(),
        }
    }
}

/// Spawn a task that polls the outbox until shutdown.
///
/// The first poll runs immediately. A failing poll is logged and retried on
/// the next interval.
pub fn spawn(relay: Arc<OutboxRelay>, mut shutdown: ShutdownSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_ms = relay.poll_interval.as_millis() as u64,
            "Outbox relay started"
        );

        loop {
            if shutdown.is_shutdown() {
                break;
            }
            if let Err(e) = relay.run_once().await {
                error!(error = %e, "Outbox relay poll failed");
            }
            if !shutdown.sleep(relay.poll_interval).await {
                break;
            }
        }

        info!("Outbox relay stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBroker;
    use crate::event::{Event, EventType};
    use crate::shutdown::Shutdown;
    use crate::storage::connect_in_memory;
    use sqlx::SqlitePool;
    use uuid::Uuid;

    async fn stage(pool: &SqlitePool, event: &Event) {
        let mut tx = pool.begin().await.unwrap();
        SqliteOutbox::enqueue(&mut *tx, event).await.unwrap();
        tx.commit().await.unwrap();
    }

    fn relay(pool: &SqlitePool, broker: Arc<MockBroker>) -> OutboxRelay {
        OutboxRelay::new(
            SqliteOutbox::new(pool.clone()),
            broker,
            &OutboxConfig {
                poll_interval_ms: 10,
                batch_size: 100,
            },
            Topology::new("source", "items"),
        )
    }

    #[tokio::test]
    async fn test_run_once_publishes_in_order_and_marks() {
        let pool = connect_in_memory().await.unwrap();
        let broker = Arc::new(MockBroker::new());
        let events = vec![
            Event::removed(Uuid::new_v4()),
            Event::removed(Uuid::new_v4()),
            Event::removed(Uuid::new_v4()),
        ];
        for event in &events {
            stage(&pool, event).await;
        }

        let report = relay(&pool, broker.clone()).run_once().await.unwrap();

        assert_eq!(report.published, 3);
        assert_eq!(report.marked, 3);
        let published = broker.published().await;
        let ids: Vec<_> = published.iter().map(|e| e.message_id).collect();
        let expected: Vec<_> = events.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, expected);
        assert_eq!(published[0].topic, "items.removed");
        assert_eq!(published[0].decode_event().unwrap(), events[0]);
        assert_eq!(SqliteOutbox::new(pool).count_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failure_stops_batch_and_keeps_order() {
        let pool = connect_in_memory().await.unwrap();
        let broker = Arc::new(MockBroker::new());
        let first = Event::removed(Uuid::new_v4());
        let second = Event::removed(Uuid::new_v4());
        stage(&pool, &first).await;
        stage(&pool, &second).await;

        broker.fail_next(1).await;
        let relay = relay(&pool, broker.clone());
        let report = relay.run_once().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.published, 0);
        let outbox = SqliteOutbox::new(pool.clone());
        let record = outbox.get(first.event_id).await.unwrap().unwrap();
        assert_eq!(record.attempts, 1);
        assert!(record.last_error.is_some());

        let report = relay.run_once().await.unwrap();
        assert_eq!(report.published, 2);
        let ids: Vec<_> = broker
            .published()
            .await
            .iter()
            .map(|e| e.message_id)
            .collect();
        assert_eq!(ids, vec![first.event_id, second.event_id]);
    }

    #[tokio::test]
    async fn test_racing_relays_mark_once() {
        let pool = connect_in_memory().await.unwrap();
        let event = Event::removed(Uuid::new_v4());
        stage(&pool, &event).await;

        // Both relays observed the record as pending; the second loses the CAS.
        let outbox = SqliteOutbox::new(pool.clone());
        let snapshot = outbox.pending_batch(10).await.unwrap();
        assert_eq!(snapshot.len(), 1);

        let winner = relay(&pool, Arc::new(MockBroker::new()))
            .run_once()
            .await
            .unwrap();
        assert_eq!(winner.marked, 1);
        assert!(!outbox.mark_delivered(snapshot[0].event_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_topic_follows_event_type() {
        let pool = connect_in_memory().await.unwrap();
        let broker = Arc::new(MockBroker::new());
        let event = Event::removed(Uuid::new_v4());
        stage(&pool, &event).await;

        relay(&pool, broker.clone()).run_once().await.unwrap();

        let topology = Topology::new("source", "items");
        assert_eq!(
            broker.published_to(&topology.topic(EventType::Removed)).await.len(),
            1
        );
    }

    #[tokio::test]
    async fn test_spawned_relay_stops_on_shutdown() {
        let pool = connect_in_memory().await.unwrap();
        let broker = Arc::new(MockBroker::new());
        let shutdown = Shutdown::new();
        let handle = spawn(Arc::new(relay(&pool, broker.clone())), shutdown.signal());

        stage(&pool, &Event::removed(Uuid::new_v4())).await;
        for _ in 0..100 {
            if broker.published_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(broker.published_count().await, 1);

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
