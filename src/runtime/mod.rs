//! Service wiring.
//!
//! `SourceService` runs the owning side: the outbox relay and the fault
//! remediator. `SearchService` runs a downstream service: the search and
//! notification consumer groups behind retry pipelines, plus catch-up
//! reconciliation. Both return a `ServiceHandle` that stops their workers.

use std::sync::Arc;

use futures::future::join_all;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bus::{Broker, BusError, MessageHandler, Topology};
use crate::config::Config;
use crate::consumers::{NotificationHub, NotificationRelay, SearchIndex, SearchProjector};
use crate::event::EventType;
use crate::inbox::{ConsumerTarget, IdempotentConsumer, SqliteInbox};
use crate::outbox::{relay, OutboxRelay, SqliteOutbox};
use crate::pipeline::{RetryPipeline, RetryPolicy};
use crate::reconcile::{self, HttpItemSource, ReconcileError, Reconciler, WatermarkStore};
use crate::remediation::{
    FaultRemediator, ModelPlaceholderRule, RemediationHandler, SqliteFaultLog,
};
use crate::shutdown::{Shutdown, ShutdownSignal};

/// Consumer name of the fault remediator.
pub const REMEDIATION_CONSUMER: &str = "fault-remediation";
/// Consumer name of the notification relay.
pub const NOTIFICATION_CONSUMER: &str = "notification";
/// Consumer name keying the reconciliation watermark.
pub const RECONCILER_CONSUMER: &str = "reconciler";

/// Errors raised while starting a service.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Broker error: {0}")]
    Bus(#[from] BusError),

    #[error("Reconciliation setup failed: {0}")]
    Reconcile(#[from] ReconcileError),
}

/// Running workers of one service.
pub struct ServiceHandle {
    name: &'static str,
    shutdown: Shutdown,
    tasks: Vec<JoinHandle<()>>,
}

impl ServiceHandle {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            shutdown: Shutdown::new(),
            tasks: Vec::new(),
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        self.shutdown.signal()
    }

    /// Signal every worker and wait for the spawned tasks to finish.
    ///
    /// Broker-owned consumer workers are stopped by shutting down the broker.
    pub async fn shutdown(self) {
        self.shutdown.trigger();
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                warn!(service = self.name, error = %e, "Worker task failed");
            }
        }
        info!(service = self.name, "Service stopped");
    }
}

/// The owning service: relays its outbox and remediates downstream faults.
pub struct SourceService;

impl SourceService {
    pub async fn start(
        config: &Config,
        broker: Arc<dyn Broker>,
        pool: SqlitePool,
    ) -> Result<ServiceHandle, RuntimeError> {
        let mut handle = ServiceHandle::new("source");
        let topology = Topology::from_config(config);

        let relay = Arc::new(OutboxRelay::new(
            SqliteOutbox::new(pool.clone()),
            broker.clone(),
            &config.outbox,
            topology.clone(),
        ));
        handle.tasks.push(relay::spawn(relay, handle.signal()));

        let remediator = FaultRemediator::new(
            broker.clone(),
            topology.clone(),
            SqliteFaultLog::new(pool.clone()),
        )
        .with_rule(ModelPlaceholderRule::from(&config.remediation));
        let group = topology.group(REMEDIATION_CONSUMER);
        let handler: Arc<dyn MessageHandler> = Arc::new(RemediationHandler::new(
            Arc::new(remediator),
            SqliteInbox::new(pool),
            group.clone(),
        ));
        for faulted_group in &config.remediation.groups {
            broker
                .subscribe(&Topology::fault_topic(faulted_group), &group, handler.clone())
                .await?;
        }

        info!(
            fault_groups = config.remediation.groups.len(),
            remediation_group = %group,
            "Source service started"
        );
        Ok(handle)
    }
}

/// A downstream service: search index, notifications and reconciliation.
pub struct SearchService;

impl SearchService {
    pub async fn start(
        config: &Config,
        broker: Arc<dyn Broker>,
        pool: SqlitePool,
        hub: Arc<dyn NotificationHub>,
    ) -> Result<ServiceHandle, RuntimeError> {
        let mut handle = ServiceHandle::new("search");
        let topology = Topology::from_config(config);
        let policy = RetryPolicy::from(&config.retry);
        let index = SearchIndex::new(pool.clone());

        let projector = Arc::new(
            SearchProjector::new(index.clone()).rejecting_model(&config.remediation.rejected_model),
        );
        for event_type in EventType::ALL {
            let group = topology.event_group(event_type);
            let consumer = IdempotentConsumer::new(
                group.clone(),
                pool.clone(),
                ConsumerTarget::Store(projector.clone()),
            );
            let pipeline =
                RetryPipeline::new(Arc::new(consumer), broker.clone(), policy.clone(), handle.signal());
            broker
                .subscribe(&topology.topic(event_type), &group, Arc::new(pipeline))
                .await?;
        }

        let group = topology.group(NOTIFICATION_CONSUMER);
        let consumer = IdempotentConsumer::new(
            group.clone(),
            pool.clone(),
            ConsumerTarget::External(Arc::new(NotificationRelay::new(hub))),
        );
        let pipeline: Arc<dyn MessageHandler> = Arc::new(RetryPipeline::new(
            Arc::new(consumer),
            broker.clone(),
            policy,
            handle.signal(),
        ));
        for event_type in [EventType::Created, EventType::Removed] {
            broker
                .subscribe(&topology.topic(event_type), &group, pipeline.clone())
                .await?;
        }

        if config.reconciliation.enabled {
            let reconciler = Reconciler::new(
                topology.group(RECONCILER_CONSUMER),
                Arc::new(HttpItemSource::from_config(&config.reconciliation)?),
                index,
                WatermarkStore::new(pool),
                config.reconciliation.retry_interval(),
            );
            handle
                .tasks
                .push(reconcile::spawn(Arc::new(reconciler), handle.signal()));
        }

        info!(
            service = %topology.service(),
            reconciliation = config.reconciliation.enabled,
            "Search service started"
        );
        Ok(handle)
    }
}
