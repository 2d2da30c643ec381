//! Shared utilities for integration tests.
//!
//! Every test runs against its own in-memory SQLite database and in-process
//! channel broker.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use relaybox::bus::{ChannelBroker, ChannelConfig};
use relaybox::config::Config;
use relaybox::consumers::{ChannelHub, Notice};
use relaybox::event::ItemPayload;
use relaybox::runtime::{SearchService, ServiceHandle, SourceService};
use relaybox::storage::connect_in_memory;

/// Default wait for asynchronous effects.
pub const WAIT: Duration = Duration::from_secs(5);

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// An item as a client would submit it.
pub fn new_item(model: &str) -> ItemPayload {
    ItemPayload {
        id: Uuid::new_v4(),
        seller: "alice".to_string(),
        make: "Ford".to_string(),
        model: model.to_string(),
        year: 2020,
        color: "Red".to_string(),
        mileage: 1000,
        ..Default::default()
    }
}

/// Both services running over one database and one broker.
pub struct Harness {
    pub config: Config,
    pub pool: SqlitePool,
    pub broker: Arc<ChannelBroker>,
    pub notices: UnboundedReceiver<Notice>,
    source: ServiceHandle,
    search: ServiceHandle,
}

impl Harness {
    pub async fn start() -> Self {
        Self::start_with(Config::for_test()).await
    }

    pub async fn start_with(config: Config) -> Self {
        let pool = connect_in_memory().await.unwrap();
        let broker = Arc::new(ChannelBroker::new(ChannelConfig::from(&config.messaging)));
        let (hub, notices) = ChannelHub::new();

        let search = SearchService::start(&config, broker.clone(), pool.clone(), Arc::new(hub))
            .await
            .unwrap();
        let source = SourceService::start(&config, broker.clone(), pool.clone())
            .await
            .unwrap();

        Self {
            config,
            pool,
            broker,
            notices,
            source,
            search,
        }
    }

    pub async fn stop(self) {
        self.source.shutdown().await;
        self.search.shutdown().await;
        self.broker.shutdown().await;
    }
}
