//! relaybox: outbox relay, search consumers and fault remediation in one process
//!
//! ## Architecture
//! ```text
//! [items + outbox] --relay--> [ChannelBroker] --> search-item-* groups --> [search index]
//!                                   |         \--> search-notification --> [hub]
//!                                   |
//!                           <group>.fault --> fault remediator --> republish
//! ```
//!
//! ## Configuration
//! - RELAYBOX_CONFIG: Path to a YAML config file (optional)
//! - RELAYBOX__<SECTION>__<KEY>: Override any config value
//! - RELAYBOX_LOG: Log filter (default: info)

use std::sync::Arc;

use tracing::info;

use relaybox::bus::{ChannelBroker, ChannelConfig};
use relaybox::config::Config;
use relaybox::consumers::ChannelHub;
use relaybox::runtime::{SearchService, SourceService};
use relaybox::storage;
use relaybox::utils::bootstrap::{connect_with_retry, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;
    init_tracing(config.log_format);

    let pool = connect_with_retry("storage", || storage::connect(&config.storage)).await?;
    let broker = Arc::new(ChannelBroker::new(ChannelConfig::from(&config.messaging)));

    let (hub, mut notices) = ChannelHub::new();
    let notice_log = tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            info!(?notice, "Notification");
        }
    });

    let search = SearchService::start(&config, broker.clone(), pool.clone(), Arc::new(hub)).await?;
    let source = SourceService::start(&config, broker.clone(), pool.clone()).await?;

    info!(service = %config.service.name, "relaybox started");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    source.shutdown().await;
    search.shutdown().await;
    broker.shutdown().await;
    notice_log.abort();
    pool.close().await;

    info!("relaybox stopped");
    Ok(())
}
