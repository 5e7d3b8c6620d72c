//! courier-standalone: in-process integration host
//!
//! Hosts the broker, event store, outbox and saga orchestration in a single
//! process until Ctrl+C.
//!
//! ## Usage
//! ```text
//! courier-standalone [config.yaml]
//! ```
//!
//! ## Configuration
//! ```yaml
//! broker:
//!   default_max_retries: 3
//!   retry_base_delay_ms: 100
//!   retry_max_delay_ms: 30000
//! outbox:
//!   max_retries: 5
//!   poll_interval_ms: 1000
//!   purge_after_hours: 24
//!   route:
//!     type: aggregate_type
//! saga:
//!   step_timeout_ms: 30000
//! ```
//!
//! Every key can be overridden with `COURIER__<SECTION>__<KEY>`.

use std::time::Duration;

use tracing::{debug, error, info};

use courier::config::Config;
use courier::standalone::IntegrationRuntime;
use courier::utils::bootstrap::init_tracing;

/// How often published outbox entries are checked for purging.
const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref()).map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;
    let effective = config.to_yaml()?;
    debug!(config = %effective, "Effective configuration");

    let runtime = IntegrationRuntime::new(config);
    runtime.start().await;

    info!("courier-standalone running, press Ctrl+C to exit");

    let mut purge = tokio::time::interval(PURGE_INTERVAL);
    // first tick completes immediately
    purge.tick().await;

    loop {
        tokio::select! {
            _ = purge.tick() => {
                let purged = runtime.purge_outbox().await;
                if purged > 0 {
                    info!(purged, "Purged published outbox entries");
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    info!("Shutting down");
    runtime.shutdown().await;

    let stats = runtime.broker().get_stats().await;
    info!(
        sent = stats.messages_sent,
        received = stats.messages_received,
        failed = stats.messages_failed,
        dead_lettered = stats.messages_dlq,
        "Broker totals"
    );
    Ok(())
}
