//! Composition root: builds the registry from a listener file, starts the
//! containers and stops them once the shutdown signal fires.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use kafka_listener_core::{BrokerClientFactory, EndpointRegistry, StopReport};
use tracing::{info, warn};

use crate::config::ListenerFile;

/// Log every container status as one JSON line.
pub fn log_statuses(registry: &EndpointRegistry) {
    for status in registry.statuses() {
        match serde_json::to_string(&status) {
            Ok(json) => info!(target: "kafka_listener::status", "{json}"),
            Err(e) => warn!("Failed to serialize status of '{}': {e}", status.id),
        }
    }
}

/// Run every listener of `file` until `shutdown` completes, then stop all
/// containers within the configured shutdown timeout.
pub async fn run_until<F>(
    file: &ListenerFile,
    broker: Arc<dyn BrokerClientFactory>,
    shutdown: F,
) -> anyhow::Result<Vec<(String, StopReport)>>
where
    F: Future<Output = ()>,
{
    let status_interval = file.status_interval()?;
    let shutdown_timeout = file.shutdown_timeout()?;
    let registry = file.build_registry(broker)?;
    let ids = file.register_all(&registry).await?;
    info!("Registered {} listener containers: {}", ids.len(), ids.join(", "));

    if let Err(e) = registry.start_all().await {
        registry.shutdown(shutdown_timeout).await;
        return Err(e).context("Failed to start listener containers");
    }

    let mut ticker = tokio::time::interval(status_interval);
    // the first tick completes immediately
    ticker.tick().await;
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => log_statuses(&registry),
        }
    }

    info!("Shutting down listener containers");
    let reports = registry.shutdown(shutdown_timeout).await;
    for (id, report) in &reports {
        if report.abandoned > 0 {
            warn!(
                "Container '{id}' abandoned {} sub-units after {:?}",
                report.abandoned, report.elapsed
            );
        }
    }
    log_statuses(&registry);
    Ok(reports)
}
