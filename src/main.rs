//! The partition failover service.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;

use partition_failover::prom::get_metrics_recorder;
use partition_failover::{App, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true)
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    metrics::set_recorder(get_metrics_recorder(&cfg)).context("error setting prometheus metrics recorder")?;
    tracing::info!(
        host_id = cfg.host_id,
        partitions = ?cfg.partitions,
        sites_per_partition = cfg.sites_per_partition,
        storage_data_path = %cfg.storage_data_path,
        "starting partition failover service",
    );
    let res = App::new(cfg).await?.spawn().await.context("error joining app task").and_then(|res| res);

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    res
}
