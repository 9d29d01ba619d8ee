use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::execution::{ExecutionSite, ExportMastership};
use crate::initiator::{InitiatorConfig, PartitionInitiator};
use crate::models::{PartitionId, ReplicaId};
use crate::prom::spawn_prom_server;
use crate::site::MemorySite;
use crate::store::{paths, CoordinationStore, NodeMode, Precondition, SledStore};
use crate::transport::LoopbackTransport;

/// The application object for when the failover service is running as a server.
pub struct App {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The root session of the coordination store, which owns this host's registration.
    store: SledStore,
    /// The initiators of every replica hosted on this node.
    initiators: Vec<PartitionInitiator>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the metrics server.
    metrics_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(10);
        let store = SledStore::new(config.clone()).await.context("error opening coordination store")?;
        store
            .put(&paths::host(config.host_id), vec![], Precondition::Any, NodeMode::Ephemeral)
            .await
            .context("error registering host")?;

        let transport = LoopbackTransport::new();
        let export: Arc<dyn ExportMastership> = Arc::new(LoggingExport);
        let mut initiators = vec![];
        for partition in config.partitions.iter().copied() {
            for site_id in 0..config.sites_per_partition {
                let replica = ReplicaId::new(config.host_id, site_id);
                let site: Arc<dyn ExecutionSite> = Arc::new(MemorySite::new(partition, replica));
                transport.register(partition, replica, site.clone());
                initiators.push(PartitionInitiator::new(
                    InitiatorConfig::new(&config, partition, replica),
                    Arc::new(store.new_session()),
                    site,
                    Arc::new(transport.clone()),
                    export.clone(),
                    shutdown_tx.clone(),
                ));
            }
        }

        let metrics_server = spawn_prom_server(&config, shutdown_tx.subscribe());

        Ok(Self {
            config,
            store,
            initiators,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            metrics_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        for initiator in self.initiators.iter() {
            // A failed configure records a fatal error & triggers shutdown itself.
            if initiator.configure().await.is_err() {
                break;
            }
        }
        tracing::info!(
            host_id = self.config.host_id,
            replicas = self.initiators.len(),
            "partition initiators configured"
        );

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("failover service is shutting down");
        for initiator in self.initiators.iter() {
            initiator.shutdown().await;
        }
        if let Err(err) = self.store.close().await {
            tracing::error!(error = ?err, "error closing coordination store root session");
        }
        if let Err(err) = self.store.flush().await {
            tracing::error!(error = ?err, "error flushing coordination store");
        }
        if let Err(err) = self.metrics_server.await.context("error joining metrics server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down metrics server");
        }

        let fatal: Vec<_> = self
            .initiators
            .iter()
            .filter_map(|initiator| initiator.fatal_error().map(|err| (initiator.partition(), err)))
            .collect();
        if let Some((partition, err)) = fatal.first() {
            anyhow::bail!("partition {} failed: {}", partition, err);
        }
        tracing::debug!("failover service shutdown complete");
        Ok(())
    }
}

/// An export subsystem which only logs the mastership it is handed.
struct LoggingExport;

impl ExportMastership for LoggingExport {
    fn accept_mastership(&self, partition: PartitionId) -> Result<()> {
        tracing::info!(%partition, "accepted export mastership");
        Ok(())
    }
}
