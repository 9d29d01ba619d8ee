//! A single promotion attempt's view of its partition's replicas.

use std::collections::BTreeSet;
use std::time::Instant;

use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::StoreResult;
use crate::models::{PartitionId, ReplicaId};
use crate::store::{paths, Store, StoreEvent};
use crate::utils;

/// The term of one promotion attempt.
///
/// A term tracks the set of live replicas of its partition for as long as it exists. A new
/// term is started for every attempt, terms are never reused.
pub struct Term {
    pub partition: PartitionId,
    /// The replica being promoted.
    pub candidate: ReplicaId,
    /// The wall clock time at which this term started.
    pub started_at: OffsetDateTime,
    started: Instant,
    replicas_rx: watch::Receiver<BTreeSet<ReplicaId>>,
    handle: JoinHandle<()>,
}

impl Term {
    /// Start a new term, reading and then watching the partition's participants.
    #[tracing::instrument(level = "debug", skip(store))]
    pub async fn start(store: Store, partition: PartitionId, candidate: ReplicaId, whoami: &str) -> StoreResult<Self> {
        let prefix = paths::participants(partition);
        let mut events = store.watch(&prefix)?;
        let initial = Self::read_replicas(&store, &prefix).await?;
        tracing::info!(%partition, %candidate, replicas = ?initial, "{} starting leader promotion", whoami);

        let (tx, replicas_rx) = watch::channel(initial);
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let replica = match utils::parse_key_suffix::<u64>(event.path(), &prefix) {
                    Some(id) => ReplicaId(id),
                    None => continue,
                };
                let changed = tx.send_if_modified(|replicas| match event {
                    StoreEvent::Put { .. } => replicas.insert(replica),
                    StoreEvent::Deleted { .. } => replicas.remove(&replica),
                });
                if changed {
                    tracing::debug!(%partition, %replica, "replica set of promotion term changed");
                }
            }
        });

        Ok(Self {
            partition,
            candidate,
            started_at: OffsetDateTime::now_utc(),
            started: Instant::now(),
            replicas_rx,
            handle,
        })
    }

    async fn read_replicas(store: &Store, prefix: &str) -> StoreResult<BTreeSet<ReplicaId>> {
        Ok(store
            .list(prefix)
            .await?
            .into_iter()
            .filter_map(|(path, _)| utils::parse_key_suffix::<u64>(&path, prefix).map(ReplicaId))
            .collect())
    }

    /// The replicas currently considered live for this partition.
    pub fn interesting_replicas(&self) -> BTreeSet<ReplicaId> {
        self.replicas_rx.borrow().clone()
    }

    /// A channel which observes every change to the set of interesting replicas.
    pub fn replica_changes(&self) -> watch::Receiver<BTreeSet<ReplicaId>> {
        self.replicas_rx.clone()
    }

    /// The time elapsed since this term started.
    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }
}

impl Drop for Term {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
