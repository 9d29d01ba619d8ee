//! Appointment of partition leaders on failure.
//!
//! Every replica of a partition runs an appointer. When the partition has no appointee, or its
//! appointee's participant node has disappeared, each appointer proposes the lowest surviving
//! replica through a conditional write against the version of the entry it observed. The store
//! lets exactly one of those writes through, the others observe a conflict and stand down.

use std::collections::BTreeSet;

use anyhow::Result;
use futures::prelude::*;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::{StoreError, StoreResult};
use crate::models::{LeaderAssignment, PartitionId, ReplicaId};
use crate::store::{paths, NodeMode, Precondition, Store, StoreEvent};
use crate::utils;

const METRIC_APPOINTMENTS: &str = "failover_leader_appointments";

/// A task which appoints a new leader whenever its partition's leader disappears.
pub struct LeaderAppointer {
    store: Store,
    partition: PartitionId,
    /// The replica running this appointer.
    replica: ReplicaId,
    participants: mpsc::Receiver<StoreEvent>,
    appointees: mpsc::Receiver<StoreEvent>,
    /// A channel used for triggering graceful shutdown.
    shutdown: BroadcastStream<()>,
}

impl LeaderAppointer {
    /// Create a new instance, subscribing to the partition's participants & appointee.
    pub fn new(store: Store, partition: PartitionId, replica: ReplicaId, shutdown: broadcast::Receiver<()>) -> StoreResult<Self> {
        metrics::register_counter!(METRIC_APPOINTMENTS, metrics::Unit::Count, "leaders appointed by this node");
        let participants = store.watch(&paths::participants(partition))?;
        let appointees = store.watch(&paths::leader(paths::LEADERS, partition))?;
        Ok(Self {
            store,
            partition,
            replica,
            participants,
            appointees,
            shutdown: BroadcastStream::new(shutdown),
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(partition = %self.partition, replica = %self.replica, "leader appointer initialized");
        self.check().await;
        let appointee_path = paths::leader(paths::LEADERS, self.partition);
        loop {
            tokio::select! {
                Some(_) = self.participants.recv() => self.check().await,
                Some(event) = self.appointees.recv() => {
                    // The prefix of one partition's entry also matches longer partition ids.
                    if event.path() == appointee_path {
                        self.check().await;
                    }
                }
                _ = self.shutdown.next() => break,
            }
        }
        Ok(())
    }

    /// Check the partition's appointee, appointing a new one if needed.
    async fn check(&mut self) {
        if let Err(err) = self.try_appoint().await {
            match err {
                StoreError::WriteConflict { .. } => {
                    tracing::debug!(partition = %self.partition, "leader appointment lost to a concurrent writer");
                }
                StoreError::SessionClosed => (),
                err => tracing::error!(error = ?err, partition = %self.partition, "error appointing partition leader"),
            }
        }
    }

    async fn try_appoint(&self) -> StoreResult<()> {
        let prefix = paths::participants(self.partition);
        let participants: BTreeSet<ReplicaId> = self
            .store
            .list(&prefix)
            .await?
            .into_iter()
            .filter_map(|(path, _)| utils::parse_key_suffix::<u64>(&path, &prefix).map(ReplicaId))
            .collect();

        let path = paths::leader(paths::LEADERS, self.partition);
        let precondition = match self.store.get(&path).await? {
            Some(node) => match utils::decode_model::<LeaderAssignment>(&node.data) {
                Ok(assignment) if participants.contains(&assignment.leader) => return Ok(()),
                Ok(assignment) => {
                    tracing::info!(partition = %self.partition, leader = %assignment.leader, "appointed leader is no longer live");
                    Precondition::Version(node.version)
                }
                Err(err) => {
                    tracing::warn!(error = ?err, partition = %self.partition, "replacing malformed appointee entry");
                    Precondition::Version(node.version)
                }
            },
            None => Precondition::Absent,
        };

        let candidate = match participants.iter().next() {
            Some(candidate) => *candidate,
            None => {
                tracing::warn!(partition = %self.partition, "no live replicas to appoint as leader");
                return Ok(());
            }
        };
        let data = utils::encode_model(&LeaderAssignment::new(self.partition, candidate)).map_err(StoreError::CoordinationUnavailable)?;
        self.store.put(&path, data, precondition, NodeMode::Persistent).await?;
        metrics::increment_counter!(METRIC_APPOINTMENTS);
        tracing::info!(partition = %self.partition, leader = %candidate, "appointed new partition leader");
        Ok(())
    }
}
