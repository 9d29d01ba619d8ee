//! The repair handshake run by a promoting leader.
//!
//! Every interesting replica is asked for its highest durable transaction and the entries it
//! holds which are not yet durable. The union of those logs is the history the new leader must
//! preserve: the highest transaction found anywhere in it is the consistent cut, and every
//! replica is sent the entries it is missing above its own durable point before the cut is
//! handed back to the initiator.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::error::{CancelReason, RepairError};
use crate::models::{PartitionId, ReplicaId, TxnId};
use crate::term::Term;

/// A transaction held in a replica's log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairLogEntry {
    pub txn_id: TxnId,
    pub payload: Vec<u8>,
}

/// A replica's answer to a repair log request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairResponse {
    pub replica: ReplicaId,
    pub highest_durable: TxnId,
    pub in_flight: Vec<RepairLogEntry>,
}

/// The outcome of a successful repair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RepairResult {
    pub highest_safe_txn: TxnId,
}

/// The channel over which a promoting leader talks to the replicas of its partition.
#[async_trait]
pub trait ReplicaTransport: Send + Sync + 'static {
    /// Request the repair log of a replica.
    async fn request_repair_log(&self, partition: PartitionId, replica: ReplicaId) -> anyhow::Result<RepairResponse>;

    /// Send the entries a replica is missing.
    async fn send_repair(&self, partition: PartitionId, replica: ReplicaId, entries: Vec<RepairLogEntry>) -> anyhow::Result<()>;
}

/// The plan computed from the responses of all replicas.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepairPlan {
    pub highest_safe_txn: TxnId,
    /// The entries each replica is missing, only replicas missing something are present.
    pub missing: BTreeMap<ReplicaId, Vec<RepairLogEntry>>,
}

/// Compute the consistent cut & the entries each replica is missing.
pub fn compute_repair(responses: &[RepairResponse]) -> RepairPlan {
    let mut union: BTreeMap<TxnId, &RepairLogEntry> = BTreeMap::new();
    let mut highest_safe_txn = 0;
    for response in responses {
        highest_safe_txn = highest_safe_txn.max(response.highest_durable);
        for entry in response.in_flight.iter() {
            union.entry(entry.txn_id).or_insert(entry);
        }
    }
    if let Some(highest) = union.keys().next_back() {
        highest_safe_txn = highest_safe_txn.max(*highest);
    }

    let mut missing = BTreeMap::new();
    for response in responses {
        let held: BTreeSet<TxnId> = response.in_flight.iter().map(|entry| entry.txn_id).collect();
        let entries: Vec<_> = union
            .range((Bound::Excluded(response.highest_durable), Bound::Unbounded))
            .filter(|(txn_id, _)| !held.contains(txn_id))
            .map(|(_, entry)| (*entry).clone())
            .collect();
        if !entries.is_empty() {
            missing.insert(response.replica, entries);
        }
    }
    RepairPlan { highest_safe_txn, missing }
}

/// Runs the repair handshake of one promotion attempt.
pub struct RepairCoordinator {
    transport: Arc<dyn ReplicaTransport>,
    partition: PartitionId,
    whoami: String,
    /// The bound on a single round trip to a replica.
    round_trip_timeout: Duration,
}

impl RepairCoordinator {
    pub fn new(transport: Arc<dyn ReplicaTransport>, partition: PartitionId, whoami: String, round_trip_timeout: Duration) -> Self {
        Self {
            transport,
            partition,
            whoami,
            round_trip_timeout,
        }
    }

    /// Run the repair handshake against the interesting replicas of the given term.
    ///
    /// The handshake is cancelled if the term's replica set changes, if any replica can not be
    /// reached in time, or if the given `cancel` future resolves first.
    #[tracing::instrument(level = "debug", skip(self, term, cancel), fields(partition = %self.partition))]
    pub async fn run<F>(&self, term: &Term, cancel: F) -> Result<RepairResult, RepairError>
    where
        F: Future<Output = CancelReason>,
    {
        let replicas = term.interesting_replicas();
        if replicas.is_empty() {
            return Err(RepairError::Failed(anyhow!("no live replicas found for partition {}", self.partition)));
        }
        let mut changes = term.replica_changes();
        tokio::pin!(cancel);

        let replica_set_changed = async {
            match changes.changed().await {
                Ok(()) => CancelReason::ReplicaSetChanged,
                // The term is gone, nothing more can be observed.
                Err(_) => futures::future::pending().await,
            }
        };
        tokio::pin!(replica_set_changed);

        tokio::select! {
            res = self.repair(&replicas) => res,
            reason = &mut replica_set_changed => Err(RepairError::Cancelled(reason)),
            reason = &mut cancel => Err(RepairError::Cancelled(reason)),
        }
    }

    async fn repair(&self, replicas: &BTreeSet<ReplicaId>) -> Result<RepairResult, RepairError> {
        let requests = replicas.iter().map(|replica| async move {
            match tokio::time::timeout(self.round_trip_timeout, self.transport.request_repair_log(self.partition, *replica)).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(err)) => {
                    tracing::debug!(error = ?err, replica = %replica, "error requesting repair log");
                    Err(RepairError::Cancelled(CancelReason::Unreachable(*replica)))
                }
                Err(_) => Err(RepairError::Cancelled(CancelReason::Timeout(*replica))),
            }
        });
        let responses = join_all(requests).await.into_iter().collect::<Result<Vec<_>, _>>()?;

        let plan = compute_repair(&responses);
        tracing::debug!(
            highest_safe_txn = plan.highest_safe_txn,
            repaired_replicas = plan.missing.len(),
            "{} computed repair plan",
            self.whoami
        );
        let sends = plan.missing.into_iter().map(|(replica, entries)| async move {
            match tokio::time::timeout(self.round_trip_timeout, self.transport.send_repair(self.partition, replica, entries)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => {
                    tracing::debug!(error = ?err, replica = %replica, "error sending repair entries");
                    Err(RepairError::Cancelled(CancelReason::Unreachable(replica)))
                }
                Err(_) => Err(RepairError::Cancelled(CancelReason::Timeout(replica))),
            }
        });
        join_all(sends).await.into_iter().collect::<Result<Vec<_>, _>>()?;

        Ok(RepairResult {
            highest_safe_txn: plan.highest_safe_txn,
        })
    }
}
