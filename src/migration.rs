//! Voluntary migration of partition leadership.
//!
//! A migration hands leadership from the current leader to another live replica without a
//! repair. Before any leadership change is visible, the outgoing leader publishes a balance
//! indicator for every live replica on every live host, grouped under that host's marker, or
//! under the multi-partition sentinel for replicas of the multi-partition coordinator. A replica
//! holding an indicator for the migrated partition consumes it instead of reacting to the
//! partition's next canonical leader change, a reaction which would otherwise abort its
//! in-flight transactions.
//!
//! Indicators are scoped to the migrated partition, so concurrent migrations of different
//! partitions never clear each other's indicators.

use std::collections::BTreeSet;

use anyhow::Result;

use crate::cache::LeaderCache;
use crate::error::StoreResult;
use crate::models::{BalanceIndicator, BalanceMarker, LeaderAssignment, PartitionId, ReplicaId};
use crate::store::{paths, NodeMode, Precondition, Store};
use crate::utils;

/// The steps of a migration run by the outgoing leader.
pub struct MigrationCoordinator {
    store: Store,
    partition: PartitionId,
}

impl MigrationCoordinator {
    pub fn new(store: Store, partition: PartitionId) -> Self {
        Self { store, partition }
    }

    /// The ids of every live host.
    pub async fn live_hosts(&self) -> StoreResult<BTreeSet<u32>> {
        Ok(self
            .store
            .list(paths::HOSTS)
            .await?
            .into_iter()
            .filter_map(|(path, _)| utils::parse_key_suffix::<u32>(&path, paths::HOSTS))
            .collect())
    }

    /// Publish a balance indicator for every live replica on a live host.
    #[tracing::instrument(level = "debug", skip(self), fields(partition = %self.partition))]
    pub async fn publish_indicators(&self) -> StoreResult<Vec<BalanceIndicator>> {
        let hosts = self.live_hosts().await?;
        let indicators: BTreeSet<_> = self
            .store
            .list(paths::PARTICIPANTS)
            .await?
            .into_iter()
            .filter_map(|(path, _)| parse_participant(&path))
            .filter(|(_, replica)| hosts.contains(&replica.host_id()))
            .map(|(partition, replica)| BalanceIndicator {
                marker: BalanceMarker::for_replica(partition, replica),
                partition: self.partition,
                replica,
            })
            .collect();
        for indicator in indicators.iter() {
            self.store
                .put(&paths::balance_indicator(indicator), vec![], Precondition::Any, NodeMode::Ephemeral)
                .await?;
        }
        tracing::debug!(count = indicators.len(), "balance indicators published");
        Ok(indicators.into_iter().collect())
    }

    /// Whether the given replica is a live participant of this partition.
    pub async fn is_participant(&self, replica: ReplicaId) -> StoreResult<bool> {
        is_participant(&self.store, self.partition, replica).await
    }

    /// Rewrite the partition's appointee entry to hand leadership to `new_leader`.
    ///
    /// The write is conditional on the entry being unchanged since last observed by the given
    /// cache.
    pub async fn rewrite_assignment(&self, appointees: &LeaderCache, new_leader: ReplicaId) -> StoreResult<u64> {
        appointees
            .put_assignment(LeaderAssignment::migration(self.partition, new_leader))
            .await
    }

    /// The leader currently named by the partition's appointee entry, read from the store.
    pub async fn current_appointee(&self) -> StoreResult<Option<ReplicaId>> {
        let node = match self.store.get(&paths::leader(paths::LEADERS, self.partition)).await? {
            Some(node) => node,
            None => return Ok(None),
        };
        Ok(utils::decode_model::<LeaderAssignment>(&node.data).ok().map(|assignment| assignment.leader))
    }
}

/// Remove every balance indicator published for the migration of the given partition,
/// returning the number removed.
pub async fn clear_indicators(store: &Store, partition: PartitionId) -> StoreResult<usize> {
    let mut removed = 0;
    for (path, _) in store.list(paths::BALANCE_INDICATOR).await? {
        if parse_indicator(&path).map(|(migrated, _)| migrated) != Some(partition) {
            continue;
        }
        store.delete(&path).await?;
        removed += 1;
    }
    Ok(removed)
}

/// Consume the given indicator, returning true if it was present.
///
/// A present indicator means the replica it addresses must not react to the migrated
/// partition's leader change.
pub async fn consume_indicator(store: &Store, indicator: &BalanceIndicator) -> StoreResult<bool> {
    let path = paths::balance_indicator(indicator);
    if store.get(&path).await?.is_none() {
        return Ok(false);
    }
    store.delete(&path).await?;
    Ok(true)
}

/// Whether any migration currently holds an indicator under the given marker.
pub async fn is_suppressed(store: &Store, marker: BalanceMarker) -> StoreResult<bool> {
    Ok(!store.list(&paths::balance_marker(marker)).await?.is_empty())
}

/// Whether the given replica is a live participant of the given partition.
pub async fn is_participant(store: &Store, partition: PartitionId, replica: ReplicaId) -> StoreResult<bool> {
    Ok(store.get(&paths::participant(partition, replica)).await?.is_some())
}

/// Request that leadership of the given partition be migrated to `new_leader`.
///
/// The request is acted upon by the partition's current leader. It is rejected unless
/// `new_leader` is a live participant of the partition.
#[tracing::instrument(level = "debug", skip(store))]
pub async fn request_migration(store: Store, partition: PartitionId, new_leader: ReplicaId) -> Result<u64> {
    anyhow::ensure!(
        is_participant(&store, partition, new_leader).await?,
        "replica {} is not a live participant of partition {}",
        new_leader,
        partition
    );
    Ok(LeaderCache::writer(store, paths::BALANCE_REQUESTS)
        .put_assignment(LeaderAssignment::migration(partition, new_leader))
        .await?)
}

/// Parse a participant path into its partition & replica.
fn parse_participant(path: &str) -> Option<(PartitionId, ReplicaId)> {
    let (partition, replica) = path.strip_prefix(paths::PARTICIPANTS)?.split_once('/')?;
    Some((PartitionId(partition.parse().ok()?), ReplicaId(replica.parse().ok()?)))
}

/// Parse an indicator path into the migrated partition & the addressed replica.
fn parse_indicator(path: &str) -> Option<(PartitionId, ReplicaId)> {
    let mut segments = path.strip_prefix(paths::BALANCE_INDICATOR)?.splitn(3, '/').skip(1);
    let partition = segments.next()?.parse().ok()?;
    let replica = segments.next()?.parse().ok()?;
    Some((PartitionId(partition), ReplicaId(replica)))
}
