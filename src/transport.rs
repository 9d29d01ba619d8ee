//! An in-process replica transport.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;

use crate::execution::ExecutionSite;
use crate::models::{PartitionId, ReplicaId};
use crate::repair::{RepairLogEntry, RepairResponse, ReplicaTransport};

/// A map of all sites reachable through a loopback transport.
type SitesMap = HashMap<(PartitionId, ReplicaId), Arc<dyn ExecutionSite>>;

/// A transport which reaches the sites hosted in the same process.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    sites: Arc<ArcSwap<SitesMap>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the given site reachable.
    pub fn register(&self, partition: PartitionId, replica: ReplicaId, site: Arc<dyn ExecutionSite>) {
        self.sites.rcu(|orig| {
            let mut updated = orig.as_ref().clone();
            updated.insert((partition, replica), site.clone());
            updated
        });
    }

    /// Make the given site unreachable.
    pub fn unregister(&self, partition: PartitionId, replica: ReplicaId) {
        self.sites.rcu(|orig| {
            let mut updated = orig.as_ref().clone();
            updated.remove(&(partition, replica));
            updated
        });
    }

    fn site(&self, partition: PartitionId, replica: ReplicaId) -> Result<Arc<dyn ExecutionSite>> {
        self.sites
            .load()
            .get(&(partition, replica))
            .cloned()
            .with_context(|| format!("replica {} of partition {} is not reachable", replica, partition))
    }
}

#[async_trait]
impl ReplicaTransport for LoopbackTransport {
    async fn request_repair_log(&self, partition: PartitionId, replica: ReplicaId) -> Result<RepairResponse> {
        let (highest_durable, in_flight) = self.site(partition, replica)?.repair_log();
        Ok(RepairResponse {
            replica,
            highest_durable,
            in_flight,
        })
    }

    async fn send_repair(&self, partition: PartitionId, replica: ReplicaId, entries: Vec<RepairLogEntry>) -> Result<()> {
        self.site(partition, replica)?.apply_repair(entries)
    }
}
