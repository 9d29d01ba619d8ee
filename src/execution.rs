//! Interfaces of the collaborators driven by a partition initiator.

use std::sync::Arc;

use anyhow::Result;

use crate::models::{PartitionId, ReplicaId, TxnId};
use crate::repair::RepairLogEntry;

/// The local execution site of a partition replica.
///
/// All mutating calls are made from the initiator's task queue, never concurrently.
pub trait ExecutionSite: Send + Sync + 'static {
    /// Whether this site is rejoining and does not yet hold a consistent history.
    fn is_rejoining(&self) -> bool;

    /// Flip the site's leader state.
    ///
    /// When becoming leader after a repair, `repaired_through` is the highest transaction id
    /// known to be safe across the partition's replicas.
    fn set_leader_state(&self, is_leader: bool, repaired_through: Option<TxnId>);

    /// The highest durable transaction id of this site along with its in-flight log entries.
    fn repair_log(&self) -> (TxnId, Vec<RepairLogEntry>);

    /// Apply repair entries sent by a promoting leader.
    fn apply_repair(&self, entries: Vec<RepairLogEntry>) -> Result<()>;

    /// Install the DR gateways of this site.
    fn set_dr_gateway(&self, gateway: Option<Arc<dyn DrGateway>>, mp_gateway: Option<Arc<dyn DrGateway>>) -> Result<()>;

    /// Install a listener of durable unique id updates.
    fn set_durable_unique_id_listener(&self, listener: Arc<dyn DurableUniqueIdListener>);

    /// A periodic tick.
    fn tick(&self);

    /// React to a change of the canonical leader of a partition, aborting work which can no
    /// longer commit.
    fn leader_changed(&self, partition: PartitionId, leader: ReplicaId);
}

/// The export subsystem's view of partition mastership.
pub trait ExportMastership: Send + Sync + 'static {
    fn accept_mastership(&self, partition: PartitionId) -> Result<()>;
}

/// A listener of durable unique id updates.
pub trait DurableUniqueIdListener: Send + Sync + 'static {
    fn durable_unique_id(&self, partition: PartitionId, unique_id: u64);
}

/// A database replication gateway.
pub trait DrGateway: DurableUniqueIdListener {
    /// The partition served by this gateway.
    fn partition(&self) -> PartitionId;
}

/// Builds the DR gateway of a partition.
pub type DrGatewayFactory = dyn Fn(PartitionId) -> Result<Arc<dyn DrGateway>> + Send + Sync;
