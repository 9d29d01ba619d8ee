//! Core data model of the failover protocol.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// A transaction id, as assigned by a partition leader.
pub type TxnId = u64;

/// The partition id reserved for the multi-partition coordinator.
pub const MP_PARTITION: PartitionId = PartitionId(16383);

/// A stable identifier of a data partition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub u32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An opaque identifier of a replica site, the unit of leadership.
///
/// The low 32 bits carry the id of the host on which the site runs, the high 32 bits the site's
/// id on that host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(pub u64);

impl ReplicaId {
    /// Build a replica id from its host & site ids.
    pub fn new(host_id: u32, site_id: u32) -> Self {
        Self(((site_id as u64) << 32) | host_id as u64)
    }

    /// The id of the host on which this replica runs.
    pub fn host_id(&self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }

    /// The id of this replica's site on its host.
    pub fn site_id(&self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_id(), self.site_id())
    }
}

/// The leader assigned to a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderAssignment {
    pub partition: PartitionId,
    pub leader: ReplicaId,
    /// Set when the assignment is the result of a voluntary migration.
    #[serde(default)]
    pub balance_requested: bool,
}

impl LeaderAssignment {
    pub fn new(partition: PartitionId, leader: ReplicaId) -> Self {
        Self {
            partition,
            leader,
            balance_requested: false,
        }
    }

    /// An assignment which hands leadership to `leader` as part of a migration.
    pub fn migration(partition: PartitionId, leader: ReplicaId) -> Self {
        Self {
            partition,
            leader,
            balance_requested: true,
        }
    }
}

/// A full, immutable view of a leader mapping as observed from the coordination store.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LeaderSnapshot {
    /// Increases by one for every snapshot delivered by a cache.
    pub seq: u64,
    pub leaders: BTreeMap<PartitionId, LeaderAssignment>,
    /// The store version of each entry at the time it was read.
    pub versions: BTreeMap<PartitionId, u64>,
}

impl LeaderSnapshot {
    /// The leader assigned to the given partition, if any.
    pub fn leader_of(&self, partition: PartitionId) -> Option<ReplicaId> {
        self.leaders.get(&partition).map(|assignment| assignment.leader)
    }
}

/// A marker published while a migration is in progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BalanceMarker {
    Host(u32),
    MpSentinel,
}

impl BalanceMarker {
    /// The marker covering the given replica of the given partition.
    pub fn for_replica(partition: PartitionId, replica: ReplicaId) -> Self {
        if partition == MP_PARTITION {
            Self::MpSentinel
        } else {
            Self::Host(replica.host_id())
        }
    }

    /// The key segment used for this marker in the coordination store.
    pub fn key(&self) -> String {
        match self {
            Self::Host(host) => format!("host-{}", host),
            Self::MpSentinel => "mp".into(),
        }
    }
}

/// A balance indicator suppressing one replica's reaction to the migration of a partition.
///
/// Each indicator is consumed by the replica it addresses when that replica observes the
/// migrated partition's new canonical leader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BalanceIndicator {
    pub marker: BalanceMarker,
    /// The partition being migrated.
    pub partition: PartitionId,
    /// The replica whose reaction is suppressed.
    pub replica: ReplicaId,
}

/// The role of a partition replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    Replica = 0,
    Promoting = 1,
    Leader = 2,
}

impl Role {
    fn from_u8(val: u8) -> Self {
        match val {
            1 => Self::Promoting,
            2 => Self::Leader,
            _ => Self::Replica,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replica => write!(f, "replica"),
            Self::Promoting => write!(f, "promoting"),
            Self::Leader => write!(f, "leader"),
        }
    }
}

/// A `Role` which may be shared across threads.
#[derive(Debug)]
pub struct AtomicRole(AtomicU8);

impl AtomicRole {
    pub fn new(role: Role) -> Self {
        Self(AtomicU8::new(role as u8))
    }

    pub fn load(&self) -> Role {
        Role::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, role: Role) {
        self.0.store(role as u8, Ordering::Release)
    }

    /// Transition from `current` to `new`, returning false if the role was not `current`.
    pub fn transition(&self, current: Role, new: Role) -> bool {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for AtomicRole {
    fn default() -> Self {
        Self::new(Role::Replica)
    }
}
