//! The layout of the coordination store.
//!
//! NOTE WELL: every prefix ends with a `/` so that prefix scans of one family never match nodes
//! of another (`/leaders/` vs `/leaders-canonical/`).

use crate::models::{BalanceIndicator, BalanceMarker, PartitionId, ReplicaId};

/// Leader appointments, watched by every initiator.
pub const LEADERS: &str = "/leaders/";
/// The durable record of who leads each partition, written on successful promotion.
pub const LEADERS_CANONICAL: &str = "/leaders-canonical/";
/// Ephemeral markers published while a migration is in progress.
pub const BALANCE_INDICATOR: &str = "/balance-indicator/";
/// Operator requests to migrate a partition's leadership.
pub const BALANCE_REQUESTS: &str = "/balance-requests/";
/// Ephemeral registrations of the replicas of each partition.
pub const PARTICIPANTS: &str = "/participants/";
/// Ephemeral registrations of live hosts.
pub const HOSTS: &str = "/hosts/";

/// The path of a partition's node under the given leader prefix.
pub fn leader(root: &str, partition: PartitionId) -> String {
    format!("{}{}", root, partition)
}

/// The prefix of all participant nodes of a partition.
pub fn participants(partition: PartitionId) -> String {
    format!("{}{}/", PARTICIPANTS, partition)
}

/// The participant node of a replica.
pub fn participant(partition: PartitionId, replica: ReplicaId) -> String {
    format!("{}{}/{}", PARTICIPANTS, partition, replica.0)
}

/// The prefix of every balance indicator under the given marker.
pub fn balance_marker(marker: BalanceMarker) -> String {
    format!("{}{}/", BALANCE_INDICATOR, marker.key())
}

/// The node of a balance indicator.
pub fn balance_indicator(indicator: &BalanceIndicator) -> String {
    format!("{}{}/{}", balance_marker(indicator.marker), indicator.partition, indicator.replica.0)
}

/// The registration node of a host.
pub fn host(host_id: u32) -> String {
    format!("{}{}", HOSTS, host_id)
}
