//! An in-memory execution site.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Result};

use crate::execution::{DrGateway, DurableUniqueIdListener, ExecutionSite};
use crate::models::{PartitionId, ReplicaId, TxnId};
use crate::repair::RepairLogEntry;

/// An execution site holding its transaction log in memory.
pub struct MemorySite {
    partition: PartitionId,
    replica: ReplicaId,
    state: Mutex<SiteState>,
}

#[derive(Default)]
struct SiteState {
    rejoining: bool,
    is_leader: bool,
    /// The transaction id handed over by the last repair.
    repaired_through: Option<TxnId>,
    highest_durable: TxnId,
    /// Transactions above the durable point.
    in_flight: BTreeMap<TxnId, Vec<u8>>,
    dr_gateway: Option<Arc<dyn DrGateway>>,
    mp_dr_gateway: Option<Arc<dyn DrGateway>>,
    listeners: Vec<Arc<dyn DurableUniqueIdListener>>,
    ticks: u64,
    leader_changes: Vec<(PartitionId, ReplicaId)>,
}

impl MemorySite {
    pub fn new(partition: PartitionId, replica: ReplicaId) -> Self {
        Self {
            partition,
            replica,
            state: Default::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, SiteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn set_rejoining(&self, rejoining: bool) {
        self.state().rejoining = rejoining;
    }

    /// Record a transaction which is not yet durable.
    pub fn log_transaction(&self, txn_id: TxnId, payload: Vec<u8>) {
        let mut state = self.state();
        if txn_id > state.highest_durable {
            state.in_flight.insert(txn_id, payload);
        }
    }

    /// Make every transaction up to `txn_id` durable, notifying durable id listeners.
    pub fn commit_through(&self, txn_id: TxnId) {
        let (listeners, gateways) = {
            let mut state = self.state();
            if txn_id <= state.highest_durable {
                return;
            }
            state.highest_durable = txn_id;
            state.in_flight = state.in_flight.split_off(&txn_id.saturating_add(1));
            let gateways: Vec<_> = state.dr_gateway.iter().chain(state.mp_dr_gateway.iter()).cloned().collect();
            (state.listeners.clone(), gateways)
        };
        for listener in listeners.iter() {
            listener.durable_unique_id(self.partition, txn_id);
        }
        for gateway in gateways.iter() {
            gateway.durable_unique_id(self.partition, txn_id);
        }
    }

    pub fn is_leader(&self) -> bool {
        self.state().is_leader
    }

    pub fn repaired_through(&self) -> Option<TxnId> {
        self.state().repaired_through
    }

    pub fn highest_durable(&self) -> TxnId {
        self.state().highest_durable
    }

    pub fn in_flight_txns(&self) -> Vec<TxnId> {
        self.state().in_flight.keys().copied().collect()
    }

    pub fn ticks(&self) -> u64 {
        self.state().ticks
    }

    pub fn leader_changes(&self) -> Vec<(PartitionId, ReplicaId)> {
        self.state().leader_changes.clone()
    }

    pub fn has_dr_gateway(&self) -> (bool, bool) {
        let state = self.state();
        (state.dr_gateway.is_some(), state.mp_dr_gateway.is_some())
    }
}

impl ExecutionSite for MemorySite {
    fn is_rejoining(&self) -> bool {
        self.state().rejoining
    }

    fn set_leader_state(&self, is_leader: bool, repaired_through: Option<TxnId>) {
        let mut state = self.state();
        state.is_leader = is_leader;
        if repaired_through.is_some() {
            state.repaired_through = repaired_through;
        }
        tracing::debug!(partition = %self.partition, replica = %self.replica, is_leader, ?repaired_through, "site leader state changed");
    }

    fn repair_log(&self) -> (TxnId, Vec<RepairLogEntry>) {
        let state = self.state();
        let entries = state
            .in_flight
            .iter()
            .map(|(txn_id, payload)| RepairLogEntry {
                txn_id: *txn_id,
                payload: payload.clone(),
            })
            .collect();
        (state.highest_durable, entries)
    }

    fn apply_repair(&self, entries: Vec<RepairLogEntry>) -> Result<()> {
        let mut state = self.state();
        if state.rejoining {
            bail!("site {} of partition {} is rejoining and can not accept repair", self.replica, self.partition);
        }
        for entry in entries {
            if entry.txn_id > state.highest_durable {
                state.in_flight.insert(entry.txn_id, entry.payload);
            }
        }
        Ok(())
    }

    fn set_dr_gateway(&self, gateway: Option<Arc<dyn DrGateway>>, mp_gateway: Option<Arc<dyn DrGateway>>) -> Result<()> {
        if let Some(gateway) = &gateway {
            if gateway.partition() != self.partition {
                bail!("DR gateway of partition {} given to site of partition {}", gateway.partition(), self.partition);
            }
        }
        let mut state = self.state();
        state.dr_gateway = gateway;
        state.mp_dr_gateway = mp_gateway;
        Ok(())
    }

    fn set_durable_unique_id_listener(&self, listener: Arc<dyn DurableUniqueIdListener>) {
        self.state().listeners.push(listener);
    }

    fn tick(&self) {
        self.state().ticks += 1;
    }

    fn leader_changed(&self, partition: PartitionId, leader: ReplicaId) {
        self.state().leader_changes.push((partition, leader));
    }
}
