use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

use crate::config::Config;
use crate::error::StoreResult;
use crate::execution::{DrGateway, DurableUniqueIdListener, ExecutionSite, ExportMastership};
use crate::initiator::{InitiatorConfig, InitiatorKind, PartitionInitiator};
use crate::models::{PartitionId, ReplicaId, Role, TxnId};
use crate::repair::{RepairLogEntry, RepairResponse, ReplicaTransport};
use crate::site::MemorySite;
use crate::store::{paths, CoordinationStore, NodeMode, Precondition, SledStore, Store, StoreEvent, Versioned};
use crate::transport::LoopbackTransport;

/// Open a fresh sled backed store.
pub async fn setup_store() -> Result<(SledStore, Arc<Config>, TempDir)> {
    let (config, tmpdir) = Config::new_test()?;
    let store = SledStore::new(config.clone()).await?;
    Ok((store, config, tmpdir))
}

/// Poll the given condition until it holds, failing after a few seconds.
pub async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            bail!("timeout waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

/// An entry of a journal shared by recording fixtures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JournalEntry {
    LeaderState { replica: ReplicaId, is_leader: bool },
    Put { path: String },
}

/// An ordered journal of the events observed by recording fixtures.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<JournalEntry>>>);

impl Journal {
    pub fn record(&self, entry: JournalEntry) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.0.lock().unwrap().clone()
    }

    /// The position of the first entry matching the given entry.
    pub fn position(&self, entry: &JournalEntry) -> Option<usize> {
        self.0.lock().unwrap().iter().position(|candidate| candidate == entry)
    }
}

/// A site which journals its leader state changes.
pub struct RecordingSite {
    pub site: Arc<MemorySite>,
    journal: Journal,
}

impl RecordingSite {
    pub fn new(site: Arc<MemorySite>, journal: Journal) -> Self {
        Self { site, journal }
    }
}

impl ExecutionSite for RecordingSite {
    fn is_rejoining(&self) -> bool {
        self.site.is_rejoining()
    }
    fn set_leader_state(&self, is_leader: bool, repaired_through: Option<TxnId>) {
        self.journal.record(JournalEntry::LeaderState {
            replica: self.site.replica(),
            is_leader,
        });
        self.site.set_leader_state(is_leader, repaired_through)
    }
    fn repair_log(&self) -> (TxnId, Vec<RepairLogEntry>) {
        self.site.repair_log()
    }
    fn apply_repair(&self, entries: Vec<RepairLogEntry>) -> Result<()> {
        self.site.apply_repair(entries)
    }
    fn set_dr_gateway(&self, gateway: Option<Arc<dyn DrGateway>>, mp_gateway: Option<Arc<dyn DrGateway>>) -> Result<()> {
        self.site.set_dr_gateway(gateway, mp_gateway)
    }
    fn set_durable_unique_id_listener(&self, listener: Arc<dyn DurableUniqueIdListener>) {
        self.site.set_durable_unique_id_listener(listener)
    }
    fn tick(&self) {
        self.site.tick()
    }
    fn leader_changed(&self, partition: PartitionId, leader: ReplicaId) {
        self.site.leader_changed(partition, leader)
    }
}

/// A store session which journals every successful put.
///
/// While `mute_appointees` is set, events of the appointee entries are dropped from its
/// watches, as if they were delayed & coalesced.
pub struct JournalStore {
    inner: SledStore,
    journal: Journal,
    mute_appointees: Arc<AtomicBool>,
}

impl JournalStore {
    pub fn new(inner: SledStore, journal: Journal, mute_appointees: Arc<AtomicBool>) -> Self {
        Self {
            inner,
            journal,
            mute_appointees,
        }
    }
}

#[async_trait]
impl CoordinationStore for JournalStore {
    fn session_id(&self) -> Uuid {
        self.inner.session_id()
    }
    async fn get(&self, path: &str) -> StoreResult<Option<Versioned>> {
        self.inner.get(path).await
    }
    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Versioned)>> {
        self.inner.list(prefix).await
    }
    async fn put(&self, path: &str, data: Vec<u8>, precondition: Precondition, mode: NodeMode) -> StoreResult<u64> {
        let version = self.inner.put(path, data, precondition, mode).await?;
        self.journal.record(JournalEntry::Put { path: path.into() });
        Ok(version)
    }
    async fn delete(&self, path: &str) -> StoreResult<()> {
        self.inner.delete(path).await
    }
    fn watch(&self, prefix: &str) -> StoreResult<mpsc::Receiver<StoreEvent>> {
        let mut events = self.inner.watch(prefix)?;
        if !prefix.starts_with(paths::LEADERS) {
            return Ok(events);
        }
        let (tx, rx) = mpsc::channel(100);
        let muted = self.mute_appointees.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if muted.load(Ordering::SeqCst) {
                    continue;
                }
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
    async fn close(&self) -> StoreResult<()> {
        self.inner.close().await
    }
}

/// A transport which counts repair log requests, optionally holding them behind a gate.
pub struct CountingTransport {
    inner: LoopbackTransport,
    requests: AtomicU64,
    gate: watch::Receiver<bool>,
}

impl CountingTransport {
    /// Create a new instance along with the sender of its gate, which starts open.
    pub fn new(inner: LoopbackTransport) -> (Self, watch::Sender<bool>) {
        let (gate_tx, gate) = watch::channel(true);
        (
            Self {
                inner,
                requests: AtomicU64::new(0),
                gate,
            },
            gate_tx,
        )
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplicaTransport for CountingTransport {
    async fn request_repair_log(&self, partition: PartitionId, replica: ReplicaId) -> Result<RepairResponse> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.clone();
        while !*gate.borrow_and_update() {
            if gate.changed().await.is_err() {
                break;
            }
        }
        self.inner.request_repair_log(partition, replica).await
    }
    async fn send_repair(&self, partition: PartitionId, replica: ReplicaId, entries: Vec<RepairLogEntry>) -> Result<()> {
        self.inner.send_repair(partition, replica, entries).await
    }
}

/// An export subsystem which records the partitions it was given mastership of.
#[derive(Default)]
pub struct RecordingExport {
    pub accepted: Mutex<Vec<PartitionId>>,
}

impl ExportMastership for RecordingExport {
    fn accept_mastership(&self, partition: PartitionId) -> Result<()> {
        self.accepted.lock().unwrap().push(partition);
        Ok(())
    }
}

/// A DR gateway which records the durable ids it observes.
pub struct RecordingGateway {
    pub partition: PartitionId,
    pub durable: Mutex<Vec<u64>>,
}

impl DurableUniqueIdListener for RecordingGateway {
    fn durable_unique_id(&self, _partition: PartitionId, unique_id: u64) {
        self.durable.lock().unwrap().push(unique_id);
    }
}

impl DrGateway for RecordingGateway {
    fn partition(&self) -> PartitionId {
        self.partition
    }
}

/// The initiator config used by tests.
pub fn initiator_config(partition: PartitionId, replica: ReplicaId) -> InitiatorConfig {
    InitiatorConfig {
        partition,
        replica,
        kind: InitiatorKind::SinglePartition,
        repair_timeout: Duration::from_secs(2),
        tick_interval: Duration::from_millis(50),
        appoint_leaders: true,
    }
}

/// One replica hosted by a test cluster.
pub struct TestReplica {
    pub initiator: PartitionInitiator,
    pub site: Arc<MemorySite>,
    pub store: SledStore,
}

impl TestReplica {
    /// Whether this replica has completed a promotion & still leads.
    pub fn leads(&self) -> bool {
        let stats = self.initiator.stats();
        self.initiator.role() == Role::Leader && stats.promotions > stats.demotions + stats.migrations
    }
}

/// A set of replicas sharing one coordination store & one loopback transport.
pub struct TestCluster {
    pub root: SledStore,
    pub loopback: LoopbackTransport,
    pub transport: Arc<CountingTransport>,
    pub gate: watch::Sender<bool>,
    pub journal: Journal,
    pub export: Arc<RecordingExport>,
    pub shutdown_tx: broadcast::Sender<()>,
    /// Drop appointee entry events from the watches of every replica while set.
    pub mute_appointees: Arc<AtomicBool>,
    _tmpdir: TempDir,
}

impl TestCluster {
    pub async fn new() -> Result<Self> {
        let (root, _config, tmpdir) = setup_store().await?;
        let loopback = LoopbackTransport::new();
        let (transport, gate) = CountingTransport::new(loopback.clone());
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            root,
            loopback,
            transport: Arc::new(transport),
            gate,
            journal: Journal::default(),
            export: Arc::new(RecordingExport::default()),
            shutdown_tx,
            mute_appointees: Arc::new(AtomicBool::new(false)),
            _tmpdir: tmpdir,
        })
    }

    /// A handle to the cluster's store, in its root session.
    pub fn store(&self) -> Store {
        Arc::new(self.root.clone())
    }

    /// Build a replica with its own store session, without configuring it.
    pub async fn replica(&self, config: InitiatorConfig) -> Result<TestReplica> {
        let (partition, replica) = (config.partition, config.replica);
        self.root
            .put(&paths::host(replica.host_id()), vec![], Precondition::Any, NodeMode::Persistent)
            .await?;
        let session = self.root.new_session();
        let site = Arc::new(MemorySite::new(partition, replica));
        let recording: Arc<dyn ExecutionSite> = Arc::new(RecordingSite::new(site.clone(), self.journal.clone()));
        self.loopback.register(partition, replica, recording.clone());
        let initiator = PartitionInitiator::new(
            config,
            Arc::new(JournalStore::new(session.clone(), self.journal.clone(), self.mute_appointees.clone())),
            recording,
            self.transport.clone(),
            self.export.clone(),
            self.shutdown_tx.clone(),
        );
        Ok(TestReplica { initiator, site, store: session })
    }

    /// Build & configure a replica.
    pub async fn start_replica(&self, config: InitiatorConfig) -> Result<TestReplica> {
        let replica = self.replica(config).await?;
        replica.initiator.configure().await?;
        Ok(replica)
    }
}
