//! A cache of leader assignments backed by the coordination store.
//!
//! A `LeaderCache` watches every node under one of the leader path families and delivers the
//! full current mapping as an immutable `LeaderSnapshot` every time anything under that family
//! changes. Snapshots are delivered over a bounded channel to a consumer task, they are never
//! handled inline on the watcher task.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{StoreError, StoreResult};
use crate::models::{LeaderAssignment, LeaderSnapshot, PartitionId, ReplicaId};
use crate::store::{paths, NodeMode, Precondition, Store, StoreEvent};
use crate::utils;

const METRIC_CACHE_WATCHER_ERRORS: &str = "failover_leader_cache_watcher_errors";
/// The buffer size of the snapshot channel.
const SNAPSHOT_BUFFER: usize = 100;
/// The delay between attempts to reload the mapping after an error.
const RELOAD_BACKOFF: Duration = Duration::from_millis(500);

/// The node versions last observed for each partition.
type VersionsMap = Arc<ArcSwap<HashMap<PartitionId, u64>>>;

/// A cache of the leader assignments under one path family.
pub struct LeaderCache {
    store: Store,
    /// The path family watched by this cache.
    root: &'static str,
    /// The last mapping observed from the store.
    current: Arc<ArcSwap<LeaderSnapshot>>,
    /// The node version of each entry, used as the precondition of writes.
    versions: VersionsMap,
    /// The channel on which snapshots are delivered, absent for write-only caches.
    snapshots_tx: Option<mpsc::Sender<Arc<LeaderSnapshot>>>,
    /// A signal used to stop the watcher task.
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
}

impl LeaderCache {
    /// Create a new cache over the given path family, along with the channel on which its
    /// snapshots are delivered.
    pub fn new(store: Store, root: &'static str) -> (Self, mpsc::Receiver<Arc<LeaderSnapshot>>) {
        let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);
        (Self::build(store, root, Some(tx)), rx)
    }

    /// Create a write-only cache over the given path family.
    pub fn writer(store: Store, root: &'static str) -> Self {
        Self::build(store, root, None)
    }

    fn build(store: Store, root: &'static str, snapshots_tx: Option<mpsc::Sender<Arc<LeaderSnapshot>>>) -> Self {
        metrics::register_counter!(METRIC_CACHE_WATCHER_ERRORS, metrics::Unit::Count, "coordination store errors seen by leader cache watchers");
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            root,
            current: Default::default(),
            versions: Default::default(),
            snapshots_tx,
            shutdown_tx,
            started: AtomicBool::new(false),
        }
    }

    /// Start this cache.
    ///
    /// When `expect_updates` is true, the cache subscribes to the path family before performing
    /// its initial read so that no change is missed, publishes the initial snapshot, and spawns a
    /// task delivering a new snapshot for every subsequent change. Starting twice is a no-op.
    #[tracing::instrument(level = "debug", skip(self), fields(root = self.root))]
    pub async fn start(&self, expect_updates: bool) -> StoreResult<Option<JoinHandle<()>>> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(None);
        }
        let events = if expect_updates { Some(self.store.watch(self.root)?) } else { None };

        let loader = Loader {
            store: self.store.clone(),
            root: self.root,
            current: self.current.clone(),
            versions: self.versions.clone(),
        };
        let snapshot = loader.reload().await.map_err(|err| match err {
            StoreError::SessionClosed => StoreError::SessionClosed,
            err => StoreError::CoordinationUnavailable(anyhow::Error::from(err).context("error performing initial read of leader cache")),
        })?;
        if let Some(tx) = &self.snapshots_tx {
            let _ = tx.send(snapshot).await;
        }

        let events = match events {
            Some(events) => events,
            None => return Ok(None),
        };
        let watcher = CacheWatcher {
            loader,
            events,
            snapshots_tx: self.snapshots_tx.clone(),
            shutdown: self.shutdown_tx.subscribe(),
        };
        Ok(Some(watcher.spawn()))
    }

    /// Stop delivering snapshots. Persisted entries are untouched.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// The last mapping observed by this cache.
    pub fn snapshot(&self) -> Arc<LeaderSnapshot> {
        self.current.load_full()
    }

    /// The last observed assignment of the given partition.
    pub fn get(&self, partition: PartitionId) -> Option<LeaderAssignment> {
        self.current.load().leaders.get(&partition).copied()
    }

    /// The last observed node version of the given partition's entry.
    pub fn version(&self, partition: PartitionId) -> Option<u64> {
        self.versions.load().get(&partition).copied()
    }

    /// Record the given replica as the leader of the given partition.
    pub async fn put(&self, partition: PartitionId, leader: ReplicaId) -> StoreResult<u64> {
        self.put_assignment(LeaderAssignment::new(partition, leader)).await
    }

    /// Write the given assignment, conditional on the entry being unchanged since last observed.
    ///
    /// On a conflict the observed version is refreshed from the store's answer, so a retry
    /// after re-checking the caller's own preconditions is meaningful.
    #[tracing::instrument(level = "debug", skip(self), fields(root = self.root))]
    pub async fn put_assignment(&self, assignment: LeaderAssignment) -> StoreResult<u64> {
        let partition = assignment.partition;
        let path = paths::leader(self.root, partition);
        let expected = match self.version(partition) {
            Some(version) => Some(version),
            None => self.store.get(&path).await?.map(|node| node.version),
        };
        let data = utils::encode_model(&assignment).map_err(StoreError::CoordinationUnavailable)?;
        match self.store.put(&path, data, Precondition::from(expected), NodeMode::Persistent).await {
            Ok(version) => {
                self.record_version(partition, Some(version));
                Ok(version)
            }
            Err(StoreError::WriteConflict { path, actual }) => {
                self.record_version(partition, actual);
                Err(StoreError::WriteConflict { path, actual })
            }
            Err(err) => Err(err),
        }
    }

    /// Remove the given partition's entry.
    pub async fn remove(&self, partition: PartitionId) -> StoreResult<()> {
        self.store.delete(&paths::leader(self.root, partition)).await?;
        self.record_version(partition, None);
        Ok(())
    }

    fn record_version(&self, partition: PartitionId, version: Option<u64>) {
        self.versions.rcu(|orig| {
            let mut updated = orig.as_ref().clone();
            match version {
                Some(version) => updated.insert(partition, version),
                None => updated.remove(&partition),
            };
            updated
        });
    }
}

impl Drop for LeaderCache {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Reads the full mapping of a path family from the store.
struct Loader {
    store: Store,
    root: &'static str,
    current: Arc<ArcSwap<LeaderSnapshot>>,
    versions: VersionsMap,
}

impl Loader {
    /// Read the full mapping, recording it as the current snapshot.
    async fn reload(&self) -> StoreResult<Arc<LeaderSnapshot>> {
        let nodes = self.store.list(self.root).await?;
        let (mut leaders, mut versions) = (BTreeMap::new(), HashMap::new());
        for (path, node) in nodes {
            let partition = match utils::parse_key_suffix::<u32>(&path, self.root) {
                Some(id) => PartitionId(id),
                None => {
                    tracing::warn!(%path, "skipping leader entry with malformed key");
                    continue;
                }
            };
            let assignment: LeaderAssignment = match utils::decode_model(&node.data) {
                Ok(assignment) => assignment,
                Err(err) => {
                    tracing::warn!(error = ?err, %path, "skipping malformed leader entry");
                    continue;
                }
            };
            if assignment.partition != partition {
                tracing::warn!(%path, entry_partition = %assignment.partition, "skipping leader entry stored under wrong partition");
                continue;
            }
            versions.insert(partition, node.version);
            leaders.insert(partition, assignment);
        }

        let seq = self.current.load().seq + 1;
        let snapshot = Arc::new(LeaderSnapshot {
            seq,
            leaders,
            versions: versions.iter().map(|(partition, version)| (*partition, *version)).collect(),
        });
        self.current.store(snapshot.clone());
        self.versions.store(Arc::new(versions));
        Ok(snapshot)
    }
}

/// A task which delivers a new snapshot for every change under a path family.
struct CacheWatcher {
    loader: Loader,
    events: mpsc::Receiver<StoreEvent>,
    snapshots_tx: Option<mpsc::Sender<Arc<LeaderSnapshot>>>,
    shutdown: watch::Receiver<bool>,
}

impl CacheWatcher {
    fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::debug!(root = self.loader.root, "leader cache watcher initialized");
        while !*self.shutdown.borrow() {
            tokio::select! {
                event_opt = self.events.recv() => match event_opt {
                    Some(event) => {
                        if !self.handle_event(event).await {
                            break;
                        }
                    }
                    None => break,
                },
                _ = self.shutdown.changed() => break,
            }
        }
        tracing::debug!(root = self.loader.root, "leader cache watcher shutting down");
    }

    /// Handle a change event, returning false if the watcher should stop.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_event(&mut self, event: StoreEvent) -> bool {
        // Coalesce any changes already queued, they are all covered by a single reload.
        while self.events.try_recv().is_ok() {}

        let snapshot = loop {
            match self.loader.reload().await {
                Ok(snapshot) => break snapshot,
                Err(StoreError::SessionClosed) => return false,
                Err(err) => {
                    tracing::error!(error = ?err, root = self.loader.root, "error reloading leader cache");
                    metrics::increment_counter!(METRIC_CACHE_WATCHER_ERRORS);
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(RELOAD_BACKOFF) => (),
                _ = self.shutdown.changed() => return false,
            }
        };
        match &self.snapshots_tx {
            Some(tx) => tx.send(snapshot).await.is_ok(),
            None => true,
        }
    }
}
