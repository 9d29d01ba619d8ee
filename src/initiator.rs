//! The per partition replica initiator.
//!
//! An initiator owns the role of one replica of one partition. It reacts to snapshots of the
//! appointee entries by promoting its replica when it is named, steps down when another replica
//! is named, and hands leadership to another replica when a migration is requested.
//!
//! Three consumer tasks receive snapshots from the initiator's caches, a dedicated worker runs
//! promotions, and every mutation of the local site goes through the site's task queue. Consumers
//! never run a promotion inline, they only request one.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwapOption;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::appointer::LeaderAppointer;
use crate::cache::LeaderCache;
use crate::config::Config;
use crate::error::{CancelReason, PromotionError, RepairError, ShutdownError, ShutdownResult, StoreError};
use crate::execution::{DrGatewayFactory, DurableUniqueIdListener, ExecutionSite, ExportMastership};
use crate::migration::{self, MigrationCoordinator};
use crate::models::{AtomicRole, BalanceIndicator, BalanceMarker, LeaderSnapshot, PartitionId, ReplicaId, Role, TxnId, MP_PARTITION};
use crate::repair::{RepairCoordinator, RepairResult, ReplicaTransport};
use crate::store::{paths, NodeMode, Precondition, Store};
use crate::task_queue::{self, TaskQueue, TaskQueueWorker};
use crate::term::Term;
use crate::utils;

const METRIC_IS_LEADER: &str = "failover_is_leader";
const METRIC_PROMOTION_ATTEMPTS: &str = "failover_promotion_attempts";
const METRIC_PROMOTIONS: &str = "failover_promotions";
const METRIC_REPAIR_CANCELLATIONS: &str = "failover_repair_cancellations";
const METRIC_MIGRATIONS: &str = "failover_migrations";
/// The delay before a cancelled promotion attempt is retried.
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// The kind of coordinator an initiator drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitiatorKind {
    /// The initiator of a data partition.
    SinglePartition,
    /// The initiator of the multi-partition coordinator.
    MultiPartition,
}

impl InitiatorKind {
    /// Whether a site of this kind may rejoin the cluster after a failure.
    pub fn is_rejoinable(&self) -> bool {
        matches!(self, Self::SinglePartition)
    }

    /// Whether a leader of this kind takes export mastership after promotion.
    fn takes_export_mastership(&self) -> bool {
        matches!(self, Self::SinglePartition)
    }

    /// Whether a leader of this kind honours migration requests.
    fn honours_balance_requests(&self) -> bool {
        matches!(self, Self::SinglePartition)
    }
}

/// The configuration of one initiator.
#[derive(Clone, Debug)]
pub struct InitiatorConfig {
    pub partition: PartitionId,
    pub replica: ReplicaId,
    pub kind: InitiatorKind,
    /// The bound on a single repair round trip.
    pub repair_timeout: Duration,
    pub tick_interval: Duration,
    /// Whether this initiator appoints a new leader when the current one disappears.
    pub appoint_leaders: bool,
}

impl InitiatorConfig {
    pub fn new(config: &Config, partition: PartitionId, replica: ReplicaId) -> Self {
        Self {
            partition,
            replica,
            kind: if partition == MP_PARTITION {
                InitiatorKind::MultiPartition
            } else {
                InitiatorKind::SinglePartition
            },
            repair_timeout: config.repair_timeout(),
            tick_interval: config.tick_interval(),
            appoint_leaders: true,
        }
    }
}

/// The outcome of a promotion which did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PromotionOutcome {
    /// The replica is now leader. `highest_safe_txn` is absent for a migration handoff.
    Promoted { highest_safe_txn: Option<TxnId>, attempts: u32 },
    /// A newer appointment names a different leader.
    Superseded,
    /// The initiator shut down while promoting.
    ShutDown,
}

/// Counters of the work done by an initiator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InitiatorStats {
    pub promotion_attempts: u64,
    pub repairs: u64,
    pub cancellations: u64,
    pub promotions: u64,
    pub demotions: u64,
    pub migrations: u64,
}

#[derive(Default)]
struct StatsCounters {
    promotion_attempts: AtomicU64,
    repairs: AtomicU64,
    cancellations: AtomicU64,
    promotions: AtomicU64,
    demotions: AtomicU64,
    migrations: AtomicU64,
}

/// The initiator of one replica of one partition.
#[derive(Clone)]
pub struct PartitionInitiator {
    inner: Arc<Inner>,
}

struct Inner {
    config: InitiatorConfig,
    /// A description of this initiator used in logs.
    whoami: String,
    store: Store,
    site: Arc<dyn ExecutionSite>,
    transport: Arc<dyn ReplicaTransport>,
    export: Arc<dyn ExportMastership>,
    queue: TaskQueue,
    queue_worker: Mutex<Option<TaskQueueWorker>>,

    role: AtomicRole,
    /// Set while the pending promotion is a migration handoff.
    balance_requested: AtomicBool,
    /// Set while this replica is handing its leadership to another replica.
    handing_off: AtomicBool,
    /// The appointee entry version written by the in-flight handoff, 0 until it is written.
    handoff_version: AtomicU64,
    configured: AtomicBool,
    shutting_down: AtomicBool,

    /// The newest snapshot of the appointee entries.
    latest: watch::Sender<Arc<LeaderSnapshot>>,
    promotion_tx: mpsc::Sender<()>,
    promotion_rx: Mutex<Option<mpsc::Receiver<()>>>,

    appointees: LeaderCache,
    appointees_rx: Mutex<Option<mpsc::Receiver<Arc<LeaderSnapshot>>>>,
    balance_requests: LeaderCache,
    balance_requests_rx: Mutex<Option<mpsc::Receiver<Arc<LeaderSnapshot>>>>,
    masters: LeaderCache,
    masters_rx: Mutex<Option<mpsc::Receiver<Arc<LeaderSnapshot>>>>,
    migration: MigrationCoordinator,

    stats: StatsCounters,
    fatal: ArcSwapOption<String>,
    /// The process level shutdown channel, signalled on fatal errors.
    app_shutdown: broadcast::Sender<()>,
    /// The shutdown channel of this initiator's own tasks.
    stop_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PartitionInitiator {
    /// Create a new instance.
    ///
    /// The given store handle must be a session owned by this initiator, it is closed when the
    /// initiator shuts down.
    pub fn new(
        config: InitiatorConfig, store: Store, site: Arc<dyn ExecutionSite>, transport: Arc<dyn ReplicaTransport>,
        export: Arc<dyn ExportMastership>, app_shutdown: broadcast::Sender<()>,
    ) -> Self {
        metrics::register_gauge!(
            METRIC_IS_LEADER,
            metrics::Unit::Count,
            "a gauge indicating if a replica is its partition's leader, where 1.0 indicates leadership"
        );
        metrics::register_counter!(METRIC_PROMOTION_ATTEMPTS, metrics::Unit::Count, "leader promotion attempts");
        metrics::register_counter!(METRIC_PROMOTIONS, metrics::Unit::Count, "successful leader promotions");
        metrics::register_counter!(METRIC_REPAIR_CANCELLATIONS, metrics::Unit::Count, "cancelled repair handshakes");
        metrics::register_counter!(METRIC_MIGRATIONS, metrics::Unit::Count, "leadership migrations handed off");

        let whoami = format!("partition {} replica {}", config.partition, config.replica);
        let (queue, queue_worker) = TaskQueue::new();
        let (latest, _) = watch::channel(Arc::new(LeaderSnapshot::default()));
        let (promotion_tx, promotion_rx) = mpsc::channel(1);
        let (appointees, appointees_rx) = LeaderCache::new(store.clone(), paths::LEADERS);
        let (balance_requests, balance_requests_rx) = LeaderCache::new(store.clone(), paths::BALANCE_REQUESTS);
        let (masters, masters_rx) = LeaderCache::new(store.clone(), paths::LEADERS_CANONICAL);
        let migration = MigrationCoordinator::new(store.clone(), config.partition);
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                config,
                whoami,
                store,
                site,
                transport,
                export,
                queue,
                queue_worker: Mutex::new(Some(queue_worker)),
                role: AtomicRole::default(),
                balance_requested: AtomicBool::new(false),
                handing_off: AtomicBool::new(false),
                handoff_version: AtomicU64::new(0),
                configured: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                latest,
                promotion_tx,
                promotion_rx: Mutex::new(Some(promotion_rx)),
                appointees,
                appointees_rx: Mutex::new(Some(appointees_rx)),
                balance_requests,
                balance_requests_rx: Mutex::new(Some(balance_requests_rx)),
                masters,
                masters_rx: Mutex::new(Some(masters_rx)),
                migration,
                stats: Default::default(),
                fatal: ArcSwapOption::empty(),
                app_shutdown,
                stop_tx,
                tasks: Mutex::new(vec![]),
            }),
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.inner.config.partition
    }

    pub fn replica(&self) -> ReplicaId {
        self.inner.config.replica
    }

    /// The current role of this replica.
    pub fn role(&self) -> Role {
        self.inner.role.load()
    }

    /// Whether the site of this initiator may rejoin the cluster after a failure.
    pub fn is_rejoinable(&self) -> bool {
        self.inner.config.kind.is_rejoinable()
    }

    /// The fatal error which terminated this initiator, if any.
    pub fn fatal_error(&self) -> Option<Arc<String>> {
        self.inner.fatal.load_full()
    }

    pub fn stats(&self) -> InitiatorStats {
        let stats = &self.inner.stats;
        InitiatorStats {
            promotion_attempts: stats.promotion_attempts.load(Ordering::Relaxed),
            repairs: stats.repairs.load(Ordering::Relaxed),
            cancellations: stats.cancellations.load(Ordering::Relaxed),
            promotions: stats.promotions.load(Ordering::Relaxed),
            demotions: stats.demotions.load(Ordering::Relaxed),
            migrations: stats.migrations.load(Ordering::Relaxed),
        }
    }

    /// The site's task queue.
    pub fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    /// Configure this initiator, registering its replica & starting all of its tasks.
    ///
    /// Configuring twice is a no-op. Any failure is fatal.
    #[tracing::instrument(level = "debug", skip(self), fields(partition = %self.partition(), replica = %self.replica()))]
    pub async fn configure(&self) -> ShutdownResult<()> {
        if self.inner.configured.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(err) = self.try_configure().await {
            self.crash("error configuring partition initiator", &err);
            return Err(ShutdownError(err));
        }
        Ok(())
    }

    async fn try_configure(&self) -> Result<()> {
        let inner = &self.inner;
        let (partition, replica) = (inner.config.partition, inner.config.replica);

        // Start the site's task queue & ticks first, the caches below enqueue onto it.
        let worker = inner.queue_worker.lock().await.take().context("task queue worker already taken")?;
        let mut tasks = vec![
            worker.spawn(inner.stop_tx.subscribe()),
            task_queue::spawn_tick_producer(inner.queue.clone(), inner.site.clone(), inner.config.tick_interval, inner.stop_tx.subscribe()),
        ];

        inner
            .store
            .put(&paths::participant(partition, replica), vec![], Precondition::Any, NodeMode::Ephemeral)
            .await
            .context("error registering partition participant")?;

        let masters_rx = inner.masters_rx.lock().await.take().context("canonical leader snapshots already taken")?;
        inner.masters.start(true).await.context("error starting canonical leader cache")?;
        tasks.push(tokio::spawn(self.clone().run_masters_consumer(masters_rx)));

        if inner.config.kind.honours_balance_requests() {
            let balance_rx = inner.balance_requests_rx.lock().await.take().context("balance request snapshots already taken")?;
            inner.balance_requests.start(true).await.context("error starting balance request cache")?;
            tasks.push(tokio::spawn(self.clone().run_balance_requests_consumer(balance_rx)));
        }

        let promotion_rx = inner.promotion_rx.lock().await.take().context("promotion requests already taken")?;
        tasks.push(tokio::spawn(self.clone().run_promotion_worker(promotion_rx)));

        let appointees_rx = inner.appointees_rx.lock().await.take().context("leader snapshots already taken")?;
        inner.appointees.start(true).await.context("error starting leader cache")?;
        tasks.push(tokio::spawn(self.clone().run_appointees_consumer(appointees_rx)));

        if inner.config.appoint_leaders {
            let appointer = LeaderAppointer::new(inner.store.clone(), partition, replica, inner.stop_tx.subscribe())
                .context("error creating leader appointer")?;
            let handle = appointer.spawn();
            tasks.push(tokio::spawn(async move {
                match handle.await {
                    Ok(Ok(())) => (),
                    Ok(Err(err)) => tracing::error!(error = ?err, "error from leader appointer"),
                    Err(err) => tracing::error!(error = ?err, "leader appointer panicked"),
                }
            }));
        }

        inner.tasks.lock().await.extend(tasks);
        tracing::info!(kind = ?inner.config.kind, "{} configured", inner.whoami);
        Ok(())
    }

    /// Install a listener of durable unique id updates on the site.
    pub fn set_durable_unique_id_listener(&self, listener: Arc<dyn DurableUniqueIdListener>) {
        let site = self.inner.site.clone();
        if !self.inner.queue.offer(move || site.set_durable_unique_id_listener(listener)) {
            tracing::warn!("{} dropped durable unique id listener, task queue stopped", self.inner.whoami);
        }
    }

    /// Build & install the site's DR gateways.
    ///
    /// When `create_mp_gateway` is set, a gateway for the multi-partition coordinator is built
    /// alongside the partition's own.
    pub async fn init_dr_gateway(&self, factory: Option<&DrGatewayFactory>, create_mp_gateway: bool) -> Result<()> {
        let partition = self.inner.config.partition;
        let gateway = factory.map(|factory| factory(partition)).transpose()?;
        let mp_gateway = match factory {
            Some(factory) if create_mp_gateway => Some(factory(MP_PARTITION)?),
            _ => None,
        };
        let site = self.inner.site.clone();
        self.inner
            .queue
            .submit(move || site.set_dr_gateway(gateway, mp_gateway))
            .await?
            .context("error installing DR gateway")
    }

    /// Shutdown this initiator.
    ///
    /// Safe to call during an in-flight promotion, which observes the shutdown as a
    /// cancellation and exits without committing.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("{} shutting down", inner.whoami);
        let _ = inner.stop_tx.send(());
        inner.appointees.shutdown();
        inner.balance_requests.shutdown();
        inner.masters.shutdown();

        let tasks: Vec<_> = inner.tasks.lock().await.drain(..).collect();
        for handle in tasks {
            if let Err(err) = handle.await {
                tracing::error!(error = ?err, "error joining initiator task");
            }
        }
        if let Err(err) = inner.store.close().await {
            tracing::error!(error = ?err, "error closing coordination store session");
        }
        metrics::gauge!(METRIC_IS_LEADER, 0.0, "partition" => inner.config.partition.to_string(), "replica" => inner.config.replica.to_string());
    }

    /// Record a fatal error & signal the process to shutdown.
    fn crash(&self, context: &str, err: &dyn std::fmt::Display) {
        let inner = &self.inner;
        if inner.shutting_down.load(Ordering::Acquire) {
            tracing::debug!(error = %err, "{}: {} during shutdown", inner.whoami, context);
            return;
        }
        tracing::error!(
            partition = %inner.config.partition,
            replica = %inner.config.replica,
            error = %err,
            "{}: {}, shutting down",
            inner.whoami,
            context,
        );
        inner.fatal.store(Some(Arc::new(format!("{}: {}", context, err))));
        let _ = inner.app_shutdown.send(());
    }

    /*
     * Snapshot consumers.
     */

    async fn run_appointees_consumer(self, mut rx: mpsc::Receiver<Arc<LeaderSnapshot>>) {
        let mut stop = self.inner.stop_tx.subscribe();
        loop {
            tokio::select! {
                snapshot_opt = rx.recv() => match snapshot_opt {
                    Some(snapshot) => self.handle_leaders_snapshot(snapshot),
                    None => break,
                },
                _ = stop.recv() => break,
            }
        }
    }

    /// React to a new snapshot of the appointee entries.
    ///
    /// Delivering the same snapshot any number of times has the effect of delivering it once.
    pub fn handle_leaders_snapshot(&self, snapshot: Arc<LeaderSnapshot>) {
        let inner = &self.inner;
        let (partition, replica) = (inner.config.partition, inner.config.replica);
        inner.latest.send_replace(snapshot.clone());

        let assignment = match snapshot.leaders.get(&partition) {
            Some(assignment) => *assignment,
            None => return,
        };
        if assignment.leader == replica {
            if inner.handing_off.load(Ordering::Acquire) {
                // Reappointed after the handoff was written, the target never took over.
                let handoff_version = inner.handoff_version.load(Ordering::Acquire);
                let version = snapshot.versions.get(&partition).copied().unwrap_or(0);
                if handoff_version == 0 || version <= handoff_version || assignment.balance_requested {
                    return;
                }
                tracing::warn!(version, handoff_version, "{} reappointed, migration handoff failed", inner.whoami);
                inner.handing_off.store(false, Ordering::Release);
                inner.handoff_version.store(0, Ordering::Release);
                inner.balance_requested.store(false, Ordering::Release);
            }
            if inner.role.transition(Role::Replica, Role::Promoting) {
                inner.balance_requested.store(assignment.balance_requested, Ordering::Release);
                tracing::info!(seq = snapshot.seq, migration = assignment.balance_requested, "{} accepting promotion", inner.whoami);
                // A full channel means a request is already pending.
                let _ = inner.promotion_tx.try_send(());
            }
            return;
        }

        if inner.handing_off.swap(false, Ordering::AcqRel) {
            inner.handoff_version.store(0, Ordering::Release);
            inner.balance_requested.store(false, Ordering::Release);
            tracing::info!(new_leader = %assignment.leader, "{} leadership migrated", inner.whoami);
            return;
        }
        if inner.role.transition(Role::Leader, Role::Replica) {
            tracing::warn!(new_leader = %assignment.leader, "{} stepping down as leader", inner.whoami);
            inner.stats.demotions.fetch_add(1, Ordering::Relaxed);
            metrics::gauge!(METRIC_IS_LEADER, 0.0, "partition" => partition.to_string(), "replica" => replica.to_string());
            let site = inner.site.clone();
            if !inner.queue.offer(move || site.set_leader_state(false, None)) {
                tracing::warn!("{} dropped step down, task queue stopped", inner.whoami);
            }
        }
    }

    async fn run_balance_requests_consumer(self, mut rx: mpsc::Receiver<Arc<LeaderSnapshot>>) {
        let mut stop = self.inner.stop_tx.subscribe();
        loop {
            tokio::select! {
                snapshot_opt = rx.recv() => match snapshot_opt {
                    Some(snapshot) => self.handle_balance_requests(snapshot).await,
                    None => break,
                },
                _ = stop.recv() => break,
            }
        }
    }

    async fn handle_balance_requests(&self, snapshot: Arc<LeaderSnapshot>) {
        let inner = &self.inner;
        let request = match snapshot.leaders.get(&inner.config.partition) {
            Some(request) if request.balance_requested => *request,
            _ => return,
        };
        if inner.role.load() != Role::Leader || request.leader == inner.config.replica {
            return;
        }
        if let Err(err) = self.start_balance(request.leader).await {
            self.crash("error migrating partition leadership", &err);
        }
    }

    /// Hand leadership of this replica's partition to `new_leader`.
    ///
    /// Returns false if the migration was abandoned, because the target is not a live participant
    /// of the partition, because this replica is no longer leader, or because the appointee
    /// entry was concurrently changed.
    #[tracing::instrument(level = "debug", skip(self), fields(partition = %self.partition()))]
    pub async fn start_balance(&self, new_leader: ReplicaId) -> Result<bool, PromotionError> {
        let inner = &self.inner;
        let (partition, replica) = (inner.config.partition, inner.config.replica);
        tracing::info!(%new_leader, "{} migrating leadership", inner.whoami);

        if !inner.migration.is_participant(new_leader).await.map_err(unexpected)? {
            tracing::warn!(%new_leader, "{} migration target is not a live participant, rejecting", inner.whoami);
            if let Err(err) = inner.balance_requests.remove(partition).await {
                tracing::error!(error = ?err, "{} error removing rejected balance request", inner.whoami);
            }
            return Ok(false);
        }

        // Indicators go up before any leadership change is visible.
        inner.migration.publish_indicators().await.map_err(unexpected)?;

        inner.handoff_version.store(0, Ordering::Release);
        inner.handing_off.store(true, Ordering::Release);
        inner.balance_requested.store(true, Ordering::Release);
        if !inner.role.transition(Role::Leader, Role::Replica) {
            tracing::info!("{} is no longer leader, abandoning migration", inner.whoami);
            self.abandon_balance().await;
            return Ok(false);
        }
        metrics::gauge!(METRIC_IS_LEADER, 0.0, "partition" => partition.to_string(), "replica" => replica.to_string());
        let site = inner.site.clone();
        inner
            .queue
            .submit(move || site.set_leader_state(false, None))
            .await
            .map_err(PromotionError::Unexpected)?;

        loop {
            match inner.migration.rewrite_assignment(&inner.appointees, new_leader).await {
                Ok(version) => {
                    inner.handoff_version.store(version, Ordering::Release);
                    break;
                }
                Err(StoreError::WriteConflict { .. }) => {
                    // Retry only if our own view of the entry was stale.
                    if inner.migration.current_appointee().await.map_err(unexpected)? == Some(replica) {
                        continue;
                    }
                    tracing::info!("{} appointee changed concurrently, abandoning migration", inner.whoami);
                    self.abandon_balance().await;
                    return Ok(false);
                }
                Err(err) => return Err(unexpected(err)),
            }
        }
        inner.stats.migrations.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!(METRIC_MIGRATIONS);

        if let Err(err) = inner.balance_requests.remove(partition).await {
            tracing::error!(error = ?err, "{} error removing consumed balance request", inner.whoami);
        }
        // A reappointment seen before the version was recorded was ignored.
        let latest = inner.latest.borrow().clone();
        self.handle_leaders_snapshot(latest);
        Ok(true)
    }

    async fn abandon_balance(&self) {
        let inner = &self.inner;
        inner.handing_off.store(false, Ordering::Release);
        inner.handoff_version.store(0, Ordering::Release);
        inner.balance_requested.store(false, Ordering::Release);
        if let Err(err) = migration::clear_indicators(&inner.store, inner.config.partition).await {
            tracing::error!(error = ?err, "{} error clearing balance indicators", inner.whoami);
        }
        // Any appointment seen while handing off was ignored, take another look.
        let latest = inner.latest.borrow().clone();
        self.handle_leaders_snapshot(latest);
    }

    async fn run_masters_consumer(self, mut rx: mpsc::Receiver<Arc<LeaderSnapshot>>) {
        let mut stop = self.inner.stop_tx.subscribe();
        let mut last_seen = BTreeMap::new();
        loop {
            tokio::select! {
                snapshot_opt = rx.recv() => match snapshot_opt {
                    Some(snapshot) => self.handle_masters_snapshot(snapshot, &mut last_seen).await,
                    None => break,
                },
                _ = stop.recv() => break,
            }
        }
    }

    /// React to changes of canonical leaders.
    ///
    /// A change covered by a balance indicator addressed to this replica consumes the indicator
    /// instead of being reported to the site.
    async fn handle_masters_snapshot(&self, snapshot: Arc<LeaderSnapshot>, last_seen: &mut BTreeMap<PartitionId, ReplicaId>) {
        let inner = &self.inner;
        let changed: Vec<_> = snapshot
            .leaders
            .values()
            .filter(|assignment| last_seen.get(&assignment.partition) != Some(&assignment.leader))
            .map(|assignment| (assignment.partition, assignment.leader))
            .collect();
        *last_seen = snapshot.leaders.values().map(|assignment| (assignment.partition, assignment.leader)).collect();
        if changed.is_empty() {
            return;
        }

        let marker = BalanceMarker::for_replica(inner.config.partition, inner.config.replica);
        let suppressed = match migration::is_suppressed(&inner.store, marker).await {
            Ok(suppressed) => suppressed,
            Err(err) => {
                tracing::warn!(error = ?err, "{} error checking balance indicators", inner.whoami);
                false
            }
        };
        for (partition, leader) in changed {
            if suppressed {
                let indicator = BalanceIndicator {
                    marker,
                    partition,
                    replica: inner.config.replica,
                };
                match migration::consume_indicator(&inner.store, &indicator).await {
                    Ok(true) => {
                        tracing::debug!(%partition, %leader, "{} leader change is a migration, not reacting", inner.whoami);
                        continue;
                    }
                    Ok(false) => (),
                    Err(err) => tracing::warn!(error = ?err, "{} error consuming balance indicator", inner.whoami),
                }
            }
            let site = inner.site.clone();
            if !inner.queue.offer(move || site.leader_changed(partition, leader)) {
                tracing::warn!("{} dropped leader change, task queue stopped", inner.whoami);
            }
        }
    }

    /*
     * Promotion.
     */

    async fn run_promotion_worker(self, mut rx: mpsc::Receiver<()>) {
        let mut stop = self.inner.stop_tx.subscribe();
        loop {
            tokio::select! {
                req = rx.recv() => if req.is_none() { break },
                _ = stop.recv() => break,
            }
            match self.accept_promotion().await {
                Ok(PromotionOutcome::Promoted { .. }) => (),
                Ok(PromotionOutcome::Superseded) => {
                    self.inner.role.transition(Role::Promoting, Role::Replica);
                    let latest = self.inner.latest.borrow().clone();
                    self.handle_leaders_snapshot(latest);
                }
                Ok(PromotionOutcome::ShutDown) => break,
                Err(err) => {
                    self.crash("terminally failed leader promotion", &err);
                    break;
                }
            }
        }
    }

    /// Promote this replica to leader of its partition.
    ///
    /// A promotion after a failure first repairs the partition's replicas, retrying with a fresh
    /// term every time the repair is cancelled. A migration handoff skips the repair entirely.
    /// The migration flag is cleared whatever the outcome.
    #[tracing::instrument(level = "debug", skip(self), fields(partition = %self.partition(), replica = %self.replica()))]
    pub async fn accept_promotion(&self) -> Result<PromotionOutcome, PromotionError> {
        let outcome = self.try_accept_promotion().await;
        self.inner.balance_requested.store(false, Ordering::Release);
        outcome
    }

    async fn try_accept_promotion(&self) -> Result<PromotionOutcome, PromotionError> {
        let inner = &self.inner;
        let (partition, replica) = (inner.config.partition, inner.config.replica);
        let migration = inner.balance_requested.load(Ordering::Acquire);
        inner.role.transition(Role::Replica, Role::Promoting);

        let mut attempts = 0;
        loop {
            if inner.shutting_down.load(Ordering::Acquire) {
                return Ok(PromotionOutcome::ShutDown);
            }
            if inner.site.is_rejoining() {
                return Err(PromotionError::Rejoining { partition });
            }
            attempts += 1;
            inner.stats.promotion_attempts.fetch_add(1, Ordering::Relaxed);
            metrics::increment_counter!(METRIC_PROMOTION_ATTEMPTS, "partition" => partition.to_string(), "replica" => replica.to_string());

            let repaired = if migration {
                tracing::debug!("{} skipping repair for migration handoff", inner.whoami);
                None
            } else {
                match self.repair().await {
                    Ok(result) => Some(result.highest_safe_txn),
                    Err(RepairError::Cancelled(CancelReason::Shutdown)) => return Ok(PromotionOutcome::ShutDown),
                    Err(RepairError::Cancelled(CancelReason::Superseded)) => return Ok(PromotionOutcome::Superseded),
                    Err(RepairError::Cancelled(_)) => {
                        tokio::time::sleep(utils::jittered(RETRY_BACKOFF)).await;
                        continue;
                    }
                    Err(RepairError::Failed(err)) => return Err(PromotionError::Unexpected(err)),
                }
            };

            if self.is_superseded() {
                tracing::info!("{} promotion superseded by a newer appointment", inner.whoami);
                return Ok(PromotionOutcome::Superseded);
            }
            match inner.masters.put(partition, replica).await {
                Ok(_) => (),
                Err(StoreError::WriteConflict { .. }) if self.is_superseded() => return Ok(PromotionOutcome::Superseded),
                Err(StoreError::WriteConflict { .. }) => {
                    tracing::debug!("{} canonical leader entry changed concurrently, retrying", inner.whoami);
                    continue;
                }
                Err(StoreError::SessionClosed) => return Ok(PromotionOutcome::ShutDown),
                Err(err) => return Err(unexpected(err)),
            }

            inner.role.store(Role::Leader);
            let site = inner.site.clone();
            inner
                .queue
                .submit(move || site.set_leader_state(true, repaired))
                .await
                .map_err(PromotionError::Unexpected)?;
            metrics::increment_counter!(METRIC_PROMOTIONS, "partition" => partition.to_string(), "replica" => replica.to_string());
            metrics::gauge!(METRIC_IS_LEADER, 1.0, "partition" => partition.to_string(), "replica" => replica.to_string());
            tracing::info!(highest_safe_txn = ?repaired, attempts, migration, "{} promoted to leader", inner.whoami);

            if !migration {
                // Indicators of a handoff which never completed must not outlive it.
                match migration::clear_indicators(&inner.store, partition).await {
                    Ok(0) => (),
                    Ok(removed) => tracing::info!(removed, "{} cleared balance indicators of an abandoned handoff", inner.whoami),
                    Err(err) => tracing::error!(error = ?err, "{} error clearing balance indicators", inner.whoami),
                }
                if inner.config.kind.takes_export_mastership() {
                    if let Err(err) = inner.export.accept_mastership(partition) {
                        tracing::error!(error = ?err, "{} error accepting export mastership", inner.whoami);
                    }
                }
            }
            inner.stats.promotions.fetch_add(1, Ordering::Relaxed);
            return Ok(PromotionOutcome::Promoted {
                highest_safe_txn: repaired,
                attempts,
            });
        }
    }

    /// Run one repair attempt under a fresh term.
    async fn repair(&self) -> Result<RepairResult, RepairError> {
        let inner = &self.inner;
        let term = Term::start(inner.store.clone(), inner.config.partition, inner.config.replica, &inner.whoami)
            .await
            .map_err(|err| match err {
                StoreError::SessionClosed => RepairError::Cancelled(CancelReason::Shutdown),
                err => RepairError::Failed(err.into()),
            })?;
        inner.stats.repairs.fetch_add(1, Ordering::Relaxed);
        let coordinator = RepairCoordinator::new(inner.transport.clone(), inner.config.partition, inner.whoami.clone(), inner.config.repair_timeout);
        let res = coordinator.run(&term, self.cancellation()).await;
        if let Err(RepairError::Cancelled(reason)) = &res {
            inner.stats.cancellations.fetch_add(1, Ordering::Relaxed);
            metrics::increment_counter!(METRIC_REPAIR_CANCELLATIONS);
            tracing::info!(
                elapsed = ?term.elapsed(),
                started_at = %term.started_at,
                "{} restarting leader promotion: {}",
                inner.whoami,
                reason,
            );
        }
        res
    }

    /// Resolves once the in-flight promotion must be abandoned.
    async fn cancellation(&self) -> CancelReason {
        let inner = &self.inner;
        let mut stop = inner.stop_tx.subscribe();
        let mut latest = inner.latest.subscribe();
        loop {
            if inner.shutting_down.load(Ordering::Acquire) {
                return CancelReason::Shutdown;
            }
            if self.is_superseded() {
                return CancelReason::Superseded;
            }
            tokio::select! {
                res = latest.changed() => if res.is_err() {
                    return futures::future::pending().await;
                },
                _ = stop.recv() => return CancelReason::Shutdown,
            }
        }
    }

    /// Whether the newest appointment names a different leader.
    fn is_superseded(&self) -> bool {
        let inner = &self.inner;
        matches!(inner.latest.borrow().leader_of(inner.config.partition), Some(leader) if leader != inner.config.replica)
    }
}

fn unexpected(err: StoreError) -> PromotionError {
    PromotionError::Unexpected(err.into())
}
