//! A coordination store backed by a local sled database.
//!
//! Every handle is a session: ephemeral nodes written through a handle are owned by its session
//! and are removed when the session is closed. Handles created through `new_session` share the
//! same underlying database, which is how several replicas hosted in one process observe each
//! other.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sled::{Config as SledConfig, Db, IVec, Tree};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ShutdownError, ShutdownResult, StoreError, StoreResult, ERR_ITER_FAILURE, ERR_STORE_FLUSH};
use crate::store::{CoordinationStore, NodeMode, Precondition, StoreEvent, Versioned};
use crate::utils;

/// The DB tree holding all nodes.
const TREE_NODES: &str = "nodes";
/// The DB tree mapping each ephemeral node to the session which owns it.
const TREE_EPHEMERAL_OWNERS: &str = "ephemeral_owners";
/// The buffer size of each watch channel.
const WATCH_BUFFER: usize = 1000;

/// A session with a sled backed coordination store.
#[derive(Clone)]
pub struct SledStore {
    inner: Arc<SledStoreInner>,
    /// The id of this session.
    session: Uuid,
    /// A channel signalling that this session has been closed.
    closed: Arc<watch::Sender<bool>>,
}

struct SledStoreInner {
    /// The underlying DB handle.
    db: Db,
    /// The tree of all nodes, values are encoded with `utils::encode_versioned`.
    nodes: Tree,
    /// The tree of ephemeral node owners.
    owners: Tree,
}

impl SledStore {
    /// Open the store for usage.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // Determine the database path, and ensure it exists.
        let dbpath = PathBuf::from(&config.storage_data_path).join(format!("host-{}", config.host_id));
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for coordination store")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).mode(sled::Mode::HighThroughput).open()?;
            Self::from_db(db)
        })
        .await?
    }

    /// Build a store over an already opened database.
    ///
    /// Ephemeral nodes left behind by sessions of a previous process are removed, as those
    /// sessions can no longer be alive.
    pub fn from_db(db: Db) -> Result<Self> {
        let nodes = db.open_tree(TREE_NODES).context("error opening nodes tree")?;
        let owners = db.open_tree(TREE_EPHEMERAL_OWNERS).context("error opening ephemeral owners tree")?;
        let mut purged = 0;
        for kv_res in owners.iter() {
            let (key, _) = kv_res.context(ERR_ITER_FAILURE)?;
            nodes.remove(&key).context("error purging orphaned ephemeral node")?;
            owners.remove(&key).context("error purging orphaned ephemeral owner")?;
            purged += 1;
        }
        if purged > 0 {
            tracing::info!(purged, "removed ephemeral nodes of previous sessions");
        }
        let (closed, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(SledStoreInner { db, nodes, owners }),
            session: Uuid::new_v4(),
            closed: Arc::new(closed),
        })
    }

    /// Open a new session on the same underlying database.
    pub fn new_session(&self) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: self.inner.clone(),
            session: Uuid::new_v4(),
            closed: Arc::new(closed),
        }
    }

    /// Flush all pending writes to disk.
    pub async fn flush(&self) -> Result<()> {
        self.inner.db.flush_async().await.context(ERR_STORE_FLUSH)?;
        Ok(())
    }

    /// Spawn a blocking database-related function, returning a ShutdownError if anything goes
    /// wrong related to spawning & joining.
    #[tracing::instrument(level = "trace", skip(f), err)]
    pub async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
    }

    /// Run the given function against the database on the blocking pool.
    async fn blocking<F, R>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&SledStoreInner) -> StoreResult<R> + Send + 'static,
        R: Send + 'static,
    {
        self.ensure_open()?;
        let inner = self.inner.clone();
        Self::spawn_blocking(move || f(&inner))
            .await
            .map_err(|err| StoreError::CoordinationUnavailable(err.0))?
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if *self.closed.borrow() {
            return Err(StoreError::SessionClosed);
        }
        Ok(())
    }
}

impl SledStoreInner {
    fn decode(path: &str, raw: &[u8]) -> StoreResult<Versioned> {
        let (version, data) = utils::decode_versioned(raw).map_err(|err| StoreError::Malformed {
            path: path.into(),
            reason: err.to_string(),
        })?;
        Ok(Versioned { version, data: data.to_vec() })
    }

    fn put(&self, path: &str, data: &[u8], precondition: Precondition, mode: NodeMode, session: Uuid) -> StoreResult<u64> {
        loop {
            let current = self.nodes.get(path)?;
            let current_version = match &current {
                Some(raw) => Some(Self::decode(path, raw)?.version),
                None => None,
            };
            let satisfied = match (precondition, current_version) {
                (Precondition::Any, _) => true,
                (Precondition::Absent, None) => true,
                (Precondition::Version(expected), Some(actual)) => expected == actual,
                _ => false,
            };
            if !satisfied {
                return Err(StoreError::WriteConflict {
                    path: path.into(),
                    actual: current_version,
                });
            }

            let version = current_version.unwrap_or(0) + 1;
            let value = IVec::from(utils::encode_versioned(version, data));
            match self.nodes.compare_and_swap(path, current.as_ref(), Some(value))? {
                Ok(()) => (),
                // An unconditional write simply retries against the newer value.
                Err(_) if precondition == Precondition::Any => continue,
                Err(err) => {
                    let actual = err
                        .current
                        .as_deref()
                        .and_then(|raw| utils::decode_versioned(raw).ok())
                        .map(|(version, _)| version);
                    return Err(StoreError::WriteConflict { path: path.into(), actual });
                }
            }

            match mode {
                NodeMode::Ephemeral => {
                    self.owners.insert(path, session.as_bytes().as_ref())?;
                }
                NodeMode::Persistent => {
                    self.owners.remove(path)?;
                }
            }
            return Ok(version);
        }
    }

    fn remove_session_nodes(&self, session: Uuid) -> StoreResult<usize> {
        let mut removed = 0;
        for kv_res in self.owners.iter() {
            let (key, owner) = kv_res?;
            if owner.as_ref() != session.as_bytes().as_ref() {
                continue;
            }
            self.nodes.remove(&key)?;
            self.owners.remove(&key)?;
            removed += 1;
        }
        Ok(removed)
    }
}

#[async_trait]
impl CoordinationStore for SledStore {
    fn session_id(&self) -> Uuid {
        self.session
    }

    async fn get(&self, path: &str) -> StoreResult<Option<Versioned>> {
        let path = path.to_string();
        self.blocking(move |inner| match inner.nodes.get(&path)? {
            Some(raw) => Ok(Some(SledStoreInner::decode(&path, &raw)?)),
            None => Ok(None),
        })
        .await
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Versioned)>> {
        let prefix = prefix.to_string();
        self.blocking(move |inner| {
            inner.nodes.scan_prefix(prefix.as_bytes()).try_fold(vec![], |mut acc, kv_res| {
                let (key, raw) = kv_res?;
                let path = String::from_utf8_lossy(&key).into_owned();
                let node = SledStoreInner::decode(&path, &raw)?;
                acc.push((path, node));
                Ok(acc)
            })
        })
        .await
    }

    async fn put(&self, path: &str, data: Vec<u8>, precondition: Precondition, mode: NodeMode) -> StoreResult<u64> {
        let (path, session) = (path.to_string(), self.session);
        self.blocking(move |inner| inner.put(&path, &data, precondition, mode, session)).await
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        let path = path.to_string();
        self.blocking(move |inner| {
            inner.nodes.remove(path.as_bytes())?;
            inner.owners.remove(path.as_bytes())?;
            Ok(())
        })
        .await
    }

    fn watch(&self, prefix: &str) -> StoreResult<mpsc::Receiver<StoreEvent>> {
        self.ensure_open()?;
        let mut subscriber = self.inner.nodes.watch_prefix(prefix.as_bytes());
        let mut closed = self.closed.subscribe();
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event_opt = &mut subscriber => {
                        let event = match event_opt {
                            Some(sled::Event::Insert { key, value }) => StoreEvent::Put {
                                path: String::from_utf8_lossy(&key).into_owned(),
                                version: utils::decode_versioned(&value).map(|(version, _)| version).unwrap_or_default(),
                            },
                            Some(sled::Event::Remove { key }) => StoreEvent::Deleted {
                                path: String::from_utf8_lossy(&key).into_owned(),
                            },
                            None => break,
                        };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    _ = tx.closed() => break,
                    _ = closed.changed() => break,
                }
            }
        });
        Ok(rx)
    }

    async fn close(&self) -> StoreResult<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        let (inner, session) = (self.inner.clone(), self.session);
        let removed = Self::spawn_blocking(move || inner.remove_session_nodes(session))
            .await
            .map_err(|err| StoreError::CoordinationUnavailable(err.0))??;
        tracing::debug!(session = %self.session, removed, "coordination store session closed");
        Ok(())
    }
}
