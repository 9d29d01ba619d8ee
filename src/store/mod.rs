//! Coordination store abstractions.
//!
//! The coordination store is the single source of truth for leader assignment. It is treated as
//! an external linearizable key-value service providing three primitives which the failover
//! protocol depends upon:
//!
//! - conditional writes checked against a per-node version number, which is how all real
//! exclusion between competing writers happens;
//! - ephemeral nodes, which disappear when the session which created them closes, and which are
//! how the departure of a replica or a host is observed;
//! - prefix watches, which drive every cache and watcher in this crate.

pub mod paths;
mod sled_store;
#[cfg(test)]
mod sled_store_test;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::StoreResult;

pub use sled_store::SledStore;

/// A shared handle to a coordination store session.
pub type Store = Arc<dyn CoordinationStore>;

/// The data of a node along with its version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned {
    pub version: u64,
    pub data: Vec<u8>,
}

/// The precondition of a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precondition {
    /// The write is unconditional.
    Any,
    /// The node must not exist.
    Absent,
    /// The node must exist at exactly the given version.
    Version(u64),
}

impl From<Option<u64>> for Precondition {
    fn from(version: Option<u64>) -> Self {
        match version {
            Some(version) => Self::Version(version),
            None => Self::Absent,
        }
    }
}

/// The lifetime of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeMode {
    /// The node lives until it is deleted.
    Persistent,
    /// The node is removed when the session which last wrote it closes.
    Ephemeral,
}

/// A change observed on a watched prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    Put { path: String, version: u64 },
    Deleted { path: String },
}

impl StoreEvent {
    /// The path of the node which changed.
    pub fn path(&self) -> &str {
        match self {
            Self::Put { path, .. } | Self::Deleted { path } => path,
        }
    }
}

/// A session with a linearizable coordination store.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// The id of this session.
    fn session_id(&self) -> Uuid;

    /// Get the node at the given path.
    async fn get(&self, path: &str) -> StoreResult<Option<Versioned>>;

    /// List all nodes under the given prefix, ordered by path.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Versioned)>>;

    /// Write the node at the given path, returning its new version.
    ///
    /// Fails with `StoreError::WriteConflict` if the precondition does not hold.
    async fn put(&self, path: &str, data: Vec<u8>, precondition: Precondition, mode: NodeMode) -> StoreResult<u64>;

    /// Delete the node at the given path. Deleting a missing node is not an error.
    async fn delete(&self, path: &str) -> StoreResult<()>;

    /// Watch all nodes under the given prefix.
    ///
    /// Only changes made after this call returns are delivered. The watch ends when the receiver
    /// is dropped or the session is closed.
    fn watch(&self, prefix: &str) -> StoreResult<mpsc::Receiver<StoreEvent>>;

    /// Close this session, removing every ephemeral node it owns.
    async fn close(&self) -> StoreResult<()>;
}
