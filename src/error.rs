//! Failover error abstractions.

use thiserror::Error;

use crate::models::{PartitionId, ReplicaId};

// Error messages.
pub const ERR_ITER_FAILURE: &str = "error returned during key/value iteration from coordination store";
pub const ERR_STORE_FLUSH: &str = "error flushing coordination store state";

/// Errors returned from the coordination store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or failed to serve the request.
    #[error("coordination store unavailable: {0}")]
    CoordinationUnavailable(anyhow::Error),
    /// A conditional write failed as another writer updated the node first.
    #[error("conditional write to {path} failed, current version is {actual:?}")]
    WriteConflict { path: String, actual: Option<u64> },
    /// The data found at the given path could not be decoded.
    #[error("malformed data found at {path}: {reason}")]
    Malformed { path: String, reason: String },
    /// The store session used for the request has already been closed.
    #[error("coordination store session is closed")]
    SessionClosed,
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        Self::CoordinationUnavailable(anyhow::Error::from(err))
    }
}

/// A result type where the error is a `StoreError`.
pub type StoreResult<T> = ::std::result::Result<T, StoreError>;

/// The reason a repair handshake was cancelled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// The set of interesting replicas changed during the handshake.
    ReplicaSetChanged,
    /// A replica did not answer within the repair round-trip timeout.
    Timeout(ReplicaId),
    /// A replica could not be reached.
    Unreachable(ReplicaId),
    /// A newer leader assignment names a different leader.
    Superseded,
    /// The initiator is shutting down.
    Shutdown,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReplicaSetChanged => write!(f, "replica set changed"),
            Self::Timeout(replica) => write!(f, "replica {} timed out", replica),
            Self::Unreachable(replica) => write!(f, "replica {} unreachable", replica),
            Self::Superseded => write!(f, "superseded by a newer leader assignment"),
            Self::Shutdown => write!(f, "shutting down"),
        }
    }
}

/// Errors returned from a repair handshake.
#[derive(Debug, Error)]
pub enum RepairError {
    /// The handshake lost a race against a concurrent change and may be retried.
    #[error("repair cancelled: {0}")]
    Cancelled(CancelReason),
    /// The handshake failed for a reason which retrying will not fix.
    #[error("repair failed: {0}")]
    Failed(anyhow::Error),
}

/// Errors which terminate a promotion attempt and the local node with it.
#[derive(Debug, Error)]
pub enum PromotionError {
    /// The local replica is rejoining and can not guarantee a consistent history.
    #[error("a rejoining site can not be promoted to leader of partition {partition}")]
    Rejoining { partition: PartitionId },
    /// Any other failure during promotion.
    #[error("terminally failed leader promotion: {0}")]
    Unexpected(anyhow::Error),
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
