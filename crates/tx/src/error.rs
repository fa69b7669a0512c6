//! Error types for transaction management

use shardline_common::{PartitionId, TransactionId, TransactionResult};
use shardline_protocol::ReplicaFailure;
use thiserror::Error;

/// Result type for transaction operations
pub type Result<T> = std::result::Result<T, TxError>;

/// Transaction errors
///
/// Cloneable so that one recovery outcome can be shared by every caller waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TxError {
    /// The transaction was already finished with another outcome.
    #[error("transaction {tx_id} is already finished as {stored}, requested {requested}")]
    MismatchingOutcome {
        tx_id: TransactionId,
        stored: TransactionResult,
        requested: TransactionResult,
    },

    /// A lock could not be acquired within the configured window.
    #[error("failed to acquire a lock for transaction {0}")]
    AcquireLock(TransactionId),

    /// Waiting for a transaction to finish timed out.
    #[error("timed out waiting for transaction {0}")]
    WaitTimeout(TransactionId),

    #[error("no primary replica for partition {0}")]
    NoPrimaryReplica(PartitionId),

    #[error("replica request failed: {0}")]
    Replica(ReplicaFailure),

    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),

    #[error("node is stopping")]
    NodeStopping,
}

impl From<ReplicaFailure> for TxError {
    fn from(failure: ReplicaFailure) -> Self {
        match failure {
            ReplicaFailure::AcquireLock(tx_id) => TxError::AcquireLock(tx_id),
            ReplicaFailure::NodeStopping => TxError::NodeStopping,
            other => TxError::Replica(other),
        }
    }
}

impl TxError {
    /// Whether retrying against the latest primary may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TxError::Replica(failure) => failure.is_transient(),
            TxError::NoPrimaryReplica(_) => true,
            _ => false,
        }
    }
}
