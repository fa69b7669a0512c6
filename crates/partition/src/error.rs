//! Error types for the partition state machine and replica

use shardline_common::{PartitionId, TransactionId, TransactionResult};
use shardline_hlc::HybridTimestamp;
use shardline_protocol::ReplicaFailure;
use shardline_tx::TxError;
use thiserror::Error;

/// A command was rejected. The applied position still advances and the state machine
/// keeps running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The command's safe time is not greater than one already observed.
    #[error("safe time reorder: proposed {proposed}, already observed {max_observed}")]
    SafeTimeReorder {
        proposed: HybridTimestamp,
        max_observed: HybridTimestamp,
    },

    /// The transaction is already finished with a different outcome.
    #[error("transaction {tx_id} is already finished as {stored}, requested {requested}")]
    MismatchingOutcome {
        tx_id: TransactionId,
        stored: TransactionResult,
        requested: TransactionResult,
    },

    /// The mutation conflicts with another transaction's write intent.
    #[error("write conflict: {0}")]
    WriteConflict(String),

    #[error("invalid command: {0}")]
    Invalid(String),
}

/// The state machine cannot continue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalError {
    #[error("failed to decode command at index {index}: {reason}")]
    Decode { index: u64, reason: String },

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("state machine is stopped")]
    Stopped,
}

impl From<shardline_mvcc::Error> for FatalError {
    fn from(error: shardline_mvcc::Error) -> Self {
        FatalError::Storage(error.to_string())
    }
}

/// Failure of a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicationError {
    #[error("failed to encode command: {0}")]
    Encode(String),

    /// Every attempt was rejected for safe time reorder.
    #[error("gave up after {0} safe time reorder retries")]
    ReorderRetriesExhausted(u32),

    #[error(transparent)]
    Fatal(#[from] FatalError),
}

/// Result type of replica operations
pub type Result<T> = std::result::Result<T, ReplicaError>;

/// Error returned by a primary replica.
#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),

    #[error(transparent)]
    Tx(#[from] TxError),

    #[error("storage error: {0}")]
    Storage(#[from] shardline_mvcc::Error),

    #[error("timed out waiting for safe time {0}")]
    SafeTimeTimeout(HybridTimestamp),

    #[error("replica of {0} is stopping")]
    Stopping(PartitionId),

    #[error("index {0} is not known")]
    UnknownIndex(u32),
}

impl From<ReplicaError> for ReplicaFailure {
    fn from(error: ReplicaError) -> Self {
        match error {
            ReplicaError::Command(CommandError::MismatchingOutcome { tx_id, stored, .. }) => {
                ReplicaFailure::MismatchingOutcome { tx_id, stored }
            }
            ReplicaError::Tx(TxError::AcquireLock(tx_id)) => ReplicaFailure::AcquireLock(tx_id),
            ReplicaError::Tx(TxError::NodeStopping) | ReplicaError::Stopping(_) => {
                ReplicaFailure::NodeStopping
            }
            ReplicaError::Tx(TxError::Replica(failure)) => failure,
            ReplicaError::SafeTimeTimeout(_) => ReplicaFailure::Timeout,
            other => ReplicaFailure::Internal(other.to_string()),
        }
    }
}
