//! Typed messages for node-to-node transaction traffic

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shardline_common::{NodeId, PartitionId, TransactionId, TransactionResult};
use shardline_hlc::HybridTimestamp;
use thiserror::Error;

/// Finish a transaction at its commit partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishTxRequest {
    pub tx_id: TransactionId,
    pub commit_partition: PartitionId,
    pub commit: bool,
    /// Present when committing
    pub commit_timestamp: Option<HybridTimestamp>,
    pub enlisted_partitions: Vec<PartitionId>,
}

/// Resolve the write intents of a finished transaction in one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteIntentSwitchRequest {
    pub tx_id: TransactionId,
    pub partition: PartitionId,
    pub commit: bool,
    pub commit_timestamp: Option<HybridTimestamp>,
}

/// Ask a commit partition about the state of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxStateCommitPartitionRequest {
    pub tx_id: TransactionId,
    pub commit_partition: PartitionId,
    pub read_timestamp: HybridTimestamp,
}

/// Ask a commit partition to recover an abandoned transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecoveryMessage {
    pub tx_id: TransactionId,
    pub commit_partition: PartitionId,
}

/// Request addressed to the primary replica of a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaRequest {
    FinishTx(FinishTxRequest),
    WriteIntentSwitch(WriteIntentSwitchRequest),
    TxStateCommitPartition(TxStateCommitPartitionRequest),
    TxRecovery(TxRecoveryMessage),
}

impl ReplicaRequest {
    /// Partition whose primary must handle this request.
    pub fn partition(&self) -> PartitionId {
        match self {
            ReplicaRequest::FinishTx(req) => req.commit_partition,
            ReplicaRequest::WriteIntentSwitch(req) => req.partition,
            ReplicaRequest::TxStateCommitPartition(req) => req.commit_partition,
            ReplicaRequest::TxRecovery(req) => req.commit_partition,
        }
    }

    pub fn tx_id(&self) -> TransactionId {
        match self {
            ReplicaRequest::FinishTx(req) => req.tx_id,
            ReplicaRequest::WriteIntentSwitch(req) => req.tx_id,
            ReplicaRequest::TxStateCommitPartition(req) => req.tx_id,
            ReplicaRequest::TxRecovery(req) => req.tx_id,
        }
    }

    /// Short name used in logs and message counters.
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicaRequest::FinishTx(_) => "finish_tx",
            ReplicaRequest::WriteIntentSwitch(_) => "write_intent_switch",
            ReplicaRequest::TxStateCommitPartition(_) => "tx_state",
            ReplicaRequest::TxRecovery(_) => "tx_recovery",
        }
    }
}

/// Successful answer of a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaResponse {
    /// Outcome (or current state) of a transaction
    TxResult(TransactionResult),
    /// Intents switched
    Switched,
}

/// Failure answered by a replica or produced by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ReplicaFailure {
    /// The transaction is already finished with a different outcome.
    #[error("transaction {tx_id} is already finished as {stored}")]
    MismatchingOutcome {
        tx_id: TransactionId,
        stored: TransactionResult,
    },

    #[error("node {node} is not the primary of partition {partition}")]
    PrimaryReplicaMiss { partition: PartitionId, node: NodeId },

    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    #[error("node is stopping")]
    NodeStopping,

    #[error("request timed out")]
    Timeout,

    #[error("failed to acquire a lock for transaction {0}")]
    AcquireLock(TransactionId),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ReplicaFailure {
    /// Whether the caller should retry against the latest primary.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReplicaFailure::PrimaryReplicaMiss { .. }
                | ReplicaFailure::NodeNotFound(_)
                | ReplicaFailure::Timeout
        )
    }
}

/// Message could not be encoded or decoded.
#[derive(Debug, Error)]
#[error("protocol encoding error: {0}")]
pub struct ProtocolError(String);

/// Encode a message for the wire
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(message, &mut bytes).map_err(|e| ProtocolError(e.to_string()))?;
    Ok(bytes)
}

/// Decode a message from the wire
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError(e.to_string()))
}
