//! Cluster errors

use shardline_common::{NodeId, PartitionId};
use shardline_partition::ReplicaError;
use shardline_tx::TxError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Replica(#[from] ReplicaError),

    #[error(transparent)]
    Tx(#[from] TxError),

    #[error("storage error: {0}")]
    Storage(#[from] shardline_mvcc::Error),

    #[error("node {0} is not part of the cluster")]
    UnknownNode(NodeId),

    #[error("no live primary for partition {0}")]
    NoPrimary(PartitionId),

    #[error("transaction is already finished")]
    TransactionFinished,
}

pub type Result<T> = std::result::Result<T, ClusterError>;
