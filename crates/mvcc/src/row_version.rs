//! Row version types returned by partition storage reads

use serde::{Deserialize, Serialize};
use shardline_common::{BinaryRow, PartitionId, RowId, TransactionId};
use shardline_hlc::HybridTimestamp;

/// Uncommitted version of a row, owned by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteIntent {
    pub tx_id: TransactionId,
    /// Where the owner's outcome will be persisted.
    pub commit_partition: PartitionId,
    /// `None` is a removal.
    pub row: Option<BinaryRow>,
}

/// Committed version of a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedVersion {
    pub commit_ts: HybridTimestamp,
    /// `None` is a tombstone.
    pub row: Option<BinaryRow>,
}

/// What storage knows about a row at a read timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    pub row_id: RowId,
    /// Newest committed version with `commit_ts <= read_ts`.
    pub committed: Option<CommittedVersion>,
    /// Current write intent, if any.
    pub write_intent: Option<WriteIntent>,
    /// Newest commit timestamp of the row, regardless of the read timestamp.
    pub newest_commit_ts: Option<HybridTimestamp>,
}

impl ReadResult {
    pub fn is_empty(&self) -> bool {
        self.committed.is_none() && self.write_intent.is_none()
    }

    /// Committed row visible at the read timestamp, tombstones excluded.
    pub fn committed_row(&self) -> Option<&BinaryRow> {
        self.committed.as_ref().and_then(|v| v.row.as_ref())
    }
}

/// One entry of a row's version chain, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowVersion {
    Intent(WriteIntent),
    Committed(CommittedVersion),
}

impl RowVersion {
    pub fn row(&self) -> Option<&BinaryRow> {
        match self {
            RowVersion::Intent(intent) => intent.row.as_ref(),
            RowVersion::Committed(version) => version.row.as_ref(),
        }
    }
}
