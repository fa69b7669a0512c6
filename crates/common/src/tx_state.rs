//! Transaction state types
//!
//! - [`TxState`] is the lifecycle state of a transaction.
//! - [`TxMeta`] is what gets persisted in a commit partition, exactly once.
//! - [`TxStateMeta`] is the volatile, node-local view of a transaction.
//! - [`TransactionResult`] is the outcome reported back to callers.

use crate::{NodeId, PartitionId};
use serde::{Deserialize, Serialize};
use shardline_hlc::HybridTimestamp;
use std::fmt;
use std::time::{Duration, Instant};

/// Transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxState {
    Pending,
    Committed,
    Aborted,
    /// The coordinator is gone and the transaction awaits recovery. Never persisted.
    Abandoned,
}

impl TxState {
    /// Whether the state is terminal.
    pub fn is_final(&self) -> bool {
        matches!(self, TxState::Committed | TxState::Aborted)
    }

    /// Whether moving from `before` to `after` is allowed.
    ///
    /// A terminal state can only be "re-entered" with the same state.
    pub fn check_transition(before: Option<TxState>, after: TxState) -> bool {
        match before {
            None => true,
            Some(before) if before.is_final() => before == after,
            Some(_) => true,
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxState::Pending => "PENDING",
            TxState::Committed => "COMMITTED",
            TxState::Aborted => "ABORTED",
            TxState::Abandoned => "ABANDONED",
        };
        f.write_str(name)
    }
}

/// Final outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionResult {
    pub state: TxState,
    pub commit_timestamp: Option<HybridTimestamp>,
}

impl TransactionResult {
    pub fn committed(commit_timestamp: HybridTimestamp) -> Self {
        Self {
            state: TxState::Committed,
            commit_timestamp: Some(commit_timestamp),
        }
    }

    pub fn aborted() -> Self {
        Self {
            state: TxState::Aborted,
            commit_timestamp: None,
        }
    }

    pub fn from_outcome(commit: bool, commit_timestamp: Option<HybridTimestamp>) -> Self {
        if commit {
            Self {
                state: TxState::Committed,
                commit_timestamp,
            }
        } else {
            Self::aborted()
        }
    }
}

impl fmt::Display for TransactionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.commit_timestamp {
            Some(ts) => write!(f, "{} at {}", self.state, ts),
            None => write!(f, "{}", self.state),
        }
    }
}

/// Persisted transaction metadata, stored once in the commit partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxMeta {
    pub state: TxState,
    pub enlisted_partitions: Vec<PartitionId>,
    pub commit_timestamp: Option<HybridTimestamp>,
}

impl TxMeta {
    pub fn new(
        state: TxState,
        enlisted_partitions: Vec<PartitionId>,
        commit_timestamp: Option<HybridTimestamp>,
    ) -> Self {
        Self {
            state,
            enlisted_partitions,
            commit_timestamp,
        }
    }

    pub fn result(&self) -> TransactionResult {
        TransactionResult {
            state: self.state,
            commit_timestamp: self.commit_timestamp,
        }
    }

    /// Same outcome, ignoring the enlisted partitions.
    pub fn same_outcome(&self, other: &TxMeta) -> bool {
        self.state == other.state && self.commit_timestamp == other.commit_timestamp
    }
}

/// Volatile, node-local transaction state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxStateMeta {
    pub state: TxState,
    pub coordinator_id: Option<NodeId>,
    pub commit_partition: Option<PartitionId>,
    pub commit_timestamp: Option<HybridTimestamp>,
    /// When the transaction was last marked abandoned on this node.
    pub abandoned_at: Option<Instant>,
    /// When this node first learned the outcome.
    pub finished_at: Option<Instant>,
}

impl TxStateMeta {
    pub fn pending(coordinator_id: Option<NodeId>, commit_partition: Option<PartitionId>) -> Self {
        Self {
            state: TxState::Pending,
            coordinator_id,
            commit_partition,
            commit_timestamp: None,
            abandoned_at: None,
            finished_at: None,
        }
    }

    /// A finished state, keeping whatever is known about the coordinator.
    pub fn finished(
        previous: Option<&TxStateMeta>,
        result: TransactionResult,
    ) -> Self {
        Self {
            state: result.state,
            coordinator_id: previous.and_then(|p| p.coordinator_id.clone()),
            commit_partition: previous.and_then(|p| p.commit_partition),
            commit_timestamp: result.commit_timestamp,
            abandoned_at: None,
            finished_at: previous
                .and_then(|p| p.finished_at)
                .or_else(|| Some(Instant::now())),
        }
    }

    /// This state marked abandoned now.
    pub fn abandoned(&self) -> Self {
        Self {
            state: TxState::Abandoned,
            abandoned_at: Some(Instant::now()),
            ..self.clone()
        }
    }

    /// Whether the outcome has been known here for at least `ttl`.
    pub fn finished_for(&self, ttl: Duration) -> bool {
        self.state.is_final() && self.finished_at.is_some_and(|at| at.elapsed() >= ttl)
    }

    pub fn result(&self) -> Option<TransactionResult> {
        self.state.is_final().then_some(TransactionResult {
            state: self.state,
            commit_timestamp: self.commit_timestamp,
        })
    }
}
