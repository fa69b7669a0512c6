//! Recovery of abandoned transactions
//!
//! A transaction is abandoned when its coordinator is no longer part of the cluster.
//! Whoever runs into one of its write intents or locks asks the commit partition to
//! resolve it. The commit partition answers with the persisted outcome, or aborts the
//! transaction if no outcome was persisted yet.
//!
//! Recovery requests are deduplicated per transaction: concurrent triggers share one
//! in-flight future, and a new request is sent at most once per abandoned check
//! interval.

use crate::error::{Result, TxError};
use crate::manager::TxManager;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use shardline_common::{PartitionId, TransactionId, TransactionResult, TxState};
use shardline_protocol::{ReplicaRequest, ReplicaResponse, TxRecoveryMessage};
use std::sync::Arc;

pub(crate) type SharedRecovery = Shared<BoxFuture<'static, Result<TransactionResult>>>;

/// What this node can tell about a transaction that blocks someone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxLiveness {
    /// Finished with the given outcome
    Finished(TransactionResult),
    /// Coordinator is alive, waiting is the right thing to do
    Alive,
    /// Coordinator is gone. `recover` tells whether a recovery should be sent now.
    Abandoned { recover: bool },
    /// Nothing is known locally
    Unknown,
}

impl TxManager {
    /// Check whether a transaction is abandoned, marking it so if its coordinator left.
    pub fn check_liveness(&self, tx_id: TransactionId) -> TxLiveness {
        let Some(meta) = self.state_meta(tx_id) else {
            return TxLiveness::Unknown;
        };

        if let Some(result) = meta.result() {
            return TxLiveness::Finished(result);
        }

        match meta.state {
            TxState::Abandoned => {
                let due = meta
                    .abandoned_at
                    .is_none_or(|at| at.elapsed() >= self.config.abandoned_check_interval);
                if due {
                    // Restart the interval for the next check
                    self.mark_abandoned(tx_id);
                }
                TxLiveness::Abandoned { recover: due }
            }
            _ => match &meta.coordinator_id {
                Some(coordinator) if !self.topology.is_alive(coordinator) => {
                    tracing::info!(
                        "[{}] Transaction {} is abandoned, coordinator {} left",
                        self.local_node,
                        tx_id,
                        coordinator
                    );
                    self.mark_abandoned(tx_id);
                    TxLiveness::Abandoned { recover: true }
                }
                _ => TxLiveness::Alive,
            },
        }
    }

    /// Resolve an abandoned transaction through its commit partition.
    ///
    /// Concurrent calls for the same transaction share one recovery request.
    pub async fn recover(
        self: &Arc<Self>,
        tx_id: TransactionId,
        commit_partition: PartitionId,
    ) -> Result<TransactionResult> {
        if let Some(result) = self.state_meta(tx_id).and_then(|meta| meta.result()) {
            return Ok(result);
        }

        let recovery = self
            .recoveries
            .entry(tx_id)
            .or_insert_with(|| {
                let manager = Arc::clone(self);
                async move {
                    let result = manager.run_recovery(tx_id, commit_partition).await;
                    manager.recoveries.remove(&tx_id);
                    result
                }
                .boxed()
                .shared()
            })
            .clone();

        recovery.await
    }

    async fn run_recovery(
        &self,
        tx_id: TransactionId,
        commit_partition: PartitionId,
    ) -> Result<TransactionResult> {
        tracing::info!(
            "[{}] Recovering transaction {} through commit partition {}",
            self.local_node,
            tx_id,
            commit_partition
        );

        let request = ReplicaRequest::TxRecovery(TxRecoveryMessage {
            tx_id,
            commit_partition,
        });

        match self.send_to_primary(commit_partition, request).await? {
            ReplicaResponse::TxResult(result) if result.state.is_final() => {
                tracing::info!(
                    "[{}] Transaction {} recovered as {}",
                    self.local_node,
                    tx_id,
                    result
                );
                self.mark_finished(tx_id, result);
                Ok(result)
            }
            _ => Err(TxError::UnexpectedResponse("tx_recovery")),
        }
    }

    /// Number of recoveries currently in flight.
    pub fn recoveries_in_flight(&self) -> usize {
        self.recoveries.len()
    }
}
