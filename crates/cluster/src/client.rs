//! Client side of a read-write transaction
//!
//! The first partition a transaction touches becomes its commit partition. Every
//! partition written or read is enlisted, so commit or rollback switches the intents
//! and releases the locks there.

use crate::error::{ClusterError, Result};
use crate::network::LocalNetwork;
use crate::node::Node;
use shardline_common::{BinaryRow, PartitionId, RowId, TransactionId, TransactionResult};
use shardline_partition::{ExecutionMode, PartitionReplica};
use std::sync::Arc;

pub struct Transaction {
    id: TransactionId,
    coordinator: Arc<Node>,
    network: Arc<LocalNetwork>,
    enlisted: Vec<PartitionId>,
}

impl Transaction {
    pub(crate) fn begin(coordinator: Arc<Node>, network: Arc<LocalNetwork>) -> Self {
        let id = coordinator.tx_manager().begin();
        tracing::debug!("Transaction {} started on {}", id, coordinator.id());
        Self {
            id,
            coordinator,
            network,
            enlisted: Vec::new(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn commit_partition(&self) -> Option<PartitionId> {
        self.enlisted.first().copied()
    }

    pub fn enlisted(&self) -> &[PartitionId] {
        &self.enlisted
    }

    fn enlist(&mut self, partition: PartitionId) -> Result<(PartitionId, Arc<PartitionReplica>)> {
        let replica = self
            .network
            .primary(partition)
            .ok_or(ClusterError::NoPrimary(partition))?;
        if !self.enlisted.contains(&partition) {
            self.enlisted.push(partition);
        }
        Ok((self.enlisted[0], replica))
    }

    /// Write a row, or delete it with `None`.
    pub async fn upsert(&mut self, partition: PartitionId, row_id: RowId, row: Option<BinaryRow>) -> Result<()> {
        self.upsert_all(partition, vec![(row_id, row)]).await
    }

    pub async fn upsert_all(
        &mut self,
        partition: PartitionId,
        rows: Vec<(RowId, Option<BinaryRow>)>,
    ) -> Result<()> {
        let (commit_partition, replica) = self.enlist(partition)?;
        replica
            .upsert_all(
                self.id,
                commit_partition,
                Some(self.coordinator.id().clone()),
                rows,
                ExecutionMode::TwoPhase,
            )
            .await?;
        Ok(())
    }

    /// Read a row under a shared lock, seeing this transaction's own writes.
    pub async fn get(&mut self, partition: PartitionId, row_id: RowId) -> Result<Option<BinaryRow>> {
        let (commit_partition, replica) = self.enlist(partition)?;
        Ok(replica
            .read_rw(self.id, commit_partition, Some(self.coordinator.id().clone()), row_id)
            .await?)
    }

    pub async fn commit(self) -> Result<TransactionResult> {
        self.finish(true).await
    }

    pub async fn rollback(self) -> Result<TransactionResult> {
        self.finish(false).await
    }

    async fn finish(self, commit: bool) -> Result<TransactionResult> {
        let tx_manager = self.coordinator.tx_manager();

        let Some(commit_partition) = self.commit_partition() else {
            // Nothing was written or locked anywhere
            let result = if commit {
                TransactionResult::committed(tx_manager.clock().now())
            } else {
                TransactionResult::aborted()
            };
            tx_manager.mark_finished(self.id, result);
            return Ok(result);
        };

        Ok(tx_manager
            .finish(commit_partition, commit, self.enlisted, self.id)
            .await?)
    }
}
