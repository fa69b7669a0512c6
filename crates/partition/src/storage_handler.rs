//! Row and index mutations of applied commands
//!
//! Every method runs in one consistent storage batch and records the applied log
//! position in that same batch.

use crate::catalog::IndexDescriptor;
use crate::index::{add_to_indexes, try_remove_from_indexes};
use shardline_common::{BinaryRow, PartitionId, RowId, TransactionId};
use shardline_hlc::HybridTimestamp;
use shardline_mvcc::{AppliedPosition, MvPartitionStorage, PartitionWriteBatch, Result};
use std::sync::Arc;

pub struct StorageUpdateHandler {
    partition_id: PartitionId,
    storage: Arc<MvPartitionStorage>,
}

impl StorageUpdateHandler {
    pub fn new(partition_id: PartitionId, storage: Arc<MvPartitionStorage>) -> Self {
        Self {
            partition_id,
            storage,
        }
    }

    pub fn storage(&self) -> &Arc<MvPartitionStorage> {
        &self.storage
    }

    /// Write one row of a transaction.
    ///
    /// With `commit_ts` the write is committed right away, otherwise it stays a write
    /// intent until the transaction finishes.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_update(
        &self,
        tx_id: TransactionId,
        row_id: &RowId,
        commit_partition: PartitionId,
        row: Option<BinaryRow>,
        commit_ts: Option<HybridTimestamp>,
        indexes: &[IndexDescriptor],
        position: AppliedPosition,
    ) -> Result<()> {
        self.storage.run_consistently(|batch| {
            Self::write_row(batch, tx_id, row_id, commit_partition, row, commit_ts, indexes)?;
            batch.set_last_applied(position.index, position.term);
            Ok(())
        })
    }

    /// Write several rows of a transaction in one batch.
    pub fn handle_update_all(
        &self,
        tx_id: TransactionId,
        rows: Vec<(RowId, Option<BinaryRow>)>,
        commit_partition: PartitionId,
        commit_ts: Option<HybridTimestamp>,
        indexes: &[IndexDescriptor],
        position: AppliedPosition,
    ) -> Result<()> {
        self.storage.run_consistently(|batch| {
            for (row_id, row) in rows {
                Self::write_row(batch, tx_id, &row_id, commit_partition, row, commit_ts, indexes)?;
            }
            batch.set_last_applied(position.index, position.term);
            Ok(())
        })
    }

    fn write_row(
        batch: &mut PartitionWriteBatch<'_>,
        tx_id: TransactionId,
        row_id: &RowId,
        commit_partition: PartitionId,
        row: Option<BinaryRow>,
        commit_ts: Option<HybridTimestamp>,
        indexes: &[IndexDescriptor],
    ) -> Result<()> {
        let previous = batch.add_write(row_id, row.clone(), tx_id, commit_partition)?;

        // The transaction overwrote its own intent
        if let Some(previous) = previous {
            let kept: Vec<&BinaryRow> = row.iter().collect();
            try_remove_from_indexes(batch, row_id, previous.row.as_ref(), &kept, indexes)?;
        }

        add_to_indexes(batch, row_id, row.as_ref(), indexes);

        if let Some(commit_ts) = commit_ts {
            batch.commit_write(row_id, commit_ts, tx_id)?;
        }

        Ok(())
    }

    /// Commit or abort every write intent of a transaction. Returns how many rows were
    /// switched.
    ///
    /// Aborted intents take their index entries with them unless a committed version
    /// of the row has the same key.
    pub fn switch_write_intents(
        &self,
        tx_id: TransactionId,
        commit: bool,
        commit_ts: Option<HybridTimestamp>,
        indexes: &[IndexDescriptor],
        position: AppliedPosition,
    ) -> Result<usize> {
        let rows = self.storage.tx_intent_rows(tx_id)?;

        let switched = self.storage.run_consistently(|batch| {
            let mut switched = 0;
            for row_id in &rows {
                match commit_ts.filter(|_| commit) {
                    Some(commit_ts) => {
                        if batch.commit_write(row_id, commit_ts, tx_id)?.is_some() {
                            switched += 1;
                        }
                    }
                    None => {
                        if let Some(intent) = batch.abort_write(row_id, tx_id)? {
                            try_remove_from_indexes(batch, row_id, intent.row.as_ref(), &[], indexes)?;
                            switched += 1;
                        }
                    }
                }
            }
            batch.set_last_applied(position.index, position.term);
            Ok(switched)
        })?;

        tracing::debug!(
            "[{}] Switched {} write intents of transaction {} ({})",
            self.partition_id,
            switched,
            tx_id,
            if commit { "commit" } else { "abort" }
        );
        Ok(switched)
    }

    /// Add rows to an index under construction and record where the build resumes.
    pub fn build_index(
        &self,
        index: &IndexDescriptor,
        rows: Vec<(RowId, Vec<BinaryRow>)>,
        next_row_id: Option<RowId>,
        position: AppliedPosition,
    ) -> Result<()> {
        let indexes = std::slice::from_ref(index);

        self.storage.run_consistently(|batch| {
            for (row_id, versions) in &rows {
                batch.lock(row_id);
                for row in versions {
                    add_to_indexes(batch, row_id, Some(row), indexes);
                }
            }
            batch.set_next_row_id_to_build(index.id, next_row_id);
            batch.set_last_applied(position.index, position.term);
            Ok(())
        })
    }

    /// Record the applied position only. Used for commands that change nothing else.
    pub fn set_last_applied(&self, position: AppliedPosition) -> Result<()> {
        self.storage.run_consistently(|batch| {
            batch.set_last_applied(position.index, position.term);
            Ok(())
        })
    }
}
