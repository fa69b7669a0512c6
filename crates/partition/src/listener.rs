//! Partition replication state machine
//!
//! [`PartitionListener`] applies the ordered command log of one partition to its MVCC
//! storage, its tx-state storage, the safe time tracker and the node's volatile
//! transaction state. Commands arrive strictly in log order, one at a time.
//!
//! Each store records the log position of the last command that touched it, in the
//! same batch as the mutation. A command at or below that position is a replay and is
//! skipped. FinishTx targets the tx-state storage, every other command the MVCC
//! storage.
//!
//! A command either produces a [`CommandResult`] (which may be a rejection, seen only
//! by the proposer) or a [`FatalError`], after which the state machine must not accept
//! further commands.

use crate::catalog::CatalogService;
use crate::command::{
    BuildIndexCommand, Command, FinishTxCommand, UpdateAllCommand, UpdateCommand,
    WriteIntentSwitchCommand,
};
use crate::error::{CommandError, FatalError};
use crate::index::BuildIndexRowVersionChooser;
use crate::storage_handler::StorageUpdateHandler;
use parking_lot::Mutex;
use shardline_common::{NodeId, PartitionId, TransactionId, TransactionResult, TxMeta};
use shardline_hlc::{CLOCK_SKEW, HybridTimestamp, SharedClock};
use shardline_mvcc::{AppliedPosition, MvPartitionStorage, TxStateStorage};
use shardline_tracker::{SafeTimeTracker, StorageIndexTracker};
use shardline_tx::TxManager;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Successful outcome of an applied command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResponse {
    Applied,
    /// The command was at or below the applied position and changed nothing.
    AlreadyApplied,
    /// Outcome stored by a FinishTx.
    TxResult(TransactionResult),
}

/// Result of one command, reported back to its proposer.
pub type CommandResult = Result<CommandResponse, CommandError>;

/// State machine of one partition replica.
pub struct PartitionListener {
    partition_id: PartitionId,
    storage: Arc<MvPartitionStorage>,
    tx_state_storage: Arc<TxStateStorage>,
    update_handler: StorageUpdateHandler,
    tx_manager: Arc<TxManager>,
    catalog: Arc<dyn CatalogService>,
    clock: SharedClock,
    safe_time: Arc<SafeTimeTracker>,
    storage_index: Arc<StorageIndexTracker>,

    /// Highest safe time accepted for proposal on this replica, checked before a
    /// command enters the log.
    max_observable_safe_time: Mutex<HybridTimestamp>,

    /// Highest safe time seen by apply.
    max_applied_safe_time: Mutex<HybridTimestamp>,

    stopped: AtomicBool,
}

impl PartitionListener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        partition_id: PartitionId,
        storage: Arc<MvPartitionStorage>,
        tx_state_storage: Arc<TxStateStorage>,
        tx_manager: Arc<TxManager>,
        catalog: Arc<dyn CatalogService>,
        clock: SharedClock,
        safe_time: Arc<SafeTimeTracker>,
        storage_index: Arc<StorageIndexTracker>,
    ) -> Self {
        let initial_safe_time = safe_time.current();

        Self {
            partition_id,
            update_handler: StorageUpdateHandler::new(partition_id, storage.clone()),
            storage,
            tx_state_storage,
            tx_manager,
            catalog,
            clock,
            safe_time,
            storage_index,
            max_observable_safe_time: Mutex::new(initial_safe_time),
            max_applied_safe_time: Mutex::new(initial_safe_time),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// Apply an encoded log entry.
    ///
    /// An entry that cannot be decoded means producer and consumer disagree on the
    /// log format, which is fatal.
    pub fn apply_raw(&self, bytes: &[u8], index: u64, term: u64) -> Result<CommandResult, FatalError> {
        let command = Command::decode(bytes).map_err(|reason| {
            tracing::error!(
                "[{}] Unknown command at index {}: {}",
                self.partition_id,
                index,
                reason
            );
            FatalError::Decode { index, reason }
        })?;

        self.apply(command, index, term)
    }

    /// Apply one command at log position `(index, term)`.
    pub fn apply(&self, command: Command, index: u64, term: u64) -> Result<CommandResult, FatalError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(FatalError::Stopped);
        }

        let applied = match &command {
            Command::FinishTx(_) => self.tx_state_storage.last_applied(),
            _ => self.storage.last_applied(),
        };
        if index <= applied.index {
            tracing::debug!(
                "[{}] Skipping {} at index {}, already applied up to {}",
                self.partition_id,
                command.name(),
                index,
                applied.index
            );
            return Ok(Ok(CommandResponse::AlreadyApplied));
        }

        let position = AppliedPosition::new(index, term);
        let safe_time = command.safe_time();
        let propagates_safe_time = command.propagates_safe_time();

        let result = {
            let _snapshot = self.storage.acquire_snapshot_read_lock();

            match safe_time.map(|proposed| self.verify_safe_time(proposed)) {
                Some(Err(reorder)) => {
                    tracing::warn!("[{}] Rejecting {} at index {}: {}", self.partition_id, command.name(), index, reorder);
                    self.record_position(&command, position)?;
                    Err(reorder)
                }
                _ => match command {
                    Command::Update(cmd) => self.handle_update(cmd, position)?,
                    Command::UpdateAll(cmd) => self.handle_update_all(cmd, position)?,
                    Command::FinishTx(cmd) => self.handle_finish_tx(cmd, position)?,
                    Command::WriteIntentSwitch(cmd) => self.handle_write_intent_switch(cmd, position)?,
                    Command::SafeTimeSync(_) => {
                        self.update_handler.set_last_applied(position)?;
                        Ok(CommandResponse::Applied)
                    }
                    Command::BuildIndex(cmd) => self.handle_build_index(cmd, position)?,
                },
            }
        };

        let reordered = matches!(result, Err(CommandError::SafeTimeReorder { .. }));
        if let Some(safe_time) = safe_time.filter(|_| propagates_safe_time && !reordered) {
            self.clock.update(safe_time);
            // Closed only on shutdown
            let _ = self.safe_time.update(safe_time);
        }
        let _ = self.storage_index.update(index);

        Ok(result)
    }

    /// Authoritative reorder check, in log order.
    fn verify_safe_time(&self, proposed: HybridTimestamp) -> Result<(), CommandError> {
        let mut max = self.max_applied_safe_time.lock();
        if proposed < *max {
            return Err(CommandError::SafeTimeReorder {
                proposed,
                max_observed: *max,
            });
        }
        *max = proposed;
        Ok(())
    }

    /// Record the applied position of a command that changed nothing else.
    fn record_position(&self, command: &Command, position: AppliedPosition) -> Result<(), FatalError> {
        match command {
            Command::FinishTx(_) => self
                .tx_state_storage
                .set_last_applied(position.index, position.term)?,
            _ => self.update_handler.set_last_applied(position)?,
        }
        Ok(())
    }

    /// Turn a storage outcome into a command result. Ownership conflicts reject the
    /// command, anything else is fatal.
    fn storage_outcome<T>(
        &self,
        outcome: shardline_mvcc::Result<T>,
        command: &'static str,
        position: AppliedPosition,
    ) -> Result<Result<T, CommandError>, FatalError> {
        match outcome {
            Ok(value) => Ok(Ok(value)),
            Err(
                conflict @ (shardline_mvcc::Error::TxIdMismatch { .. }
                | shardline_mvcc::Error::WriteIntentExists { .. }),
            ) => {
                tracing::warn!(
                    "[{}] {} at index {} conflicts: {}",
                    self.partition_id,
                    command,
                    position.index,
                    conflict
                );
                self.update_handler.set_last_applied(position)?;
                Ok(Err(CommandError::WriteConflict(conflict.to_string())))
            }
            Err(e) => {
                tracing::error!(
                    "[{}] Storage failure applying {} at index {}: {}",
                    self.partition_id,
                    command,
                    position.index,
                    e
                );
                Err(FatalError::from(e))
            }
        }
    }

    fn handle_update(&self, cmd: UpdateCommand, position: AppliedPosition) -> Result<CommandResult, FatalError> {
        let indexes = self.indexes_for(cmd.tx_id);
        let commit_ts = cmd.full.then_some(cmd.safe_time);

        let outcome = self.update_handler.handle_update(
            cmd.tx_id,
            &cmd.row_id,
            cmd.commit_partition,
            cmd.row,
            commit_ts,
            &indexes,
            position,
        );
        if let Err(rejected) = self.storage_outcome(outcome, "Update", position)? {
            return Ok(Err(rejected));
        }

        self.replica_touch(cmd.tx_id, cmd.tx_coordinator_id, cmd.commit_partition, commit_ts);
        Ok(Ok(CommandResponse::Applied))
    }

    fn handle_update_all(&self, cmd: UpdateAllCommand, position: AppliedPosition) -> Result<CommandResult, FatalError> {
        let indexes = self.indexes_for(cmd.tx_id);
        let commit_ts = cmd.full.then_some(cmd.safe_time);

        let outcome = self.update_handler.handle_update_all(
            cmd.tx_id,
            cmd.rows,
            cmd.commit_partition,
            commit_ts,
            &indexes,
            position,
        );
        if let Err(rejected) = self.storage_outcome(outcome, "UpdateAll", position)? {
            return Ok(Err(rejected));
        }

        self.replica_touch(cmd.tx_id, cmd.tx_coordinator_id, cmd.commit_partition, commit_ts);
        Ok(Ok(CommandResponse::Applied))
    }

    /// Reflect a write in the volatile state of its transaction.
    fn replica_touch(
        &self,
        tx_id: TransactionId,
        coordinator: Option<NodeId>,
        commit_partition: PartitionId,
        commit_ts: Option<HybridTimestamp>,
    ) {
        match commit_ts {
            Some(commit_ts) => self
                .tx_manager
                .mark_finished(tx_id, TransactionResult::committed(commit_ts)),
            None => self.tx_manager.mark_pending(tx_id, coordinator, commit_partition),
        }
    }

    fn handle_finish_tx(&self, cmd: FinishTxCommand, position: AppliedPosition) -> Result<CommandResult, FatalError> {
        if cmd.commit && cmd.commit_timestamp.is_none() {
            self.tx_state_storage.set_last_applied(position.index, position.term)?;
            return Ok(Err(CommandError::Invalid(format!(
                "commit of transaction {} without a commit timestamp",
                cmd.tx_id
            ))));
        }

        let requested = TransactionResult::from_outcome(cmd.commit, cmd.commit_timestamp);
        let meta = TxMeta::new(requested.state, cmd.partitions, requested.commit_timestamp);

        let won = self.tx_state_storage.compare_and_set(
            cmd.tx_id,
            None,
            meta.clone(),
            position.index,
            position.term,
        )?;

        if won {
            tracing::debug!("[{}] Transaction {} finished as {}", self.partition_id, cmd.tx_id, requested);
            self.tx_manager.mark_finished(cmd.tx_id, requested);
            return Ok(Ok(CommandResponse::TxResult(requested)));
        }

        let stored = self.tx_state_storage.get(cmd.tx_id)?.ok_or_else(|| {
            FatalError::Storage(format!("transaction {} lost its stored state", cmd.tx_id))
        })?;
        let stored_result = stored.result();
        self.tx_manager.mark_finished(cmd.tx_id, stored_result);

        if stored.same_outcome(&meta) {
            tracing::debug!(
                "[{}] Transaction {} is already finished as {}",
                self.partition_id,
                cmd.tx_id,
                stored_result
            );
            return Ok(Ok(CommandResponse::TxResult(stored_result)));
        }

        tracing::error!(
            "[{}] Failed to finish transaction {} as {}: already finished as {}",
            self.partition_id,
            cmd.tx_id,
            requested,
            stored_result
        );
        Ok(Err(CommandError::MismatchingOutcome {
            tx_id: cmd.tx_id,
            stored: stored_result,
            requested,
        }))
    }

    fn handle_write_intent_switch(
        &self,
        cmd: WriteIntentSwitchCommand,
        position: AppliedPosition,
    ) -> Result<CommandResult, FatalError> {
        if cmd.commit && cmd.commit_timestamp.is_none() {
            self.update_handler.set_last_applied(position)?;
            return Ok(Err(CommandError::Invalid(format!(
                "commit switch of transaction {} without a commit timestamp",
                cmd.tx_id
            ))));
        }

        let result = TransactionResult::from_outcome(cmd.commit, cmd.commit_timestamp);
        self.tx_manager.mark_finished(cmd.tx_id, result);

        let indexes = self.indexes_for(cmd.tx_id);
        let outcome = self.update_handler.switch_write_intents(
            cmd.tx_id,
            cmd.commit,
            cmd.commit_timestamp,
            &indexes,
            position,
        );

        Ok(self
            .storage_outcome(outcome, "WriteIntentSwitch", position)?
            .map(|_| CommandResponse::Applied))
    }

    fn handle_build_index(&self, cmd: BuildIndexCommand, position: AppliedPosition) -> Result<CommandResult, FatalError> {
        let creation = self.catalog.catalog(cmd.creation_catalog_version);
        let start_building = self.catalog.catalog(cmd.required_catalog_version);

        let (Some(creation), Some(start_building)) = (creation, start_building) else {
            self.update_handler.set_last_applied(position)?;
            return Ok(Err(CommandError::Invalid(format!(
                "catalog versions {} and {} of index {} are unknown",
                cmd.creation_catalog_version, cmd.required_catalog_version, cmd.index_id
            ))));
        };
        let Some(index) = start_building.index(cmd.index_id).cloned() else {
            // Dropped while the build was in flight
            tracing::info!("[{}] Index {} no longer exists, skipping build batch", self.partition_id, cmd.index_id);
            self.update_handler.set_last_applied(position)?;
            return Ok(Ok(CommandResponse::Applied));
        };

        let chooser = BuildIndexRowVersionChooser::new(creation.activation_ts, start_building.activation_ts);

        let mut row_ids = cmd.row_ids;
        row_ids.sort();

        let mut rows = Vec::with_capacity(row_ids.len());
        for row_id in &row_ids {
            let versions = self.storage.scan_versions(row_id)?;
            rows.push((*row_id, chooser.choose(&versions)));
        }

        let next_row_id = if cmd.finish {
            None
        } else {
            match row_ids.last() {
                Some(last) => match last.increment() {
                    Some(next) => Some(next),
                    None => {
                        // Nothing can follow the greatest row id of the partition
                        tracing::info!(
                            "[{}] Build of index {} reached the last possible row id {}",
                            self.partition_id,
                            cmd.index_id,
                            last
                        );
                        None
                    }
                },
                None => self.storage.next_row_id_to_build(index.id)?,
            }
        };

        self.update_handler.build_index(&index, rows, next_row_id, position)?;

        if cmd.finish {
            tracing::info!(
                "[{}] Finish building the index {} ({})",
                self.partition_id,
                index.name,
                index.id
            );
        }
        Ok(Ok(CommandResponse::Applied))
    }

    /// Indexes a transaction writes to: those existing at its begin timestamp.
    fn indexes_for(&self, tx_id: TransactionId) -> Vec<crate::catalog::IndexDescriptor> {
        self.catalog
            .indexes_at(self.partition_id.table_id, tx_id.begin_timestamp())
    }

    /// Speculative reorder check, run by the leader before a command enters the log.
    pub fn before_apply(&self, command: &Command) -> Result<(), CommandError> {
        let Some(proposed) = command.safe_time() else {
            return Ok(());
        };

        let mut max = self.max_observable_safe_time.lock();
        if proposed < *max {
            return Err(CommandError::SafeTimeReorder {
                proposed,
                max_observed: *max,
            });
        }
        *max = proposed;
        Ok(())
    }

    /// This replica became leader. Commands proposed by a previous leader may carry
    /// safe times up to the clock skew ahead of the local clock.
    pub fn on_leader_start(&self) {
        let max = self.clock.now().add_physical_time(CLOCK_SKEW);
        *self.max_observable_safe_time.lock() = max;
        tracing::info!("[{}] Leader started, max observable safe time {}", self.partition_id, max);
    }

    /// Persist both stores for a log snapshot. Returns the position advertised to the
    /// log for truncation: the greater of the two applied positions.
    pub fn on_snapshot_save(&self) -> Result<AppliedPosition, FatalError> {
        let _snapshot = self.storage.acquire_snapshot_write_lock();

        let advertised = self.advertised_applied();
        self.update_handler.set_last_applied(advertised)?;
        self.tx_state_storage
            .set_last_applied(advertised.index, advertised.term)?;

        self.storage.flush()?;
        self.tx_state_storage.flush()?;

        tracing::info!(
            "[{}] Snapshot saved at index {} term {}",
            self.partition_id,
            advertised.index,
            advertised.term
        );
        Ok(advertised)
    }

    /// Greater of the two applied positions.
    pub fn advertised_applied(&self) -> AppliedPosition {
        self.storage
            .last_applied()
            .max(self.tx_state_storage.last_applied())
    }

    /// Smaller of the two applied positions: where replay must start after a restart.
    pub fn recovery_point(&self) -> AppliedPosition {
        self.storage
            .last_applied()
            .min(self.tx_state_storage.last_applied())
    }

    /// Stop accepting commands and release safe time waiters.
    pub fn on_shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.safe_time.close();
        self.storage_index.close();
        tracing::debug!("[{}] State machine stopped", self.partition_id);
    }
}
