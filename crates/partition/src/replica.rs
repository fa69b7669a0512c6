//! Primary replica of a partition
//!
//! Serves transactional reads and writes, and the transaction protocol requests other
//! nodes address to this partition's primary: finish, write intent switch, tx state
//! queries and recovery.
//!
//! Writes take exclusive row locks. A request blocked by a lock holder whose
//! coordinator left the cluster triggers recovery of that holder; once the commit
//! partition reports the outcome, the holder's intents here are switched and its locks
//! released, which unblocks the waiter.

use crate::catalog::{CatalogService, IndexDescriptor};
use crate::command::{
    Command, FinishTxCommand, SafeTimeSyncCommand, UpdateAllCommand, UpdateCommand,
    WriteIntentSwitchCommand,
};
use crate::config::ReplicaConfig;
use crate::error::{CommandError, ReplicaError, Result};
use crate::listener::{CommandResponse, PartitionListener};
use crate::replication::ReplicationGroup;
use parking_lot::Mutex;
use shardline_common::{
    BinaryRow, NodeId, PartitionId, RowId, TransactionId, TransactionResult, TxState,
};
use shardline_hlc::{HybridTimestamp, SharedClock};
use shardline_mvcc::{MvPartitionStorage, TxStateStorage, WriteIntent};
use shardline_protocol::{
    FinishTxRequest, ReplicaFailure, ReplicaRequest, ReplicaResponse,
    TxStateCommitPartitionRequest,
};
use shardline_tracker::{SafeTimeTracker, StorageIndexTracker};
use shardline_tx::{LockKey, LockManager, LockMode, TxError, TxLiveness, TxManager};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How a write reaches a committed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Single-partition transaction, committed by the write itself
    OnePhase,
    /// Written as intents, committed by finish and write intent switch
    TwoPhase,
}

/// Storage and services a replica is built from.
pub struct ReplicaContext {
    pub partition_id: PartitionId,
    pub local_node: NodeId,
    pub storage: Arc<MvPartitionStorage>,
    pub tx_state_storage: Arc<TxStateStorage>,
    pub tx_manager: Arc<TxManager>,
    pub lock_manager: Arc<LockManager>,
    pub catalog: Arc<dyn CatalogService>,
    pub clock: SharedClock,
    pub config: ReplicaConfig,
}

pub struct PartitionReplica {
    partition_id: PartitionId,
    local_node: NodeId,
    storage: Arc<MvPartitionStorage>,
    tx_state_storage: Arc<TxStateStorage>,
    listener: Arc<PartitionListener>,
    group: Arc<ReplicationGroup>,
    safe_time: Arc<SafeTimeTracker>,
    tx_manager: Arc<TxManager>,
    lock_manager: Arc<LockManager>,
    catalog: Arc<dyn CatalogService>,
    clock: SharedClock,
    config: ReplicaConfig,

    /// Transactions whose intents are being switched after a lock conflict
    cleanups_in_flight: Mutex<HashSet<TransactionId>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    stopping: AtomicBool,
}

impl PartitionReplica {
    /// Start the replica: state machine, replication group and idle safe time
    /// propagation.
    pub fn start(ctx: ReplicaContext) -> Arc<Self> {
        let applied = ctx
            .storage
            .last_applied()
            .min(ctx.tx_state_storage.last_applied());

        let safe_time = Arc::new(SafeTimeTracker::new(HybridTimestamp::MIN));
        let storage_index = Arc::new(StorageIndexTracker::new(applied.index));

        let listener = Arc::new(PartitionListener::new(
            ctx.partition_id,
            ctx.storage.clone(),
            ctx.tx_state_storage.clone(),
            ctx.tx_manager.clone(),
            ctx.catalog.clone(),
            ctx.clock.clone(),
            safe_time.clone(),
            storage_index,
        ));
        let group = ReplicationGroup::start(
            listener.clone(),
            ctx.clock.clone(),
            ctx.config.max_reorder_retries,
            ctx.config.log_retention,
            ctx.storage.last_applied().max(ctx.tx_state_storage.last_applied()),
        );

        let replica = Arc::new(Self {
            partition_id: ctx.partition_id,
            local_node: ctx.local_node,
            storage: ctx.storage,
            tx_state_storage: ctx.tx_state_storage,
            listener,
            group,
            safe_time,
            tx_manager: ctx.tx_manager,
            lock_manager: ctx.lock_manager,
            catalog: ctx.catalog,
            clock: ctx.clock,
            config: ctx.config,
            cleanups_in_flight: Mutex::new(HashSet::new()),
            background: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
        });

        replica.start_idle_safe_time_propagation();

        tracing::info!(
            "[{}] Replica started on {} from applied index {}",
            replica.partition_id,
            replica.local_node,
            applied.index
        );
        replica
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn storage(&self) -> &Arc<MvPartitionStorage> {
        &self.storage
    }

    pub fn tx_state_storage(&self) -> &Arc<TxStateStorage> {
        &self.tx_state_storage
    }

    pub fn listener(&self) -> &Arc<PartitionListener> {
        &self.listener
    }

    pub fn group(&self) -> &Arc<ReplicationGroup> {
        &self.group
    }

    pub fn safe_time(&self) -> HybridTimestamp {
        self.safe_time.current()
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogService> {
        &self.catalog
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn check_running(&self) -> Result<()> {
        if self.is_stopping() {
            return Err(ReplicaError::Stopping(self.partition_id));
        }
        Ok(())
    }

    /// Propose a command through the replication group.
    pub async fn propose(&self, command: Command) -> Result<CommandResponse> {
        self.check_running()?;
        Ok(self.group.propose(command).await??)
    }

    /// Write one row.
    pub async fn upsert(
        self: &Arc<Self>,
        tx_id: TransactionId,
        commit_partition: PartitionId,
        coordinator: Option<NodeId>,
        row_id: RowId,
        row: Option<BinaryRow>,
        mode: ExecutionMode,
    ) -> Result<()> {
        self.upsert_all(tx_id, commit_partition, coordinator, vec![(row_id, row)], mode)
            .await
    }

    /// Write several rows of one transaction in a single command.
    ///
    /// One-phase writes commit at the command's safe time and release their locks
    /// right away. Two-phase writes keep their locks until the transaction's intents
    /// are switched. `coordinator` is the node driving the transaction; lock waiters
    /// recover the transaction once it leaves.
    pub async fn upsert_all(
        self: &Arc<Self>,
        tx_id: TransactionId,
        commit_partition: PartitionId,
        tx_coordinator_id: Option<NodeId>,
        rows: Vec<(RowId, Option<BinaryRow>)>,
        mode: ExecutionMode,
    ) -> Result<()> {
        self.check_running()?;
        if mode == ExecutionMode::TwoPhase {
            self.tx_manager
                .mark_pending(tx_id, tx_coordinator_id.clone(), commit_partition);
        }

        let mut keys: Vec<_> = rows
            .iter()
            .map(|(row_id, _)| LockKey::row(self.partition_id, *row_id))
            .collect();
        keys.sort();
        keys.dedup();

        for key in keys {
            if let Err(e) = self.acquire_lock(tx_id, key, LockMode::Exclusive).await {
                if mode == ExecutionMode::OnePhase {
                    self.lock_manager.release_all(tx_id, self.partition_id);
                }
                return Err(e);
            }
        }

        let full = mode == ExecutionMode::OnePhase;
        let safe_time = self.clock.now();

        let command = match <[_; 1]>::try_from(rows) {
            Ok([(row_id, row)]) => Command::Update(UpdateCommand {
                tx_id,
                commit_partition,
                row_id,
                row,
                full,
                tx_coordinator_id,
                safe_time,
            }),
            Err(rows) => Command::UpdateAll(UpdateAllCommand {
                tx_id,
                commit_partition,
                rows,
                full,
                tx_coordinator_id,
                safe_time,
            }),
        };

        let outcome = self.propose(command).await;
        if full {
            self.lock_manager.release_all(tx_id, self.partition_id);
        }
        outcome.map(|_| ())
    }

    /// Read a row in a read-write transaction, under a shared lock.
    ///
    /// The transaction is recorded as pending here, like a write, so that this node
    /// can answer for it as its commit partition.
    pub async fn read_rw(
        self: &Arc<Self>,
        tx_id: TransactionId,
        commit_partition: PartitionId,
        coordinator: Option<NodeId>,
        row_id: RowId,
    ) -> Result<Option<BinaryRow>> {
        self.check_running()?;
        self.tx_manager.mark_pending(tx_id, coordinator, commit_partition);
        self.acquire_lock(tx_id, LockKey::row(self.partition_id, row_id), LockMode::Shared)
            .await?;

        let read = self.storage.read(&row_id, HybridTimestamp::MAX)?;
        match read.write_intent {
            Some(intent) if intent.tx_id == tx_id => Ok(intent.row),
            Some(intent) => {
                // Left behind by a transaction that no longer holds its lock
                let result = self.resolve_write_intent(&intent, self.clock.now()).await?;
                match result.state {
                    TxState::Committed => Ok(intent.row),
                    _ => Ok(read.committed.and_then(|version| version.row)),
                }
            }
            None => Ok(read.committed.and_then(|version| version.row)),
        }
    }

    /// Read a row as of `read_ts`, once safe time has reached it.
    pub async fn read_ro(&self, row_id: RowId, read_ts: HybridTimestamp) -> Result<Option<BinaryRow>> {
        self.check_running()?;
        self.wait_for_safe_time(read_ts).await?;

        let read = self.storage.read(&row_id, read_ts)?;
        let Some(intent) = read.write_intent else {
            return Ok(read.committed.and_then(|version| version.row));
        };

        let result = self.resolve_write_intent(&intent, read_ts).await?;
        let visible = result.state == TxState::Committed
            && result.commit_timestamp.is_some_and(|commit_ts| commit_ts <= read_ts);

        if visible {
            Ok(intent.row)
        } else {
            Ok(read.committed.and_then(|version| version.row))
        }
    }

    /// Rows whose key in `index_id` is `key`, as of `read_ts`.
    pub async fn lookup_ro(
        &self,
        index_id: u32,
        key: &[u8],
        read_ts: HybridTimestamp,
    ) -> Result<Vec<(RowId, BinaryRow)>> {
        self.check_running()?;
        self.wait_for_safe_time(read_ts).await?;

        let index: IndexDescriptor = self
            .catalog
            .active_catalog(read_ts)
            .index(index_id)
            .cloned()
            .ok_or(ReplicaError::UnknownIndex(index_id))?;

        let mut rows = Vec::new();
        for row_id in self.storage.index_lookup(index_id, key)? {
            // Entries outlive the versions that produced them
            if let Some(row) = self.read_ro(row_id, read_ts).await? {
                if index.index_key(&row).as_deref() == Some(key) {
                    rows.push((row_id, row));
                }
            }
        }
        Ok(rows)
    }

    async fn wait_for_safe_time(&self, ts: HybridTimestamp) -> Result<()> {
        match tokio::time::timeout(self.config.wait_timeout, self.safe_time.wait_for(ts)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_closed)) => Err(ReplicaError::Stopping(self.partition_id)),
            Err(_) => Err(ReplicaError::SafeTimeTimeout(ts)),
        }
    }

    /// Outcome of the transaction owning a write intent, waiting while it is pending.
    async fn resolve_write_intent(
        &self,
        intent: &WriteIntent,
        read_ts: HybridTimestamp,
    ) -> Result<TransactionResult> {
        let tx_id = intent.tx_id;
        let deadline = Instant::now() + self.tx_manager.config().lock_wait_timeout;
        let recheck = self.tx_manager.config().abandoned_check_interval;

        loop {
            if let Some(result) = self.tx_manager.state_meta(tx_id).and_then(|meta| meta.result()) {
                return Ok(result);
            }

            let result = self
                .query_tx_state(tx_id, intent.commit_partition, read_ts)
                .await?;
            if result.state.is_final() {
                self.tx_manager.mark_finished(tx_id, result);
                return Ok(result);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TxError::AcquireLock(tx_id).into());
            }
            let wait = (deadline - now).min(recheck);
            self.tx_manager
                .wait_until(tx_id, wait, |meta| meta.state.is_final())
                .await;
        }
    }

    async fn query_tx_state(
        &self,
        tx_id: TransactionId,
        commit_partition: PartitionId,
        read_timestamp: HybridTimestamp,
    ) -> Result<TransactionResult> {
        let request = ReplicaRequest::TxStateCommitPartition(TxStateCommitPartitionRequest {
            tx_id,
            commit_partition,
            read_timestamp,
        });

        match self.tx_manager.send_to_primary(commit_partition, request).await? {
            ReplicaResponse::TxResult(result) => Ok(result),
            _ => Err(TxError::UnexpectedResponse("tx_state").into()),
        }
    }

    async fn acquire_lock(self: &Arc<Self>, tx_id: TransactionId, key: LockKey, mode: LockMode) -> Result<()> {
        let replica = Arc::clone(self);
        self.lock_manager
            .acquire(tx_id, key, mode, |holders| replica.on_lock_conflict(holders))
            .await?;
        Ok(())
    }

    /// A lock request is blocked by `holders`: recover the abandoned ones, clean up
    /// after the finished ones.
    fn on_lock_conflict(self: &Arc<Self>, holders: &[TransactionId]) {
        for holder in holders {
            match self.tx_manager.check_liveness(*holder) {
                TxLiveness::Abandoned { recover: true } => {
                    let commit_partition = self
                        .tx_manager
                        .state_meta(*holder)
                        .and_then(|meta| meta.commit_partition);
                    match commit_partition {
                        Some(commit_partition) => self.spawn_recovery(*holder, commit_partition),
                        None => tracing::warn!(
                            "[{}] Cannot recover transaction {}, commit partition unknown",
                            self.partition_id,
                            holder
                        ),
                    }
                }
                TxLiveness::Finished(result) => self.spawn_cleanup(*holder, result),
                TxLiveness::Abandoned { recover: false } | TxLiveness::Alive | TxLiveness::Unknown => {}
            }
        }
    }

    fn spawn_recovery(self: &Arc<Self>, tx_id: TransactionId, commit_partition: PartitionId) {
        let replica = Arc::clone(self);
        self.spawn(async move {
            match replica.tx_manager.recover(tx_id, commit_partition).await {
                Ok(result) => {
                    if let Err(e) = replica.switch_locally(tx_id, result).await {
                        tracing::warn!(
                            "[{}] Failed to clean up recovered transaction {}: {}",
                            replica.partition_id,
                            tx_id,
                            e
                        );
                    }
                }
                Err(e) => tracing::warn!(
                    "[{}] Recovery of transaction {} failed: {}",
                    replica.partition_id,
                    tx_id,
                    e
                ),
            }
        });
    }

    fn spawn_cleanup(self: &Arc<Self>, tx_id: TransactionId, result: TransactionResult) {
        if !self.cleanups_in_flight.lock().insert(tx_id) {
            return;
        }

        let replica = Arc::clone(self);
        self.spawn(async move {
            if let Err(e) = replica.switch_locally(tx_id, result).await {
                tracing::warn!(
                    "[{}] Failed to clean up finished transaction {}: {}",
                    replica.partition_id,
                    tx_id,
                    e
                );
            }
            replica.cleanups_in_flight.lock().remove(&tx_id);
        });
    }

    fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
        let mut background = self.background.lock();
        background.retain(|handle| !handle.is_finished());
        background.push(tokio::spawn(task));
    }

    /// Switch the write intents of a finished transaction in this partition and
    /// release its locks here.
    pub async fn switch_locally(&self, tx_id: TransactionId, result: TransactionResult) -> Result<()> {
        let command = Command::WriteIntentSwitch(WriteIntentSwitchCommand {
            tx_id,
            commit: result.state == TxState::Committed,
            commit_timestamp: result.commit_timestamp,
            safe_time: self.clock.now(),
        });

        self.propose(command).await?;
        let released = self.lock_manager.release_all(tx_id, self.partition_id);

        tracing::debug!(
            "[{}] Transaction {} switched as {}, {} locks released",
            self.partition_id,
            tx_id,
            result,
            released
        );
        Ok(())
    }

    /// Handle a transaction protocol request addressed to this primary.
    pub async fn handle_request(
        self: &Arc<Self>,
        request: ReplicaRequest,
    ) -> std::result::Result<ReplicaResponse, ReplicaFailure> {
        if self.is_stopping() {
            return Err(ReplicaFailure::NodeStopping);
        }
        if request.partition() != self.partition_id {
            return Err(ReplicaFailure::PrimaryReplicaMiss {
                partition: request.partition(),
                node: self.local_node.clone(),
            });
        }

        let response = match request {
            ReplicaRequest::FinishTx(req) => self.finish_tx(req).await.map(ReplicaResponse::TxResult),
            ReplicaRequest::WriteIntentSwitch(req) => {
                let result = TransactionResult::from_outcome(req.commit, req.commit_timestamp);
                self.switch_locally(req.tx_id, result)
                    .await
                    .map(|_| ReplicaResponse::Switched)
            }
            ReplicaRequest::TxStateCommitPartition(req) => self.tx_state(req).await.map(ReplicaResponse::TxResult),
            ReplicaRequest::TxRecovery(req) => self.recover_locally(req.tx_id).await.map(ReplicaResponse::TxResult),
        };

        response.map_err(ReplicaFailure::from)
    }

    async fn finish_tx(&self, req: FinishTxRequest) -> Result<TransactionResult> {
        let command = Command::FinishTx(FinishTxCommand {
            tx_id: req.tx_id,
            commit: req.commit,
            commit_timestamp: req.commit_timestamp,
            partitions: req.enlisted_partitions,
            safe_time: self.clock.now(),
        });

        match self.propose(command).await? {
            CommandResponse::TxResult(result) => Ok(result),
            _ => self.stored_result(req.tx_id),
        }
    }

    fn stored_result(&self, tx_id: TransactionId) -> Result<TransactionResult> {
        self.tx_state_storage
            .get(tx_id)?
            .map(|meta| meta.result())
            .ok_or_else(|| {
                ReplicaError::Command(CommandError::Invalid(format!(
                    "transaction {} has no stored outcome",
                    tx_id
                )))
            })
    }

    /// Answer a tx state query as the commit partition.
    async fn tx_state(&self, req: TxStateCommitPartitionRequest) -> Result<TransactionResult> {
        // Whatever commits from now on does so above the reader's timestamp
        self.clock.update(req.read_timestamp);

        if let Some(meta) = self.tx_state_storage.get(req.tx_id)? {
            return Ok(meta.result());
        }

        let pending = TransactionResult {
            state: TxState::Pending,
            commit_timestamp: None,
        };
        match self.tx_manager.check_liveness(req.tx_id) {
            TxLiveness::Finished(result) => Ok(result),
            TxLiveness::Alive => Ok(pending),
            TxLiveness::Abandoned { .. } => self.recover_locally(req.tx_id).await,
            TxLiveness::Unknown => {
                // Every request of a transaction records it on its commit partition, so
                // it may only have been vacuumed or not have reached this node yet
                tracing::debug!(
                    "[{}] Transaction {} is unknown here, reporting it pending",
                    self.partition_id,
                    req.tx_id
                );
                Ok(pending)
            }
        }
    }

    /// Resolve a transaction as its commit partition: the stored outcome if there is
    /// one, otherwise abort it.
    async fn recover_locally(&self, tx_id: TransactionId) -> Result<TransactionResult> {
        if let Some(meta) = self.tx_state_storage.get(tx_id)? {
            return Ok(meta.result());
        }

        let command = Command::FinishTx(FinishTxCommand {
            tx_id,
            commit: false,
            commit_timestamp: None,
            partitions: vec![self.partition_id],
            safe_time: self.clock.now(),
        });

        let result = match self.propose(command).await {
            Ok(CommandResponse::TxResult(result)) => result,
            Ok(_) => self.stored_result(tx_id)?,
            // A finish won the race
            Err(ReplicaError::Command(CommandError::MismatchingOutcome { stored, .. })) => stored,
            Err(e) => return Err(e),
        };

        tracing::info!(
            "[{}] Transaction {} recovered as {}",
            self.partition_id,
            tx_id,
            result
        );

        if !self.storage.tx_intent_rows(tx_id)?.is_empty() {
            self.switch_locally(tx_id, result).await?;
        }
        Ok(result)
    }

    /// Propose a safe time sync. Returns the safe time after it applied.
    pub async fn propagate_safe_time(&self) -> Result<HybridTimestamp> {
        let command = Command::SafeTimeSync(SafeTimeSyncCommand {
            safe_time: self.clock.now(),
        });
        self.propose(command).await?;
        Ok(self.safe_time.current())
    }

    fn start_idle_safe_time_propagation(self: &Arc<Self>) {
        let replica = Arc::downgrade(self);
        let period = self.config.idle_safe_time_propagation_period;

        self.spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(replica) = replica.upgrade() else {
                    break;
                };
                if replica.is_stopping() {
                    break;
                }
                if let Err(e) = replica.propagate_safe_time().await {
                    tracing::debug!("[{}] Idle safe time propagation failed: {}", replica.partition_id, e);
                }
            }
        });
    }

    /// Stop serving: fail new requests, cancel background work, stop the state machine.
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }

        let background: Vec<_> = std::mem::take(&mut *self.background.lock());
        for handle in background {
            handle.abort();
            let _ = handle.await;
        }

        self.group.stop().await;
        tracing::info!("[{}] Replica stopped on {}", self.partition_id, self.local_node);
    }
}
