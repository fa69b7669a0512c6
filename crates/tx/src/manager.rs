//! Transaction manager
//!
//! Keeps the volatile state of every transaction this node has seen, coordinates
//! finishing transactions across their commit partition and enlisted partitions, and
//! routes requests to partition primaries with retries for transient failures.

use crate::collaborators::{PlacementDriver, TopologyService, TxMessageSender};
use crate::config::TxConfig;
use crate::error::{Result, TxError};
use crate::recovery::SharedRecovery;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use shardline_common::{NodeId, PartitionId, TransactionId, TransactionResult, TxState, TxStateMeta};
use shardline_hlc::SharedClock;
use shardline_protocol::{
    FinishTxRequest, ReplicaFailure, ReplicaRequest, ReplicaResponse, WriteIntentSwitchRequest,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Transaction manager of a node.
pub struct TxManager {
    pub(crate) local_node: NodeId,
    pub(crate) clock: SharedClock,
    pub(crate) config: TxConfig,

    /// Volatile state of known transactions
    states: DashMap<TransactionId, TxStateMeta>,

    /// Woken on every state change
    state_changed: Notify,

    /// In-flight recoveries, at most one per transaction
    pub(crate) recoveries: DashMap<TransactionId, SharedRecovery>,

    sender: Arc<dyn TxMessageSender>,
    placement: Arc<dyn PlacementDriver>,
    pub(crate) topology: Arc<dyn TopologyService>,

    stopping: AtomicBool,
}

impl TxManager {
    pub fn new(
        local_node: NodeId,
        clock: SharedClock,
        config: TxConfig,
        sender: Arc<dyn TxMessageSender>,
        placement: Arc<dyn PlacementDriver>,
        topology: Arc<dyn TopologyService>,
    ) -> Self {
        Self {
            local_node,
            clock,
            config,
            states: DashMap::new(),
            state_changed: Notify::new(),
            recoveries: DashMap::new(),
            sender,
            placement,
            topology,
            stopping: AtomicBool::new(false),
        }
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn config(&self) -> &TxConfig {
        &self.config
    }

    /// Start a transaction coordinated by this node.
    pub fn begin(&self) -> TransactionId {
        let tx_id = TransactionId::new(self.clock.now());
        self.update_tx_meta(tx_id, |_| {
            Some(TxStateMeta::pending(Some(self.local_node.clone()), None))
        });
        tx_id
    }

    /// Apply `mutator` to the volatile state of a transaction.
    ///
    /// Never fails: a mutation that would move a finished transaction to another state
    /// is ignored. Returns the state after the call.
    pub fn update_tx_meta(
        &self,
        tx_id: TransactionId,
        mutator: impl FnOnce(Option<&TxStateMeta>) -> Option<TxStateMeta>,
    ) -> Option<TxStateMeta> {
        let updated = match self.states.entry(tx_id) {
            Entry::Occupied(mut entry) => match mutator(Some(entry.get())) {
                Some(new) if TxState::check_transition(Some(entry.get().state), new.state) => {
                    entry.insert(new.clone());
                    Some(new)
                }
                _ => Some(entry.get().clone()),
            },
            Entry::Vacant(entry) => mutator(None).map(|new| {
                entry.insert(new.clone());
                new
            }),
        };

        self.state_changed.notify_waiters();
        updated
    }

    /// Record that a transaction wrote to a partition hosted here.
    pub fn mark_pending(
        &self,
        tx_id: TransactionId,
        coordinator: Option<NodeId>,
        commit_partition: PartitionId,
    ) {
        self.update_tx_meta(tx_id, |old| match old {
            Some(old) if old.state != TxState::Pending => None,
            Some(old) => Some(TxStateMeta {
                coordinator_id: old.coordinator_id.clone().or(coordinator),
                commit_partition: Some(commit_partition),
                ..old.clone()
            }),
            None => Some(TxStateMeta::pending(coordinator, Some(commit_partition))),
        });
    }

    /// Record the final outcome of a transaction.
    pub fn mark_finished(&self, tx_id: TransactionId, result: TransactionResult) {
        self.update_tx_meta(tx_id, |old| Some(TxStateMeta::finished(old, result)));
    }

    /// Mark a pending transaction abandoned.
    pub fn mark_abandoned(&self, tx_id: TransactionId) -> Option<TxStateMeta> {
        self.update_tx_meta(tx_id, |old| match old {
            Some(old) if !old.state.is_final() => Some(old.abandoned()),
            _ => None,
        })
    }

    pub fn state_meta(&self, tx_id: TransactionId) -> Option<TxStateMeta> {
        self.states.get(&tx_id).map(|meta| meta.clone())
    }

    /// Wait until the state of `tx_id` satisfies `predicate`, or `timeout` elapses.
    pub async fn wait_until(
        &self,
        tx_id: TransactionId,
        timeout: Duration,
        predicate: impl Fn(&TxStateMeta) -> bool,
    ) -> Option<TxStateMeta> {
        let deadline = Instant::now() + timeout;

        loop {
            let changed = self.state_changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if let Some(meta) = self.state_meta(tx_id) {
                if predicate(&meta) {
                    return Some(meta);
                }
            }

            if self.is_stopping() || tokio::time::timeout_at(deadline, changed).await.is_err() {
                return None;
            }
        }
    }

    /// Wait for the outcome of a transaction.
    pub async fn wait_for_final(
        &self,
        tx_id: TransactionId,
        timeout: Duration,
    ) -> Result<TransactionResult> {
        self.wait_until(tx_id, timeout, |meta| meta.state.is_final())
            .await
            .and_then(|meta| meta.result())
            .ok_or(TxError::WaitTimeout(tx_id))
    }

    /// Finish a transaction: persist the outcome in the commit partition, then switch
    /// the write intents of every enlisted partition.
    ///
    /// If the transaction was already finished with the same outcome the stored
    /// result is returned; an opposite stored outcome fails with
    /// [`TxError::MismatchingOutcome`] after cleaning up with the stored outcome.
    pub async fn finish(
        &self,
        commit_partition: PartitionId,
        commit: bool,
        enlisted_partitions: Vec<PartitionId>,
        tx_id: TransactionId,
    ) -> Result<TransactionResult> {
        let commit_timestamp = commit.then(|| self.clock.now());
        let requested = TransactionResult::from_outcome(commit, commit_timestamp);

        tracing::debug!(
            "Finishing transaction {} as {} in commit partition {}",
            tx_id,
            requested,
            commit_partition
        );

        let request = ReplicaRequest::FinishTx(FinishTxRequest {
            tx_id,
            commit_partition,
            commit,
            commit_timestamp,
            enlisted_partitions: enlisted_partitions.clone(),
        });

        let outcome = match self.send_to_primary(commit_partition, request).await {
            Ok(ReplicaResponse::TxResult(result)) => Ok(result),
            Ok(_) => return Err(TxError::UnexpectedResponse("finish_tx")),
            Err(TxError::Replica(ReplicaFailure::MismatchingOutcome { stored, .. })) => {
                if stored.state == requested.state {
                    Ok(stored)
                } else {
                    tracing::warn!(
                        "Transaction {} was already finished as {}, requested {}",
                        tx_id,
                        stored,
                        requested
                    );
                    Err(stored)
                }
            }
            Err(e) => return Err(e),
        };

        let stored = match outcome {
            Ok(result) | Err(result) => result,
        };
        self.mark_finished(tx_id, stored);
        self.cleanup(tx_id, &enlisted_partitions, stored).await;

        match outcome {
            Ok(result) => Ok(result),
            Err(stored) => Err(TxError::MismatchingOutcome {
                tx_id,
                stored,
                requested,
            }),
        }
    }

    /// Switch the write intents of a finished transaction in every given partition.
    pub async fn cleanup(
        &self,
        tx_id: TransactionId,
        partitions: &[PartitionId],
        result: TransactionResult,
    ) {
        let switches = partitions.iter().map(|partition| {
            let request = ReplicaRequest::WriteIntentSwitch(WriteIntentSwitchRequest {
                tx_id,
                partition: *partition,
                commit: result.state == TxState::Committed,
                commit_timestamp: result.commit_timestamp,
            });
            async move { (*partition, self.send_to_primary(*partition, request).await) }
        });

        for (partition, outcome) in futures::future::join_all(switches).await {
            if let Err(e) = outcome {
                // Intents left behind are resolved lazily by readers
                tracing::warn!(
                    "Failed to switch write intents of transaction {} in {}: {}",
                    tx_id,
                    partition,
                    e
                );
            }
        }
    }

    /// Send a request to the current primary of `partition`, retrying transient failures.
    pub async fn send_to_primary(
        &self,
        partition: PartitionId,
        request: ReplicaRequest,
    ) -> Result<ReplicaResponse> {
        let mut attempt = 0;

        loop {
            if self.is_stopping() {
                return Err(TxError::NodeStopping);
            }
            attempt += 1;

            let error = match self.placement.primary_replica(partition) {
                None => TxError::NoPrimaryReplica(partition),
                Some(primary) => {
                    let send = self.sender.send(&primary, request.clone());
                    match tokio::time::timeout(self.config.rpc_timeout, send).await {
                        Ok(Ok(response)) => return Ok(response),
                        Ok(Err(failure)) => TxError::from(failure),
                        Err(_) => TxError::Replica(ReplicaFailure::Timeout),
                    }
                }
            };

            if !error.is_transient() || attempt >= self.config.retry_attempts {
                return Err(error);
            }

            tracing::debug!(
                "Retrying {} for transaction {} in {} after: {}",
                request.kind(),
                request.tx_id(),
                partition,
                error
            );
            tokio::time::sleep(self.config.retry_backoff).await;
        }
    }

    /// Evict finished transactions whose outcome has been known for longer than the
    /// finished state TTL, except those `retain` still needs. Returns how many were
    /// evicted.
    ///
    /// An evicted transaction is answered from the persisted state of its commit
    /// partition.
    pub fn vacuum(&self, retain: impl Fn(TransactionId) -> bool) -> usize {
        let ttl = self.config.finished_state_ttl;
        let before = self.states.len();

        self.states
            .retain(|tx_id, meta| !meta.finished_for(ttl) || retain(*tx_id));

        let evicted = before.saturating_sub(self.states.len());
        if evicted > 0 {
            tracing::debug!(
                "[{}] Vacuumed {} finished transactions",
                self.local_node,
                evicted
            );
        }
        evicted
    }

    /// Number of transactions with volatile state on this node.
    pub fn known_transactions(&self) -> usize {
        self.states.len()
    }

    /// A node left the cluster: every pending transaction it coordinated is abandoned.
    pub fn on_node_left(&self, node: &NodeId) {
        let mut abandoned = 0;
        for mut entry in self.states.iter_mut() {
            let meta = entry.value_mut();
            if meta.state == TxState::Pending && meta.coordinator_id.as_ref() == Some(node) {
                *meta = meta.abandoned();
                abandoned += 1;
            }
        }

        if abandoned > 0 {
            tracing::info!(
                "[{}] Node {} left, {} transactions abandoned",
                self.local_node,
                node,
                abandoned
            );
            self.state_changed.notify_waiters();
        }
    }

    /// Stop the manager. Waiters are released and new requests fail.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.state_changed.notify_waiters();
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}
