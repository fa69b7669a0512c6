//! Lock manager for row-level locking
//!
//! Provides shared/exclusive row locks owned by transactions. Conflicting requests
//! wait until a holder releases, re-checking periodically so that the caller gets a
//! chance to recover holders whose coordinator has left. A request that is still
//! blocked after the lock wait timeout fails with [`TxError::AcquireLock`].

use crate::error::{Result, TxError};
use parking_lot::Mutex;
use shardline_common::{PartitionId, RowId, TransactionId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Lockable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey {
    pub partition: PartitionId,
    pub row_id: RowId,
}

impl LockKey {
    pub fn row(partition: PartitionId, row_id: RowId) -> Self {
        Self { partition, row_id }
    }
}

/// Lock modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared lock for reading
    Shared,
    /// Exclusive lock for writing
    Exclusive,
}

impl LockMode {
    /// Check if two lock modes are compatible
    pub fn is_compatible_with(&self, other: LockMode) -> bool {
        matches!((*self, other), (LockMode::Shared, LockMode::Shared))
    }
}

/// Information about a held lock
#[derive(Debug, Clone)]
struct LockInfo {
    holder: TransactionId,
    mode: LockMode,
}

/// Result of checking if a lock can be acquired
#[derive(Debug, Clone, PartialEq)]
pub enum LockAttemptResult {
    /// Lock was granted
    Granted,
    /// Lock conflicts with existing locks
    Conflict {
        /// Transactions holding conflicting locks, oldest first
        holders: Vec<(TransactionId, LockMode)>,
    },
}

#[derive(Default)]
struct LockTable {
    locks: HashMap<LockKey, Vec<LockInfo>>,
}

impl LockTable {
    fn conflicts(&self, tx_id: TransactionId, key: &LockKey, mode: LockMode) -> Vec<(TransactionId, LockMode)> {
        let mut conflicts: Vec<_> = self
            .locks
            .get(key)
            .into_iter()
            .flatten()
            // Re-entrant for the same transaction
            .filter(|lock| lock.holder != tx_id && !lock.mode.is_compatible_with(mode))
            .map(|lock| (lock.holder, lock.mode))
            .collect();

        conflicts.sort_by_key(|(holder, _)| *holder);
        conflicts
    }

    fn grant(&mut self, tx_id: TransactionId, key: LockKey, mode: LockMode) {
        let holders = self.locks.entry(key).or_default();
        match holders.iter_mut().find(|lock| lock.holder == tx_id) {
            // Upgrade in place, never downgrade
            Some(existing) => {
                if mode == LockMode::Exclusive {
                    existing.mode = LockMode::Exclusive;
                }
            }
            None => holders.push(LockInfo {
                holder: tx_id,
                mode,
            }),
        }
    }
}

/// Row lock manager of a node.
pub struct LockManager {
    table: Mutex<LockTable>,
    released: Notify,
    lock_wait_timeout: Duration,
    recheck_interval: Duration,
}

impl LockManager {
    /// Create a new lock manager
    pub fn new(lock_wait_timeout: Duration, recheck_interval: Duration) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            released: Notify::new(),
            lock_wait_timeout,
            recheck_interval,
        }
    }

    /// Grant the lock if there is no conflict.
    pub fn try_acquire(&self, tx_id: TransactionId, key: LockKey, mode: LockMode) -> LockAttemptResult {
        let mut table = self.table.lock();
        let holders = table.conflicts(tx_id, &key, mode);
        if holders.is_empty() {
            table.grant(tx_id, key, mode);
            LockAttemptResult::Granted
        } else {
            LockAttemptResult::Conflict { holders }
        }
    }

    /// Acquire a lock, waiting while it conflicts.
    ///
    /// `on_conflict` is called with the conflicting holders every time the request
    /// finds the lock taken.
    pub async fn acquire(
        &self,
        tx_id: TransactionId,
        key: LockKey,
        mode: LockMode,
        mut on_conflict: impl FnMut(&[TransactionId]),
    ) -> Result<()> {
        let deadline = Instant::now() + self.lock_wait_timeout;

        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            match self.try_acquire(tx_id, key, mode) {
                LockAttemptResult::Granted => return Ok(()),
                LockAttemptResult::Conflict { holders } => {
                    let holders: Vec<_> = holders.into_iter().map(|(holder, _)| holder).collect();
                    on_conflict(&holders);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(
                    "Transaction {} gave up waiting for lock on {} in {}",
                    tx_id,
                    key.row_id,
                    key.partition
                );
                return Err(TxError::AcquireLock(tx_id));
            }

            let wake_at = deadline.min(now + self.recheck_interval);
            let _ = tokio::time::timeout_at(wake_at, released).await;
        }
    }

    /// Release a specific lock held by a transaction
    pub fn release(&self, tx_id: TransactionId, key: &LockKey) {
        {
            let mut table = self.table.lock();
            if let Some(holders) = table.locks.get_mut(key) {
                holders.retain(|lock| lock.holder != tx_id);
                if holders.is_empty() {
                    table.locks.remove(key);
                }
            }
        }
        self.released.notify_waiters();
    }

    /// Release every lock a transaction holds in one partition. Returns how many.
    pub fn release_all(&self, tx_id: TransactionId, partition: PartitionId) -> usize {
        let mut released = 0;
        {
            let mut table = self.table.lock();
            table.locks.retain(|key, holders| {
                if key.partition == partition {
                    let before = holders.len();
                    holders.retain(|lock| lock.holder != tx_id);
                    released += before - holders.len();
                }
                !holders.is_empty()
            });
        }

        if released > 0 {
            self.released.notify_waiters();
        }
        released
    }

    /// Get all locks held by a transaction, sorted by key
    pub fn locks_held_by(&self, tx_id: TransactionId) -> Vec<(LockKey, LockMode)> {
        let table = self.table.lock();
        let mut result: Vec<_> = table
            .locks
            .iter()
            .flat_map(|(key, holders)| {
                holders
                    .iter()
                    .filter(move |lock| lock.holder == tx_id)
                    .map(move |lock| (*key, lock.mode))
            })
            .collect();

        result.sort_by_key(|(key, _)| *key);
        result
    }
}
