//! In-process replication group of one partition
//!
//! Stands in for the consensus layer: proposals are ordered into a log, every entry
//! gets an `(index, term)` and is applied by a single task, in order, through the
//! partition's [`PartitionListener`]. The proposer is answered with the command's
//! result once it is applied.
//!
//! Commands carrying a safe time are stamped with the clock at proposal and checked
//! with [`PartitionListener::before_apply`] under the log lock, so log order and safe
//! time order agree. A proposal rejected for reorder is re-stamped and retried.
//!
//! Once the log retains `log_retention` entries, a snapshot is saved and the applied
//! prefix of the log is dropped.

use crate::command::Command;
use crate::error::{CommandError, FatalError, ReplicationError};
use crate::listener::{CommandResult, PartitionListener};
use parking_lot::Mutex;
use shardline_common::PartitionId;
use shardline_hlc::SharedClock;
use shardline_mvcc::AppliedPosition;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type ApplyReply = oneshot::Sender<Result<CommandResult, FatalError>>;

#[derive(Debug, Clone)]
struct LogEntry {
    index: u64,
    term: u64,
    bytes: Vec<u8>,
}

struct ApplyTask {
    entry: LogEntry,
    reply: Option<ApplyReply>,
}

struct ReplicationLog {
    entries: Vec<LogEntry>,
    last_index: u64,
    term: u64,
}

impl ReplicationLog {
    fn append(&mut self, bytes: Vec<u8>) -> LogEntry {
        self.last_index += 1;
        let entry = LogEntry {
            index: self.last_index,
            term: self.term,
            bytes,
        };
        self.entries.push(entry.clone());
        entry
    }
}

/// Ordered command log of one partition with a single apply task.
pub struct ReplicationGroup {
    partition_id: PartitionId,
    listener: Arc<PartitionListener>,
    clock: SharedClock,
    max_reorder_retries: u32,
    log_retention: usize,
    log: Mutex<ReplicationLog>,
    apply_tx: mpsc::UnboundedSender<ApplyTask>,
    apply_task: Mutex<Option<JoinHandle<()>>>,
    fatal: Arc<Mutex<Option<FatalError>>>,
}

impl ReplicationGroup {
    /// Start the group with this replica as leader of term 1.
    ///
    /// `applied` is where the storages already are; the log continues after it.
    pub fn start(
        listener: Arc<PartitionListener>,
        clock: SharedClock,
        max_reorder_retries: u32,
        log_retention: usize,
        applied: AppliedPosition,
    ) -> Arc<Self> {
        let partition_id = listener.partition_id();
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let fatal = Arc::new(Mutex::new(None));

        let apply_task = tokio::spawn(Self::apply_loop(
            partition_id,
            listener.clone(),
            apply_rx,
            fatal.clone(),
        ));

        listener.on_leader_start();

        Arc::new(Self {
            partition_id,
            listener,
            clock,
            max_reorder_retries,
            log_retention: log_retention.max(1),
            log: Mutex::new(ReplicationLog {
                entries: Vec::new(),
                last_index: applied.index,
                term: applied.term.max(1),
            }),
            apply_tx,
            apply_task: Mutex::new(Some(apply_task)),
            fatal,
        })
    }

    async fn apply_loop(
        partition_id: PartitionId,
        listener: Arc<PartitionListener>,
        mut apply_rx: mpsc::UnboundedReceiver<ApplyTask>,
        fatal: Arc<Mutex<Option<FatalError>>>,
    ) {
        while let Some(task) = apply_rx.recv().await {
            let result = listener.apply_raw(&task.entry.bytes, task.entry.index, task.entry.term);

            if let Err(error) = &result {
                tracing::error!(
                    "[{}] Apply loop stopped at index {}: {}",
                    partition_id,
                    task.entry.index,
                    error
                );
                *fatal.lock() = Some(error.clone());
            }

            let stop = result.is_err();
            if let Some(reply) = task.reply {
                // The proposer may have gone away
                let _ = reply.send(result);
            }
            if stop {
                break;
            }
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn listener(&self) -> &Arc<PartitionListener> {
        &self.listener
    }

    pub fn term(&self) -> u64 {
        self.log.lock().term
    }

    pub fn last_index(&self) -> u64 {
        self.log.lock().last_index
    }

    /// Entries not yet truncated by a snapshot.
    pub fn retained_entries(&self) -> usize {
        self.log.lock().entries.len()
    }

    fn check_fatal(&self) -> Result<(), ReplicationError> {
        match self.fatal.lock().as_ref() {
            Some(fatal) => Err(ReplicationError::Fatal(fatal.clone())),
            None => Ok(()),
        }
    }

    /// Propose a command and wait for its result.
    pub async fn propose(&self, command: Command) -> Result<CommandResult, ReplicationError> {
        for attempt in 0..=self.max_reorder_retries {
            self.check_fatal()?;

            let command = match command.safe_time() {
                Some(_) => command.clone().with_safe_time(self.clock.now()),
                None => command.clone(),
            };

            let reply = {
                let mut log = self.log.lock();

                if let Err(rejected) = self.listener.before_apply(&command) {
                    if let CommandError::SafeTimeReorder { max_observed, .. } = rejected {
                        self.clock.update(max_observed);
                    }
                    tracing::debug!(
                        "[{}] Proposal of {} rejected (attempt {}): {}",
                        self.partition_id,
                        command.name(),
                        attempt + 1,
                        rejected
                    );
                    continue;
                }

                let bytes = command.encode().map_err(ReplicationError::Encode)?;
                let entry = log.append(bytes);
                let (reply_tx, reply_rx) = oneshot::channel();
                self.apply_tx
                    .send(ApplyTask {
                        entry,
                        reply: Some(reply_tx),
                    })
                    .map_err(|_| FatalError::Stopped)?;
                reply_rx
            };

            let result = reply.await.map_err(|_| FatalError::Stopped)??;
            self.truncate_if_full();

            match result {
                Err(CommandError::SafeTimeReorder { max_observed, .. }) => {
                    self.clock.update(max_observed);
                }
                result => return Ok(result),
            }
        }

        Err(ReplicationError::ReorderRetriesExhausted(self.max_reorder_retries))
    }

    /// Re-deliver every retained entry from `from_index` on, as a restarted follower
    /// would receive them. Returns how many entries were re-delivered.
    pub async fn replay(&self, from_index: u64) -> Result<usize, ReplicationError> {
        self.check_fatal()?;

        let (count, last_reply) = {
            let log = self.log.lock();
            let entries: Vec<_> = log
                .entries
                .iter()
                .filter(|entry| entry.index >= from_index)
                .cloned()
                .collect();

            let count = entries.len();
            let mut last_reply = None;
            for (i, entry) in entries.into_iter().enumerate() {
                let reply = if i + 1 == count {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    last_reply = Some(reply_rx);
                    Some(reply_tx)
                } else {
                    None
                };
                self.apply_tx
                    .send(ApplyTask { entry, reply })
                    .map_err(|_| FatalError::Stopped)?;
            }
            (count, last_reply)
        };

        if let Some(reply) = last_reply {
            let _ = reply.await.map_err(|_| FatalError::Stopped)??;
        }

        tracing::debug!("[{}] Replayed {} entries from index {}", self.partition_id, count, from_index);
        Ok(count)
    }

    /// Start a new term with this replica as leader. Returns the new term.
    pub fn start_new_term(&self) -> u64 {
        let term = {
            let mut log = self.log.lock();
            log.term += 1;
            log.term
        };
        self.listener.on_leader_start();
        term
    }

    fn truncate_if_full(&self) {
        if self.log.lock().entries.len() < self.log_retention {
            return;
        }
        match self.snapshot() {
            Ok(position) => tracing::debug!(
                "[{}] Log truncated up to index {}",
                self.partition_id,
                position.index
            ),
            Err(e) => tracing::warn!("[{}] Failed to truncate the log: {}", self.partition_id, e),
        }
    }

    /// Save a snapshot and truncate the log up to the advertised position.
    pub fn snapshot(&self) -> Result<AppliedPosition, ReplicationError> {
        let advertised = self.listener.on_snapshot_save()?;
        self.log
            .lock()
            .entries
            .retain(|entry| entry.index > advertised.index);
        Ok(advertised)
    }

    /// Append raw bytes to the log without a reply. Used to inject entries the state
    /// machine cannot decode.
    pub fn append_raw(&self, bytes: Vec<u8>) -> Result<u64, ReplicationError> {
        let mut log = self.log.lock();
        let entry = log.append(bytes);
        let index = entry.index;
        self.apply_tx
            .send(ApplyTask { entry, reply: None })
            .map_err(|_| FatalError::Stopped)?;
        Ok(index)
    }

    /// Error that stopped the apply loop, if any.
    pub fn fatal_error(&self) -> Option<FatalError> {
        self.fatal.lock().clone()
    }

    /// Stop applying commands.
    pub async fn stop(&self) {
        self.listener.on_shutdown();
        let task = self.apply_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}
