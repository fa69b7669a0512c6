//! Replicated partition state machine for shardline
//!
//! This crate provides:
//! - [`Command`]: the closed set of replicated partition commands
//! - [`PartitionListener`]: applies the command log to MVCC storage, tx-state storage,
//!   the safe time tracker and volatile transaction state, exactly once per log index
//! - [`ReplicationGroup`]: in-process ordered log with a single apply task
//! - [`PartitionReplica`]: primary replica serving reads, writes and transaction
//!   protocol requests
//! - [`IndexBuilder`]: resumable backfill of secondary indexes

pub mod catalog;
pub mod command;
pub mod config;
pub mod error;
pub mod index;
pub mod index_builder;
pub mod listener;
pub mod replica;
pub mod replication;
pub mod storage_handler;

pub use catalog::{Catalog, CatalogService, InMemoryCatalog, IndexDescriptor, IndexStatus};
pub use command::{
    BuildIndexCommand, Command, FinishTxCommand, SafeTimeSyncCommand, UpdateAllCommand,
    UpdateCommand, WriteIntentSwitchCommand,
};
pub use config::ReplicaConfig;
pub use error::{CommandError, FatalError, ReplicaError, ReplicationError, Result};
pub use index::BuildIndexRowVersionChooser;
pub use index_builder::IndexBuilder;
pub use listener::{CommandResponse, CommandResult, PartitionListener};
pub use replica::{ExecutionMode, PartitionReplica, ReplicaContext};
pub use replication::ReplicationGroup;
pub use storage_handler::StorageUpdateHandler;
