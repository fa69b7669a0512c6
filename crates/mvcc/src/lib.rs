//! Multi-version partition storage on top of Fjall
//!
//! This crate provides the persistent state of a table partition replica:
//! - [`MvPartitionStorage`]: committed row versions, write intents and secondary
//!   index entries, mutated atomically together with the applied log position
//! - [`TxStateStorage`]: transaction outcomes persisted once by compare-and-set
//!
//! Both live in the single keyspace of a node's [`StorageEngine`].

pub mod config;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod partition;
pub mod row_version;
pub mod tx_state;
pub mod write_batch;

// Re-export main types
pub use config::StorageConfig;
pub use encoding::{AppliedPosition, Decode, Encode};
pub use engine::StorageEngine;
pub use error::{Error, Result};
pub use partition::MvPartitionStorage;
pub use row_version::{CommittedVersion, ReadResult, RowVersion, WriteIntent};
pub use tx_state::TxStateStorage;
pub use write_batch::PartitionWriteBatch;
