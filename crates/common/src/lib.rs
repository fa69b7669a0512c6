//! Common types for shardline
//!
//! This crate defines:
//! - Transaction ids that embed their begin timestamp
//! - Row, partition and node identifiers
//! - Binary row payloads
//! - Persisted and volatile transaction state

mod ids;
mod row;
mod row_id;
mod transaction_id;
mod tx_state;

pub use ids::{NodeId, PartitionId};
pub use row::BinaryRow;
pub use row_id::RowId;
pub use transaction_id::TransactionId;
pub use tx_state::{TransactionResult, TxMeta, TxState, TxStateMeta};
