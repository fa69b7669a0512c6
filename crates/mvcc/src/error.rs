//! Error types for partition storage

use shardline_common::{RowId, TransactionId};
use thiserror::Error;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in partition storage
#[derive(Debug, Error)]
pub enum Error {
    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encoding(String),

    /// A row already carries a write intent of a different transaction.
    #[error("row {row_id} has a write intent of transaction {actual}, expected {expected}")]
    TxIdMismatch {
        row_id: RowId,
        expected: TransactionId,
        actual: TransactionId,
    },

    /// A committed write was attempted over a live write intent.
    #[error("row {row_id} has a write intent of transaction {tx_id}")]
    WriteIntentExists { row_id: RowId, tx_id: TransactionId },
}
