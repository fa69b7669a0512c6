//! Transaction management for shardline
//!
//! - [`TxManager`]: volatile transaction state, finishing transactions, routing
//!   requests to partition primaries
//! - [`LockManager`]: row locks with bounded waiting
//! - recovery of transactions whose coordinator left the cluster

pub mod collaborators;
pub mod config;
pub mod error;
pub mod lock;
pub mod manager;
pub mod recovery;

pub use collaborators::{PlacementDriver, TopologyService, TxMessageSender};
pub use config::TxConfig;
pub use error::{Result, TxError};
pub use lock::{LockAttemptResult, LockKey, LockManager, LockMode};
pub use manager::TxManager;
pub use recovery::TxLiveness;
