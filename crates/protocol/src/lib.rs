//! Transaction protocol messages
//!
//! Defines the requests exchanged between nodes to finish, clean up, query and
//! recover transactions, and the typed failures a replica can answer with.

mod messages;

pub use messages::{
    FinishTxRequest, ProtocolError, ReplicaFailure, ReplicaRequest, ReplicaResponse,
    TxRecoveryMessage, TxStateCommitPartitionRequest, WriteIntentSwitchRequest, decode, encode,
};
