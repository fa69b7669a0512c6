//! In-process shardline cluster
//!
//! Wires nodes, each with its storage engine, transaction manager and partition
//! replicas, through a local network. Used to run the transaction protocol end to
//! end: distributed commit, recovery of transactions whose coordinator left, and
//! readers resolving write intents.

pub mod client;
pub mod cluster;
pub mod config;
pub mod error;
pub mod network;
pub mod node;

pub use client::Transaction;
pub use cluster::{LocalCluster, TABLE_ID};
pub use config::NodeConfig;
pub use error::{ClusterError, Result};
pub use network::{Delivery, LocalNetwork, NetworkSender, SentRequest};
pub use node::Node;
