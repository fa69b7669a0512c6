//! Node configuration

use shardline_mvcc::StorageConfig;
use shardline_partition::ReplicaConfig;
use shardline_tx::TxConfig;
use std::path::PathBuf;

/// Everything a node is configured with
#[derive(Clone)]
pub struct NodeConfig {
    pub tx: TxConfig,
    pub replica: ReplicaConfig,
    /// Storage of the node. Each node of a cluster stores under its own
    /// subdirectory of `data_dir`.
    pub storage: StorageConfig,
}

impl NodeConfig {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            tx: TxConfig::default(),
            replica: ReplicaConfig::default(),
            storage: StorageConfig::new(data_dir),
        }
    }

    /// Short timeouts, idle safe time propagation left to the test
    pub fn for_testing(data_dir: PathBuf) -> Self {
        Self {
            tx: TxConfig::for_testing(),
            replica: ReplicaConfig::for_testing(),
            storage: StorageConfig::for_testing(data_dir),
        }
    }

    pub fn with_tx(mut self, tx: TxConfig) -> Self {
        self.tx = tx;
        self
    }

    pub fn with_replica(mut self, replica: ReplicaConfig) -> Self {
        self.replica = replica;
        self
    }

    /// Storage config of one node
    pub(crate) fn node_storage(&self, node: &str) -> StorageConfig {
        self.storage.nested(node)
    }
}
