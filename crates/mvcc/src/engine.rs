//! Node-level storage engine
//!
//! One fjall keyspace per node. Partition storages and transaction state storages are
//! opened inside it, so a batch may span the areas of one partition atomically.

use crate::config::StorageConfig;
use crate::error::Result;
use crate::partition::MvPartitionStorage;
use crate::tx_state::TxStateStorage;
use fjall::Keyspace;
use shardline_common::PartitionId;

/// Storage engine backing every partition hosted by a node.
pub struct StorageEngine {
    keyspace: Keyspace,
    config: StorageConfig,
}

impl StorageEngine {
    /// Open (or create) the engine at `config.data_dir`
    pub fn open(config: StorageConfig) -> Result<Self> {
        // Ensure directory exists
        std::fs::create_dir_all(&config.data_dir)?;

        let keyspace = fjall::Config::new(&config.data_dir)
            .cache_size(config.block_cache_size)
            .open()?;

        Ok(Self { keyspace, config })
    }

    /// Open the multi-version storage of a partition
    pub fn partition_storage(&self, partition_id: PartitionId) -> Result<MvPartitionStorage> {
        MvPartitionStorage::open(self.keyspace.clone(), partition_id, &self.config)
    }

    /// Open the transaction state storage of a partition
    pub fn tx_state_storage(&self, partition_id: PartitionId) -> Result<TxStateStorage> {
        TxStateStorage::open(self.keyspace.clone(), partition_id, &self.config)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Persist everything written so far
    pub fn persist(&self) -> Result<()> {
        self.keyspace.persist(self.config.persist_mode)?;
        Ok(())
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        // Ensure data is persisted on drop
        let _ = self.keyspace.persist(fjall::PersistMode::SyncAll);
    }
}
