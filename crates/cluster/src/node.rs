//! A node of the in-process cluster
//!
//! Owns one storage engine, one transaction manager and one lock manager, and the
//! primary replicas of the partitions placed on it. A background task evicts the
//! volatile state of finished transactions that no longer hold locks here.

use crate::config::NodeConfig;
use crate::error::Result;
use crate::network::LocalNetwork;
use parking_lot::{Mutex, RwLock};
use shardline_common::{NodeId, PartitionId};
use shardline_hlc::SharedClock;
use shardline_mvcc::StorageEngine;
use shardline_partition::{CatalogService, PartitionReplica, ReplicaContext};
use shardline_tx::{LockManager, TxManager};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct Node {
    id: NodeId,
    config: NodeConfig,
    clock: SharedClock,
    catalog: Arc<dyn CatalogService>,
    network: Arc<LocalNetwork>,
    engine: StorageEngine,
    tx_manager: Arc<TxManager>,
    lock_manager: Arc<LockManager>,
    replicas: RwLock<HashMap<PartitionId, Arc<PartitionReplica>>>,
    vacuum: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Open the node's storage and join the network.
    pub fn start(
        id: NodeId,
        config: NodeConfig,
        clock: SharedClock,
        catalog: Arc<dyn CatalogService>,
        network: Arc<LocalNetwork>,
    ) -> Result<Arc<Self>> {
        let engine = StorageEngine::open(config.node_storage(id.as_str()))?;

        let lock_manager = Arc::new(LockManager::new(
            config.tx.lock_wait_timeout,
            config.tx.abandoned_check_interval,
        ));
        let tx_manager = Arc::new(TxManager::new(
            id.clone(),
            clock.clone(),
            config.tx.clone(),
            network.sender(id.clone()),
            network.clone(),
            network.clone(),
        ));

        let vacuum = tokio::spawn(Self::run_vacuum(
            Arc::downgrade(&tx_manager),
            Arc::downgrade(&lock_manager),
            config.tx.finished_state_ttl,
        ));

        network.join(&id);
        tracing::info!("Node {} started", id);

        Ok(Arc::new(Self {
            id,
            config,
            clock,
            catalog,
            network,
            engine,
            tx_manager,
            lock_manager,
            replicas: RwLock::new(HashMap::new()),
            vacuum: Mutex::new(Some(vacuum)),
        }))
    }

    async fn run_vacuum(tx_manager: Weak<TxManager>, lock_manager: Weak<LockManager>, period: Duration) {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            let (Some(tx_manager), Some(lock_manager)) = (tx_manager.upgrade(), lock_manager.upgrade()) else {
                break;
            };
            if tx_manager.is_stopping() {
                break;
            }
            // Holders of locks still need their outcome for cleanup
            tx_manager.vacuum(|tx_id| !lock_manager.locks_held_by(tx_id).is_empty());
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn tx_manager(&self) -> &Arc<TxManager> {
        &self.tx_manager
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// Start the primary replica of `partition` on this node.
    pub fn host(&self, partition: PartitionId) -> Result<Arc<PartitionReplica>> {
        let replica = PartitionReplica::start(ReplicaContext {
            partition_id: partition,
            local_node: self.id.clone(),
            storage: Arc::new(self.engine.partition_storage(partition)?),
            tx_state_storage: Arc::new(self.engine.tx_state_storage(partition)?),
            tx_manager: self.tx_manager.clone(),
            lock_manager: self.lock_manager.clone(),
            catalog: self.catalog.clone(),
            clock: self.clock.clone(),
            config: self.config.replica.clone(),
        });

        self.network.host(&self.id, &replica);
        self.replicas.write().insert(partition, replica.clone());
        Ok(replica)
    }

    pub fn replica(&self, partition: PartitionId) -> Option<Arc<PartitionReplica>> {
        self.replicas.read().get(&partition).cloned()
    }

    pub fn partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<_> = self.replicas.read().keys().copied().collect();
        partitions.sort();
        partitions
    }

    /// Stop the transaction manager and every replica, then persist storage.
    pub async fn stop(&self) -> Result<()> {
        self.tx_manager.stop();
        let vacuum = self.vacuum.lock().take();
        if let Some(vacuum) = vacuum {
            vacuum.abort();
            let _ = vacuum.await;
        }

        let replicas: Vec<_> = self.replicas.write().drain().map(|(_, replica)| replica).collect();
        for replica in replicas {
            replica.stop().await;
        }

        self.engine.persist()?;
        tracing::info!("Node {} stopped", self.id);
        Ok(())
    }
}
