//! A cluster of nodes sharing one process
//!
//! Nodes share a hybrid clock, a catalog and the network. Partitions of the single
//! table are placed round-robin: partition `p` is primary on node `p % nodes`.

use crate::client::Transaction;
use crate::config::NodeConfig;
use crate::error::{ClusterError, Result};
use crate::network::LocalNetwork;
use crate::node::Node;
use parking_lot::RwLock;
use shardline_common::{BinaryRow, NodeId, PartitionId, RowId, TransactionId};
use shardline_hlc::{HybridClock, HybridTimestamp, SharedClock};
use shardline_partition::{ExecutionMode, InMemoryCatalog, PartitionReplica};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Table every partition of the cluster belongs to
pub const TABLE_ID: u32 = 1;

pub struct LocalCluster {
    clock: SharedClock,
    catalog: Arc<InMemoryCatalog>,
    network: Arc<LocalNetwork>,
    nodes: RwLock<BTreeMap<NodeId, Arc<Node>>>,
}

impl LocalCluster {
    /// Start `node_count` nodes named `node-1`, `node-2`, ... and `partitions`
    /// partitions placed on them.
    pub fn start(config: NodeConfig, node_count: usize, partitions: u32) -> Result<Self> {
        let clock: SharedClock = Arc::new(HybridClock::new());
        let catalog = Arc::new(InMemoryCatalog::new(clock.clone()));
        let network = LocalNetwork::new();

        let mut nodes = Vec::with_capacity(node_count);
        for i in 1..=node_count {
            nodes.push(Node::start(
                NodeId::new(format!("node-{i}")),
                config.clone(),
                clock.clone(),
                catalog.clone(),
                network.clone(),
            )?);
        }

        if !nodes.is_empty() {
            for partition in 0..partitions {
                let node = &nodes[partition as usize % nodes.len()];
                node.host(PartitionId::new(TABLE_ID, partition))?;
            }
        }

        tracing::info!("Cluster of {} nodes started with {} partitions", node_count, partitions);

        Ok(Self {
            clock,
            catalog,
            network,
            nodes: RwLock::new(
                nodes
                    .into_iter()
                    .map(|node| (node.id().clone(), node))
                    .collect(),
            ),
        })
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn now(&self) -> HybridTimestamp {
        self.clock.now()
    }

    pub fn catalog(&self) -> &Arc<InMemoryCatalog> {
        &self.catalog
    }

    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    pub fn partition(&self, partition: u32) -> PartitionId {
        PartitionId::new(TABLE_ID, partition)
    }

    pub fn node(&self, id: &NodeId) -> Result<Arc<Node>> {
        self.nodes
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ClusterError::UnknownNode(id.clone()))
    }

    /// The `n`th node, counting from 1.
    pub fn node_at(&self, n: usize) -> Result<Arc<Node>> {
        self.node(&NodeId::new(format!("node-{n}")))
    }

    pub fn primary(&self, partition: PartitionId) -> Result<Arc<PartitionReplica>> {
        self.network
            .primary(partition)
            .ok_or(ClusterError::NoPrimary(partition))
    }

    /// Begin a read-write transaction coordinated by `coordinator`.
    pub fn begin(&self, coordinator: &NodeId) -> Result<Transaction> {
        Ok(Transaction::begin(self.node(coordinator)?, self.network.clone()))
    }

    /// Write rows of one partition in a single-partition transaction committed by the
    /// write itself.
    pub async fn upsert_one_phase(
        &self,
        coordinator: &NodeId,
        partition: PartitionId,
        rows: Vec<(RowId, Option<BinaryRow>)>,
    ) -> Result<TransactionId> {
        let node = self.node(coordinator)?;
        let tx_id = node.tx_manager().begin();
        self.primary(partition)?
            .upsert_all(tx_id, partition, Some(node.id().clone()), rows, ExecutionMode::OnePhase)
            .await?;
        Ok(tx_id)
    }

    /// Read a row as of `read_ts` without locks.
    pub async fn read_only(
        &self,
        partition: PartitionId,
        row_id: RowId,
        read_ts: HybridTimestamp,
    ) -> Result<Option<BinaryRow>> {
        Ok(self.primary(partition)?.read_ro(row_id, read_ts).await?)
    }

    /// Take a node out of the cluster abruptly. The remaining nodes are told it left.
    pub async fn kill(&self, id: &NodeId) -> Result<()> {
        let node = self
            .nodes
            .write()
            .remove(id)
            .ok_or_else(|| ClusterError::UnknownNode(id.clone()))?;

        self.network.leave(id);
        node.stop().await?;

        let survivors: Vec<_> = self.nodes.read().values().cloned().collect();
        for survivor in survivors {
            survivor.tx_manager().on_node_left(id);
        }
        tracing::info!("Node {} killed", id);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let nodes: Vec<_> = std::mem::take(&mut *self.nodes.write()).into_values().collect();
        for node in nodes {
            self.network.leave(node.id());
            node.stop().await?;
        }
        Ok(())
    }
}
