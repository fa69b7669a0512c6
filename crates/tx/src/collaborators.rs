//! Services the transaction manager depends on
//!
//! Transport, placement and membership are provided by the embedding node.

use async_trait::async_trait;
use shardline_common::{NodeId, PartitionId};
use shardline_protocol::{ReplicaFailure, ReplicaRequest, ReplicaResponse};

/// Sends transaction protocol requests to other nodes.
#[async_trait]
pub trait TxMessageSender: Send + Sync {
    async fn send(
        &self,
        target: &NodeId,
        request: ReplicaRequest,
    ) -> Result<ReplicaResponse, ReplicaFailure>;
}

/// Knows which node currently holds the primary replica of each partition.
pub trait PlacementDriver: Send + Sync {
    fn primary_replica(&self, partition: PartitionId) -> Option<NodeId>;
}

/// Cluster membership as seen by this node.
pub trait TopologyService: Send + Sync {
    fn is_alive(&self, node: &NodeId) -> bool;
}
