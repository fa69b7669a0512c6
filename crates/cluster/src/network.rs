//! In-process network between nodes
//!
//! Routes replica requests to the primary replica a node hosts, records every request
//! sent, and lets tests drop messages to simulate a node dying halfway through a
//! protocol. The network also answers placement (which node is the primary of a
//! partition) and membership (which nodes are alive).

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use shardline_common::{NodeId, PartitionId};
use shardline_partition::PartitionReplica;
use shardline_protocol::{ReplicaFailure, ReplicaRequest, ReplicaResponse};
use shardline_tx::{PlacementDriver, TopologyService, TxMessageSender};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

/// What happens to an intercepted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Deliver,
    /// Lost on the wire; the sender sees a timeout
    Drop,
}

type Interceptor = Arc<dyn Fn(&NodeId, &NodeId, &ReplicaRequest) -> Delivery + Send + Sync>;

/// A request as it was sent
#[derive(Debug, Clone)]
pub struct SentRequest {
    pub from: NodeId,
    pub to: NodeId,
    pub request: ReplicaRequest,
    pub delivered: bool,
}

#[derive(Default)]
pub struct LocalNetwork {
    alive: RwLock<HashSet<NodeId>>,
    primaries: RwLock<HashMap<PartitionId, NodeId>>,
    replicas: RwLock<HashMap<(NodeId, PartitionId), Weak<PartitionReplica>>>,
    sent: Mutex<Vec<SentRequest>>,
    interceptor: Mutex<Option<Interceptor>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sender used by the transaction manager of `node`
    pub fn sender(self: &Arc<Self>, node: NodeId) -> Arc<NetworkSender> {
        Arc::new(NetworkSender {
            node,
            network: Arc::clone(self),
        })
    }

    pub fn join(&self, node: &NodeId) {
        self.alive.write().insert(node.clone());
        tracing::debug!("Node {} joined", node);
    }

    /// Remove a node: it stops receiving and sending, and loses its primaries.
    pub fn leave(&self, node: &NodeId) {
        self.alive.write().remove(node);
        self.primaries.write().retain(|_, primary| primary != node);
        self.replicas.write().retain(|(host, _), _| host != node);
        tracing::debug!("Node {} left", node);
    }

    /// Make `replica`, hosted by `node`, the primary of its partition.
    pub fn host(&self, node: &NodeId, replica: &Arc<PartitionReplica>) {
        let partition = replica.partition_id();
        self.replicas
            .write()
            .insert((node.clone(), partition), Arc::downgrade(replica));
        self.primaries.write().insert(partition, node.clone());
    }

    /// Primary replica of `partition`, if its node is up.
    pub fn primary(&self, partition: PartitionId) -> Option<Arc<PartitionReplica>> {
        let node = self.primaries.read().get(&partition).cloned()?;
        self.replicas
            .read()
            .get(&(node, partition))
            .and_then(Weak::upgrade)
    }

    /// Intercept every request from now on.
    pub fn intercept(
        &self,
        interceptor: impl Fn(&NodeId, &NodeId, &ReplicaRequest) -> Delivery + Send + Sync + 'static,
    ) {
        *self.interceptor.lock() = Some(Arc::new(interceptor));
    }

    pub fn clear_interceptor(&self) {
        *self.interceptor.lock() = None;
    }

    /// Requests of a kind sent so far, delivered or not
    pub fn count(&self, kind: &str) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|sent| sent.request.kind() == kind)
            .count()
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().clone()
    }

    async fn deliver(
        &self,
        from: &NodeId,
        to: &NodeId,
        request: ReplicaRequest,
    ) -> Result<ReplicaResponse, ReplicaFailure> {
        let interceptor = self.interceptor.lock().clone();
        let delivery = match interceptor {
            Some(interceptor) => interceptor(from, to, &request),
            None => Delivery::Deliver,
        };

        self.sent.lock().push(SentRequest {
            from: from.clone(),
            to: to.clone(),
            request: request.clone(),
            delivered: delivery == Delivery::Deliver,
        });

        if !self.alive.read().contains(from) {
            return Err(ReplicaFailure::NodeStopping);
        }
        if delivery == Delivery::Drop {
            tracing::debug!("Dropped {} from {} to {}", request.kind(), from, to);
            return Err(ReplicaFailure::Timeout);
        }
        if !self.alive.read().contains(to) {
            return Err(ReplicaFailure::NodeNotFound(to.clone()));
        }

        let partition = request.partition();
        let replica = self
            .replicas
            .read()
            .get(&(to.clone(), partition))
            .and_then(Weak::upgrade);
        match replica {
            Some(replica) => replica.handle_request(request).await,
            None => Err(ReplicaFailure::PrimaryReplicaMiss {
                partition,
                node: to.clone(),
            }),
        }
    }
}

impl PlacementDriver for LocalNetwork {
    fn primary_replica(&self, partition: PartitionId) -> Option<NodeId> {
        self.primaries.read().get(&partition).cloned()
    }
}

impl TopologyService for LocalNetwork {
    fn is_alive(&self, node: &NodeId) -> bool {
        self.alive.read().contains(node)
    }
}

/// Sends the requests of one node
pub struct NetworkSender {
    node: NodeId,
    network: Arc<LocalNetwork>,
}

#[async_trait]
impl TxMessageSender for NetworkSender {
    async fn send(
        &self,
        target: &NodeId,
        request: ReplicaRequest,
    ) -> Result<ReplicaResponse, ReplicaFailure> {
        self.network.deliver(&self.node, target, request).await
    }
}
