//! Test doubles for the transaction manager's collaborators

use async_trait::async_trait;
use parking_lot::Mutex;
use shardline_common::{NodeId, PartitionId};
use shardline_hlc::HybridClock;
use shardline_protocol::{ReplicaFailure, ReplicaRequest, ReplicaResponse};
use shardline_tx::{PlacementDriver, TopologyService, TxConfig, TxManager, TxMessageSender};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

type Handler = dyn Fn(&ReplicaRequest) -> Result<ReplicaResponse, ReplicaFailure> + Send + Sync;

/// Sender answering every request with a scripted handler and recording what was sent
pub struct ScriptedSender {
    pub sent: Mutex<Vec<(NodeId, ReplicaRequest)>>,
    handler: Box<Handler>,
    delay: Duration,
}

impl ScriptedSender {
    pub fn new(
        handler: impl Fn(&ReplicaRequest) -> Result<ReplicaResponse, ReplicaFailure>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            handler: Box::new(handler),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn count(&self, kind: &str) -> usize {
        self.sent.lock().iter().filter(|(_, req)| req.kind() == kind).count()
    }
}

#[async_trait]
impl TxMessageSender for ScriptedSender {
    async fn send(
        &self,
        target: &NodeId,
        request: ReplicaRequest,
    ) -> Result<ReplicaResponse, ReplicaFailure> {
        self.sent.lock().push((target.clone(), request.clone()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.handler)(&request)
    }
}

/// Every partition's primary lives on `primary`
pub struct FixedPlacement {
    pub primary: NodeId,
}

impl PlacementDriver for FixedPlacement {
    fn primary_replica(&self, _partition: PartitionId) -> Option<NodeId> {
        Some(self.primary.clone())
    }
}

/// Membership where nodes can be declared dead
#[derive(Default)]
pub struct Membership {
    pub dead: Mutex<HashSet<NodeId>>,
}

impl Membership {
    pub fn kill(&self, node: &NodeId) {
        self.dead.lock().insert(node.clone());
    }
}

impl TopologyService for Membership {
    fn is_alive(&self, node: &NodeId) -> bool {
        !self.dead.lock().contains(node)
    }
}

pub struct Harness {
    pub manager: Arc<TxManager>,
    pub sender: Arc<ScriptedSender>,
    pub membership: Arc<Membership>,
}

pub fn harness(sender: ScriptedSender) -> Harness {
    harness_with(sender, TxConfig::for_testing())
}

pub fn harness_with(sender: ScriptedSender, config: TxConfig) -> Harness {
    let sender = Arc::new(sender);
    let membership = Arc::new(Membership::default());
    let manager = Arc::new(TxManager::new(
        NodeId::new("local"),
        Arc::new(HybridClock::new()),
        config,
        sender.clone(),
        Arc::new(FixedPlacement {
            primary: NodeId::new("primary"),
        }),
        membership.clone(),
    ));

    Harness {
        manager,
        sender,
        membership,
    }
}
