//! Single node fixture: storage, catalog, transaction manager and replicas wired
//! through a loopback transport.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use shardline_common::{NodeId, PartitionId, TransactionId};
use shardline_hlc::{HybridClock, HybridTimestamp, SharedClock};
use shardline_mvcc::{MvPartitionStorage, StorageConfig, StorageEngine, TxStateStorage};
use shardline_partition::{
    InMemoryCatalog, PartitionListener, PartitionReplica, ReplicaConfig, ReplicaContext,
};
use shardline_protocol::{ReplicaFailure, ReplicaRequest, ReplicaResponse};
use shardline_tracker::{SafeTimeTracker, StorageIndexTracker};
use shardline_tx::{LockManager, PlacementDriver, TopologyService, TxConfig, TxManager, TxMessageSender};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tempfile::TempDir;

pub const TABLE_ID: u32 = 1;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn ts(physical: u64) -> HybridTimestamp {
    HybridTimestamp::new(physical, 0)
}

pub fn tx_at(physical: u64) -> TransactionId {
    TransactionId::new(ts(physical))
}

/// Delivers requests to the replicas of this node and records them
#[derive(Default)]
pub struct LoopbackSender {
    replicas: RwLock<HashMap<PartitionId, Weak<PartitionReplica>>>,
    pub sent: Mutex<Vec<ReplicaRequest>>,
}

impl LoopbackSender {
    pub fn register(&self, replica: &Arc<PartitionReplica>) {
        self.replicas
            .write()
            .insert(replica.partition_id(), Arc::downgrade(replica));
    }

    pub fn count(&self, kind: &str) -> usize {
        self.sent.lock().iter().filter(|req| req.kind() == kind).count()
    }
}

#[async_trait]
impl TxMessageSender for LoopbackSender {
    async fn send(
        &self,
        target: &NodeId,
        request: ReplicaRequest,
    ) -> Result<ReplicaResponse, ReplicaFailure> {
        self.sent.lock().push(request.clone());

        let replica = self
            .replicas
            .read()
            .get(&request.partition())
            .and_then(Weak::upgrade);
        match replica {
            Some(replica) => replica.handle_request(request).await,
            None => Err(ReplicaFailure::NodeNotFound(target.clone())),
        }
    }
}

pub struct LocalPlacement(pub NodeId);

impl PlacementDriver for LocalPlacement {
    fn primary_replica(&self, _partition: PartitionId) -> Option<NodeId> {
        Some(self.0.clone())
    }
}

#[derive(Default)]
pub struct Membership {
    dead: Mutex<HashSet<NodeId>>,
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

/// State machine with its stores and trackers, without replication
pub struct ListenerHarness {
    pub listener: PartitionListener,
    pub partition_id: PartitionId,
    pub storage: Arc<MvPartitionStorage>,
    pub tx_state: Arc<TxStateStorage>,
    pub safe_time: Arc<SafeTimeTracker>,
    pub storage_index: Arc<StorageIndexTracker>,
}

pub struct Fixture {
    pub node: NodeId,
    pub clock: SharedClock,
    pub catalog: Arc<InMemoryCatalog>,
    pub tx_manager: Arc<TxManager>,
    pub lock_manager: Arc<LockManager>,
    pub sender: Arc<LoopbackSender>,
    pub membership: Arc<Membership>,
    pub engine: StorageEngine,
    _dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(TxConfig::for_testing().with_lock_wait_timeout(Duration::from_millis(500)))
    }

    pub fn with_config(tx_config: TxConfig) -> Self {
        init_tracing();

        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(StorageConfig::for_testing(dir.path().to_path_buf())).unwrap();
        let node = NodeId::new("node-1");
        let clock: SharedClock = Arc::new(HybridClock::new());
        let sender = Arc::new(LoopbackSender::default());
        let membership = Arc::new(Membership::default());

        let lock_manager = Arc::new(LockManager::new(
            tx_config.lock_wait_timeout,
            tx_config.abandoned_check_interval,
        ));
        let tx_manager = Arc::new(TxManager::new(
            node.clone(),
            clock.clone(),
            tx_config,
            sender.clone(),
            Arc::new(LocalPlacement(node.clone())),
            membership.clone(),
        ));

        Self {
            catalog: Arc::new(InMemoryCatalog::new(clock.clone())),
            node,
            clock,
            tx_manager,
            lock_manager,
            sender,
            membership,
            engine,
            _dir: dir,
        }
    }

    pub fn partition(&self, partition: u32) -> PartitionId {
        PartitionId::new(TABLE_ID, partition)
    }

    /// Start a primary replica of partition `partition` and make it reachable.
    pub fn replica(&self, partition: u32) -> Arc<PartitionReplica> {
        self.replica_with(partition, ReplicaConfig::for_testing())
    }

    pub fn replica_with(&self, partition: u32, config: ReplicaConfig) -> Arc<PartitionReplica> {
        let partition_id = self.partition(partition);
        let replica = PartitionReplica::start(ReplicaContext {
            partition_id,
            local_node: self.node.clone(),
            storage: Arc::new(self.engine.partition_storage(partition_id).unwrap()),
            tx_state_storage: Arc::new(self.engine.tx_state_storage(partition_id).unwrap()),
            tx_manager: self.tx_manager.clone(),
            lock_manager: self.lock_manager.clone(),
            catalog: self.catalog.clone(),
            clock: self.clock.clone(),
            config,
        });
        self.sender.register(&replica);
        replica
    }

    /// A bare state machine over partition `partition`.
    pub fn listener(&self, partition: u32) -> ListenerHarness {
        let partition_id = self.partition(partition);
        let storage = Arc::new(self.engine.partition_storage(partition_id).unwrap());
        let tx_state = Arc::new(self.engine.tx_state_storage(partition_id).unwrap());
        let safe_time = Arc::new(SafeTimeTracker::new(HybridTimestamp::MIN));
        let storage_index = Arc::new(StorageIndexTracker::new(0));

        ListenerHarness {
            listener: PartitionListener::new(
                partition_id,
                storage.clone(),
                tx_state.clone(),
                self.tx_manager.clone(),
                self.catalog.clone(),
                self.clock.clone(),
                safe_time.clone(),
                storage_index.clone(),
            ),
            partition_id,
            storage,
            tx_state,
            safe_time,
            storage_index,
        }
    }
}
