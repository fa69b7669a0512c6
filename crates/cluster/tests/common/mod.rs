#![allow(dead_code)]

use shardline_cluster::{LocalCluster, NodeConfig};
use shardline_common::BinaryRow;
use std::path::PathBuf;
use tempfile::TempDir;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn row(value: &str) -> Option<BinaryRow> {
    Some(BinaryRow::from_value(value))
}

pub struct TestCluster {
    pub cluster: LocalCluster,
    _dir: TempDir,
}

impl std::ops::Deref for TestCluster {
    type Target = LocalCluster;

    fn deref(&self) -> &LocalCluster {
        &self.cluster
    }
}

pub fn start(nodes: usize, partitions: u32) -> TestCluster {
    start_with(nodes, partitions, |config| config)
}

pub fn start_with(
    nodes: usize,
    partitions: u32,
    configure: impl FnOnce(NodeConfig) -> NodeConfig,
) -> TestCluster {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = configure(NodeConfig::for_testing(PathBuf::from(dir.path())));
    TestCluster {
        cluster: LocalCluster::start(config, nodes, partitions).unwrap(),
        _dir: dir,
    }
}
