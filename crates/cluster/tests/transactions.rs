mod common;

use common::{row, start, start_with};
use shardline_cluster::ClusterError;
use shardline_common::{NodeId, RowId, TxState};
use shardline_partition::{ReplicaConfig, ReplicaError};
use shardline_tx::TxConfig;
use std::time::Duration;

#[tokio::test]
async fn test_distributed_commit_is_visible_at_commit_timestamp() {
    let c = start(2, 2);
    let (p0, p1) = (c.partition(0), c.partition(1));
    let (r0, r1) = (RowId::new(0), RowId::new(1));

    let mut tx = c.begin(&NodeId::new("node-1")).unwrap();
    tx.upsert(p0, r0, row("a")).await.unwrap();
    tx.upsert(p1, r1, row("b")).await.unwrap();
    assert_eq!(tx.commit_partition(), Some(p0));
    assert_eq!(tx.get(p1, r1).await.unwrap(), row("b"));

    let tx_id = tx.id();
    let result = tx.commit().await.unwrap();
    assert_eq!(result.state, TxState::Committed);
    let commit_ts = result.commit_timestamp.unwrap();

    assert_eq!(c.network().count("finish_tx"), 1);
    assert_eq!(c.network().count("write_intent_switch"), 2);

    let stored = c.primary(p0).unwrap().tx_state_storage().get(tx_id).unwrap().unwrap();
    assert_eq!(stored.enlisted_partitions, vec![p0, p1]);
    assert!(c.primary(p1).unwrap().tx_state_storage().get(tx_id).unwrap().is_none());

    assert_eq!(c.read_only(p0, r0, commit_ts).await.unwrap(), row("a"));
    assert_eq!(c.read_only(p1, r1, commit_ts).await.unwrap(), row("b"));
    assert_eq!(c.read_only(p1, r1, commit_ts.sub_one()).await.unwrap(), None);

    for node in 1..=2 {
        let node = c.node_at(node).unwrap();
        assert!(node.lock_manager().locks_held_by(tx_id).is_empty());
        assert_eq!(node.tx_manager().state_meta(tx_id).unwrap().state, TxState::Committed);
    }
}

#[tokio::test]
async fn test_rollback_discards_writes_and_releases_locks() {
    let c = start(2, 2);
    let p1 = c.partition(1);
    let row_id = RowId::new(1);
    let node = NodeId::new("node-1");

    let mut tx = c.begin(&node).unwrap();
    tx.upsert(p1, row_id, row("gone")).await.unwrap();
    let result = tx.rollback().await.unwrap();
    assert_eq!(result.state, TxState::Aborted);

    // Not blocked by the aborted writer
    let mut next = c.begin(&node).unwrap();
    next.upsert(p1, row_id, row("kept")).await.unwrap();
    let committed = next.commit().await.unwrap();

    let read_ts = committed.commit_timestamp.unwrap();
    assert_eq!(c.read_only(p1, row_id, read_ts).await.unwrap(), row("kept"));
    assert_eq!(c.read_only(p1, row_id, read_ts.sub_one()).await.unwrap(), None);
}

#[tokio::test]
async fn test_transaction_without_writes_finishes_locally() {
    let c = start(1, 1);
    let tx = c.begin(&NodeId::new("node-1")).unwrap();

    let result = tx.commit().await.unwrap();
    assert_eq!(result.state, TxState::Committed);
    assert_eq!(c.network().count("finish_tx"), 0);
}

#[tokio::test]
async fn test_one_phase_write() {
    let c = start(2, 2);
    let p1 = c.partition(1);
    let rows = vec![(RowId::new(1), row("x")), (RowId::new(1), None)];

    c.upsert_one_phase(&NodeId::new("node-1"), p1, rows.clone())
        .await
        .unwrap();

    assert_eq!(c.network().count("finish_tx"), 0);
    let read_ts = c.primary(p1).unwrap().safe_time();
    for (row_id, value) in rows {
        assert_eq!(c.read_only(p1, row_id, read_ts).await.unwrap(), value);
    }
}

#[tokio::test]
async fn test_replayed_log_changes_nothing() {
    let c = start(2, 2);
    let (p0, p1) = (c.partition(0), c.partition(1));
    let (r0, r1) = (RowId::new(0), RowId::new(1));

    let mut tx = c.begin(&NodeId::new("node-2")).unwrap();
    tx.upsert(p0, r0, row("a")).await.unwrap();
    tx.upsert(p1, r1, row("b")).await.unwrap();
    let tx_id = tx.id();
    let commit_ts = tx.commit().await.unwrap().commit_timestamp.unwrap();

    for partition in [p0, p1] {
        let replica = c.primary(partition).unwrap();
        let applied = replica.storage().last_applied();
        let tx_applied = replica.tx_state_storage().last_applied();

        assert!(replica.group().replay(1).await.unwrap() > 0);

        assert_eq!(replica.storage().last_applied(), applied);
        assert_eq!(replica.tx_state_storage().last_applied(), tx_applied);
    }

    let stored = c.primary(p0).unwrap().tx_state_storage().get(tx_id).unwrap().unwrap();
    assert_eq!(stored.commit_timestamp, Some(commit_ts));
    assert_eq!(c.read_only(p0, r0, commit_ts).await.unwrap(), row("a"));
    assert_eq!(c.read_only(p1, r1, commit_ts).await.unwrap(), row("b"));
}

#[tokio::test]
async fn test_idle_safe_time_propagation_unblocks_readers() {
    let c = start_with(1, 1, |config| {
        config.with_replica(
            ReplicaConfig::for_testing().with_idle_safe_time_propagation_period(Duration::from_millis(20)),
        )
    });
    let p0 = c.partition(0);

    let read_ts = c.now();
    assert_eq!(c.read_only(p0, RowId::new(0), read_ts).await.unwrap(), None);
    assert!(c.primary(p0).unwrap().safe_time() >= read_ts);
}

#[tokio::test]
async fn test_reader_times_out_without_safe_time_progress() {
    let c = start(1, 1);
    let p0 = c.partition(0);

    let err = c.read_only(p0, RowId::new(0), c.now()).await.unwrap_err();
    assert!(matches!(err, ClusterError::Replica(ReplicaError::SafeTimeTimeout(_))));
}

#[tokio::test]
async fn test_partition_of_killed_node_has_no_primary() {
    let c = start(2, 2);
    let p1 = c.partition(1);
    c.kill(&NodeId::new("node-2")).await.unwrap();

    let mut tx = c.begin(&NodeId::new("node-1")).unwrap();
    let err = tx.upsert(p1, RowId::new(1), row("v")).await.unwrap_err();
    assert!(matches!(err, ClusterError::NoPrimary(p) if p == p1));
    assert!(matches!(c.node_at(2), Err(ClusterError::UnknownNode(_))));
}

#[tokio::test]
async fn test_nodes_forget_finished_transactions_after_ttl() {
    let c = start_with(2, 2, |config| {
        config.with_tx(TxConfig::for_testing().with_finished_state_ttl(Duration::from_millis(50)))
    });
    let (p0, p1) = (c.partition(0), c.partition(1));
    let (r0, r1) = (RowId::new(0), RowId::new(1));

    let mut tx = c.begin(&NodeId::new("node-1")).unwrap();
    tx.upsert(p0, r0, row("a")).await.unwrap();
    tx.upsert(p1, r1, row("b")).await.unwrap();
    let tx_id = tx.id();
    let commit_ts = tx.commit().await.unwrap().commit_timestamp.unwrap();

    let forgotten = async {
        loop {
            let known = (1..=2).any(|n| c.node_at(n).unwrap().tx_manager().state_meta(tx_id).is_some());
            if !known {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), forgotten).await.unwrap();

    // The outcome stays durable on the commit partition
    assert_eq!(
        c.primary(p0).unwrap().tx_state_storage().get(tx_id).unwrap().unwrap().state,
        TxState::Committed
    );
    assert_eq!(c.read_only(p0, r0, commit_ts).await.unwrap(), row("a"));
    assert_eq!(c.read_only(p1, r1, commit_ts).await.unwrap(), row("b"));
}
