mod common;

use common::{Fixture, ListenerHarness, TABLE_ID, ts, tx_at};
use shardline_common::{BinaryRow, NodeId, PartitionId, RowId, TransactionId, TransactionResult, TxState};
use shardline_hlc::HybridTimestamp;
use shardline_mvcc::AppliedPosition;
use shardline_partition::{
    BuildIndexCommand, CatalogService, Command, CommandError, CommandResponse, FatalError,
    FinishTxCommand, IndexDescriptor, SafeTimeSyncCommand, UpdateAllCommand, UpdateCommand,
    WriteIntentSwitchCommand,
};
use std::time::Duration;

fn update(
    h: &ListenerHarness,
    tx_id: TransactionId,
    row_id: RowId,
    value: &str,
    full: bool,
    safe_time: HybridTimestamp,
) -> Command {
    Command::Update(UpdateCommand {
        tx_id,
        commit_partition: h.partition_id,
        row_id,
        row: Some(BinaryRow::from_value(value)),
        full,
        tx_coordinator_id: Some(NodeId::new("node-1")),
        safe_time,
    })
}

fn finish(tx_id: TransactionId, commit_ts: Option<HybridTimestamp>, partitions: Vec<PartitionId>, safe_time: HybridTimestamp) -> Command {
    Command::FinishTx(FinishTxCommand {
        tx_id,
        commit: commit_ts.is_some(),
        commit_timestamp: commit_ts,
        partitions,
        safe_time,
    })
}

fn switch(tx_id: TransactionId, commit_ts: Option<HybridTimestamp>, safe_time: HybridTimestamp) -> Command {
    Command::WriteIntentSwitch(WriteIntentSwitchCommand {
        tx_id,
        commit: commit_ts.is_some(),
        commit_timestamp: commit_ts,
        safe_time,
    })
}

fn sync(safe_time: HybridTimestamp) -> Command {
    Command::SafeTimeSync(SafeTimeSyncCommand { safe_time })
}

#[tokio::test]
async fn test_two_phase_write_finish_and_switch() {
    let f = Fixture::new();
    let h = f.listener(0);
    let t1 = tx_at(10);
    let r1 = RowId::new(0);

    let result = h.listener.apply(update(&h, t1, r1, "v1", false, ts(50)), 5, 1).unwrap();
    assert_eq!(result, Ok(CommandResponse::Applied));
    assert_eq!(h.storage.write_intent(&r1).unwrap().unwrap().tx_id, t1);
    assert_eq!(h.storage.last_applied(), AppliedPosition::new(5, 1));
    // Intents do not move safe time
    assert_eq!(h.safe_time.current(), HybridTimestamp::MIN);
    assert_eq!(f.tx_manager.state_meta(t1).unwrap().state, TxState::Pending);

    let reader = {
        let safe_time = h.safe_time.clone();
        tokio::spawn(async move { safe_time.wait_for(ts(150)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!reader.is_finished());

    let result = h
        .listener
        .apply(finish(t1, Some(ts(100)), vec![h.partition_id], ts(100)), 6, 1)
        .unwrap();
    assert_eq!(result, Ok(CommandResponse::TxResult(TransactionResult::committed(ts(100)))));
    assert_eq!(h.tx_state.get(t1).unwrap().unwrap().state, TxState::Committed);
    assert_eq!(h.tx_state.last_applied(), AppliedPosition::new(6, 1));

    let result = h.listener.apply(switch(t1, Some(ts(100)), ts(150)), 7, 1).unwrap();
    assert_eq!(result, Ok(CommandResponse::Applied));

    let read = h.storage.read(&r1, ts(150)).unwrap();
    assert!(read.write_intent.is_none());
    assert_eq!(read.committed.as_ref().unwrap().commit_ts, ts(100));
    assert_eq!(read.committed_row(), Some(&BinaryRow::from_value("v1")));
    assert!(h.storage.read(&r1, ts(99)).unwrap().is_empty());

    assert_eq!(reader.await.unwrap(), Ok(()));
    assert_eq!(h.storage_index.current(), 7);
    assert_eq!(f.tx_manager.state_meta(t1).unwrap().state, TxState::Committed);
}

#[tokio::test]
async fn test_replayed_commands_change_nothing() {
    let f = Fixture::new();
    let h = f.listener(0);
    let t1 = tx_at(10);
    let r1 = RowId::new(0);

    h.listener.apply(update(&h, t1, r1, "v1", false, ts(50)), 5, 1).unwrap().unwrap();
    h.listener
        .apply(finish(t1, Some(ts(100)), vec![h.partition_id], ts(100)), 6, 1)
        .unwrap()
        .unwrap();

    // Same command again, and a different one at an already applied index
    assert_eq!(
        h.listener.apply(update(&h, t1, r1, "v1", false, ts(50)), 5, 1).unwrap(),
        Ok(CommandResponse::AlreadyApplied)
    );
    let r2 = RowId::new(0);
    assert_eq!(
        h.listener.apply(update(&h, t1, r2, "v2", false, ts(60)), 4, 1).unwrap(),
        Ok(CommandResponse::AlreadyApplied)
    );
    assert_eq!(
        h.listener.apply(finish(t1, None, vec![], ts(120)), 6, 1).unwrap(),
        Ok(CommandResponse::AlreadyApplied)
    );

    assert_eq!(h.storage.last_applied(), AppliedPosition::new(5, 1));
    assert_eq!(h.tx_state.last_applied(), AppliedPosition::new(6, 1));
    assert!(h.storage.write_intent(&r2).unwrap().is_none());
    assert_eq!(h.tx_state.get(t1).unwrap().unwrap().state, TxState::Committed);
}

#[tokio::test]
async fn test_replay_of_every_command_kind_changes_nothing() {
    let f = Fixture::new();
    let h = f.listener(0);
    let key = |value: &str| IndexDescriptor::key_of(&[value.as_bytes()]);
    let (r1, r2, r3) = (RowId::new(0), RowId::new(0), RowId::new(0));
    let t1 = tx_at(10);

    let index_id = f.catalog.create_index(TABLE_ID, "by_value", vec![0]);
    let required = f.catalog.start_building(index_id).unwrap();
    let creation = f.catalog.catalog(required).unwrap().index(index_id).unwrap().creation_catalog_version;
    let build = |row_ids: Vec<RowId>, finish: bool| {
        Command::BuildIndex(BuildIndexCommand {
            index_id,
            row_ids,
            finish,
            creation_catalog_version: creation,
            required_catalog_version: required,
        })
    };
    let update_all = |rows: Vec<(RowId, &str)>, safe_time| {
        Command::UpdateAll(UpdateAllCommand {
            tx_id: t1,
            commit_partition: h.partition_id,
            rows: rows
                .into_iter()
                .map(|(row_id, value)| (row_id, Some(BinaryRow::from_value(value))))
                .collect(),
            full: false,
            tx_coordinator_id: Some(NodeId::new("node-1")),
            safe_time,
        })
    };

    h.listener.apply(update_all(vec![(r1, "a"), (r2, "b")], ts(50)), 1, 1).unwrap().unwrap();
    h.listener
        .apply(finish(t1, Some(ts(100)), vec![h.partition_id], ts(100)), 2, 1)
        .unwrap()
        .unwrap();
    h.listener.apply(switch(t1, Some(ts(100)), ts(110)), 3, 1).unwrap().unwrap();
    h.listener.apply(sync(ts(120)), 4, 1).unwrap().unwrap();
    h.listener.apply(build(vec![r1, r2], true), 5, 1).unwrap().unwrap();

    assert_eq!(h.storage.index_lookup(index_id, &key("a")).unwrap(), vec![r1]);
    assert_eq!(h.storage.next_row_id_to_build(index_id).unwrap(), None);

    let replays = [
        (update_all(vec![(r3, "c")], ts(130)), 1),
        (finish(t1, None, vec![h.partition_id], ts(130)), 2),
        (switch(t1, None, ts(130)), 3),
        (sync(ts(500)), 4),
        (build(vec![r3], false), 5),
    ];
    for (command, index) in replays {
        let name = command.name();
        assert_eq!(
            h.listener.apply(command, index, 1).unwrap(),
            Ok(CommandResponse::AlreadyApplied),
            "{name} at {index}"
        );
    }

    assert_eq!(h.storage.last_applied(), AppliedPosition::new(5, 1));
    assert_eq!(h.tx_state.last_applied(), AppliedPosition::new(2, 1));
    assert_eq!(h.safe_time.current(), ts(120));
    assert_eq!(h.storage_index.current(), 5);

    assert!(h.storage.write_intent(&r3).unwrap().is_none());
    assert_eq!(h.tx_state.get(t1).unwrap().unwrap().state, TxState::Committed);
    for (row_id, value) in [(r1, "a"), (r2, "b")] {
        let read = h.storage.read(&row_id, ts(120)).unwrap();
        assert!(read.write_intent.is_none());
        assert_eq!(read.committed_row(), Some(&BinaryRow::from_value(value)));
    }

    // The finished build keeps its completion marker and its entries
    assert_eq!(h.storage.next_row_id_to_build(index_id).unwrap(), None);
    assert_eq!(h.storage.index_lookup(index_id, &key("a")).unwrap(), vec![r1]);
    assert_eq!(h.storage.index_lookup(index_id, &key("b")).unwrap(), vec![r2]);
    assert!(h.storage.index_lookup(index_id, &key("c")).unwrap().is_empty());
}

#[tokio::test]
async fn test_opposite_finish_reports_mismatching_outcome() {
    let f = Fixture::new();
    let h = f.listener(0);
    let t1 = tx_at(10);
    let committed = TransactionResult::committed(ts(100));

    assert_eq!(
        h.listener.apply(finish(t1, Some(ts(100)), vec![h.partition_id], ts(100)), 1, 1).unwrap(),
        Ok(CommandResponse::TxResult(committed))
    );

    assert_eq!(
        h.listener.apply(finish(t1, None, vec![h.partition_id], ts(110)), 2, 1).unwrap(),
        Err(CommandError::MismatchingOutcome {
            tx_id: t1,
            stored: committed,
            requested: TransactionResult::aborted(),
        })
    );
    assert_eq!(h.tx_state.get(t1).unwrap().unwrap().result(), committed);
    assert_eq!(h.tx_state.last_applied(), AppliedPosition::new(2, 1));

    // Finishing again the same way is not an error
    assert_eq!(
        h.listener.apply(finish(t1, Some(ts(100)), vec![h.partition_id], ts(120)), 3, 1).unwrap(),
        Ok(CommandResponse::TxResult(committed))
    );
}

#[tokio::test]
async fn test_safe_time_sync_unblocks_readers() {
    let f = Fixture::new();
    let h = f.listener(0);

    let reader = {
        let safe_time = h.safe_time.clone();
        tokio::spawn(async move { safe_time.wait_for(ts(90)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!reader.is_finished());

    assert_eq!(h.listener.apply(sync(ts(100)), 9, 1).unwrap(), Ok(CommandResponse::Applied));

    assert_eq!(reader.await.unwrap(), Ok(()));
    assert_eq!(h.safe_time.current(), ts(100));
    assert_eq!(h.storage.last_applied(), AppliedPosition::new(9, 1));
    assert!(h.storage.row_ids_from(&RowId::lowest(0), 10).unwrap().is_empty());
}

#[tokio::test]
async fn test_reordered_safe_time_is_rejected() {
    let f = Fixture::new();
    let h = f.listener(0);
    let row_id = RowId::new(0);

    h.listener.apply(sync(ts(100)), 1, 1).unwrap().unwrap();

    let result = h.listener.apply(update(&h, tx_at(40), row_id, "late", true, ts(50)), 2, 1).unwrap();
    assert_eq!(
        result,
        Err(CommandError::SafeTimeReorder {
            proposed: ts(50),
            max_observed: ts(100),
        })
    );

    // Nothing written, but the position moved on
    assert!(h.storage.read(&row_id, HybridTimestamp::MAX).unwrap().is_empty());
    assert_eq!(h.storage.last_applied(), AppliedPosition::new(2, 1));
    assert_eq!(h.safe_time.current(), ts(100));

    // Equal safe time is accepted
    assert_eq!(h.listener.apply(sync(ts(100)), 3, 1).unwrap(), Ok(CommandResponse::Applied));
}

#[tokio::test]
async fn test_speculative_reorder_check() {
    let f = Fixture::new();
    let h = f.listener(0);

    h.listener.before_apply(&sync(ts(10))).unwrap();
    assert!(matches!(
        h.listener.before_apply(&sync(ts(5))),
        Err(CommandError::SafeTimeReorder { .. })
    ));
    h.listener.before_apply(&sync(ts(10))).unwrap();

    // A new leader cannot trust safe times within the clock skew of its clock
    h.listener.on_leader_start();
    assert!(h.listener.before_apply(&sync(f.clock.now())).is_err());

    let build = Command::BuildIndex(BuildIndexCommand {
        index_id: 1,
        row_ids: vec![],
        finish: true,
        creation_catalog_version: 0,
        required_catalog_version: 0,
    });
    h.listener.before_apply(&build).unwrap();
}

#[tokio::test]
async fn test_one_phase_update_commits_and_advances_safe_time() {
    let f = Fixture::new();
    let h = f.listener(0);
    let tx_id = tx_at(20);
    let rows = vec![
        (RowId::new(0), Some(BinaryRow::from_value("a"))),
        (RowId::new(0), Some(BinaryRow::from_value("b"))),
    ];

    let command = Command::UpdateAll(UpdateAllCommand {
        tx_id,
        commit_partition: h.partition_id,
        rows: rows.clone(),
        full: true,
        tx_coordinator_id: None,
        safe_time: ts(30),
    });
    assert_eq!(h.listener.apply(command, 1, 1).unwrap(), Ok(CommandResponse::Applied));

    for (row_id, row) in &rows {
        let read = h.storage.read(row_id, ts(30)).unwrap();
        assert!(read.write_intent.is_none());
        assert_eq!(read.committed_row(), row.as_ref());
    }
    assert_eq!(h.safe_time.current(), ts(30));
    assert_eq!(
        f.tx_manager.state_meta(tx_id).unwrap().result(),
        Some(TransactionResult::committed(ts(30)))
    );
}

#[tokio::test]
async fn test_write_conflict_is_a_command_error() {
    let f = Fixture::new();
    let h = f.listener(0);
    let row_id = RowId::new(0);
    let owner = tx_at(10);

    h.listener.apply(update(&h, owner, row_id, "mine", false, ts(20)), 1, 1).unwrap().unwrap();

    let result = h
        .listener
        .apply(update(&h, tx_at(11), row_id, "theirs", false, ts(30)), 2, 1)
        .unwrap();
    assert!(matches!(result, Err(CommandError::WriteConflict(_))));

    assert_eq!(h.storage.write_intent(&row_id).unwrap().unwrap().tx_id, owner);
    assert_eq!(h.storage.last_applied(), AppliedPosition::new(2, 1));
}

#[tokio::test]
async fn test_commit_switch_without_timestamp_is_invalid() {
    let f = Fixture::new();
    let h = f.listener(0);

    let command = Command::WriteIntentSwitch(WriteIntentSwitchCommand {
        tx_id: tx_at(1),
        commit: true,
        commit_timestamp: None,
        safe_time: ts(5),
    });
    assert!(matches!(h.listener.apply(command, 1, 1).unwrap(), Err(CommandError::Invalid(_))));
    assert_eq!(h.storage.last_applied(), AppliedPosition::new(1, 1));
}

#[tokio::test]
async fn test_undecodable_entry_is_fatal() {
    let f = Fixture::new();
    let h = f.listener(0);

    match h.listener.apply_raw(&[0xff, 0x13, 0x37], 1, 1) {
        Err(FatalError::Decode { index, .. }) => assert_eq!(index, 1),
        other => panic!("unexpected {other:?}"),
    }

    let bytes = sync(ts(10)).encode().unwrap();
    assert_eq!(h.listener.apply_raw(&bytes, 1, 1).unwrap(), Ok(CommandResponse::Applied));
}

#[tokio::test]
async fn test_snapshot_advertises_max_and_restart_uses_min() {
    let f = Fixture::new();
    let h = f.listener(0);
    let t1 = tx_at(10);

    h.listener.apply(update(&h, t1, RowId::new(0), "v", false, ts(20)), 1, 1).unwrap().unwrap();
    h.listener
        .apply(finish(t1, None, vec![h.partition_id], ts(30)), 2, 1)
        .unwrap()
        .unwrap();

    assert_eq!(h.listener.recovery_point(), AppliedPosition::new(1, 1));
    assert_eq!(h.listener.advertised_applied(), AppliedPosition::new(2, 1));

    assert_eq!(h.listener.on_snapshot_save().unwrap(), AppliedPosition::new(2, 1));
    assert_eq!(h.storage.last_applied(), AppliedPosition::new(2, 1));
    assert_eq!(h.tx_state.last_applied(), AppliedPosition::new(2, 1));
    assert_eq!(h.listener.recovery_point(), AppliedPosition::new(2, 1));
}

#[tokio::test]
async fn test_build_index_chooses_versions_and_resumes() {
    let f = Fixture::new();
    let h = f.listener(0);
    let key = |value: &str| IndexDescriptor::key_of(&[value.as_bytes()]);

    // Written before the index existed
    let old_row = RowId::new(0);
    let old_tx = TransactionId::new(f.clock.now());
    h.listener.apply(update(&h, old_tx, old_row, "a", true, f.clock.now()), 1, 1).unwrap().unwrap();

    let index_id = f.catalog.create_index(TABLE_ID, "by_value", vec![0]);
    let required = f.catalog.start_building(index_id).unwrap();
    let creation = f.catalog.catalog(required).unwrap().index(index_id).unwrap().creation_catalog_version;

    // Written after: the writer maintains the index itself
    let new_row = RowId::new(0);
    let new_tx = TransactionId::new(f.clock.now());
    h.listener.apply(update(&h, new_tx, new_row, "b", true, f.clock.now()), 2, 1).unwrap().unwrap();

    assert!(h.storage.index_lookup(index_id, &key("a")).unwrap().is_empty());
    assert_eq!(h.storage.index_lookup(index_id, &key("b")).unwrap(), vec![new_row]);
    assert_eq!(h.storage.next_row_id_to_build(index_id).unwrap(), Some(RowId::lowest(0)));

    let batch = Command::BuildIndex(BuildIndexCommand {
        index_id,
        row_ids: vec![new_row, old_row],
        finish: false,
        creation_catalog_version: creation,
        required_catalog_version: required,
    });
    assert_eq!(h.listener.apply(batch, 3, 1).unwrap(), Ok(CommandResponse::Applied));

    assert_eq!(h.storage.index_lookup(index_id, &key("a")).unwrap(), vec![old_row]);
    assert_eq!(
        h.storage.next_row_id_to_build(index_id).unwrap(),
        Some(old_row.max(new_row).increment().unwrap())
    );

    let last = Command::BuildIndex(BuildIndexCommand {
        index_id,
        row_ids: vec![],
        finish: true,
        creation_catalog_version: creation,
        required_catalog_version: required,
    });
    h.listener.apply(last, 4, 1).unwrap().unwrap();
    assert_eq!(h.storage.next_row_id_to_build(index_id).unwrap(), None);
    assert_eq!(h.storage.last_applied(), AppliedPosition::new(4, 1));
}

#[tokio::test]
async fn test_build_batch_ending_at_greatest_row_id_completes() {
    let f = Fixture::new();
    let h = f.listener(0);

    let index_id = f.catalog.create_index(TABLE_ID, "by_value", vec![0]);
    let required = f.catalog.start_building(index_id).unwrap();
    let creation = f.catalog.catalog(required).unwrap().index(index_id).unwrap().creation_catalog_version;

    let greatest = RowId::from_bytes(0, [0xff; 16]);
    let batch = Command::BuildIndex(BuildIndexCommand {
        index_id,
        row_ids: vec![greatest],
        finish: false,
        creation_catalog_version: creation,
        required_catalog_version: required,
    });
    assert_eq!(h.listener.apply(batch, 1, 1).unwrap(), Ok(CommandResponse::Applied));

    // No row can follow, so there is nothing left to build
    assert_eq!(h.storage.next_row_id_to_build(index_id).unwrap(), None);
    assert_eq!(h.storage.last_applied(), AppliedPosition::new(1, 1));
}

#[tokio::test]
async fn test_stopped_state_machine_rejects_commands() {
    let f = Fixture::new();
    let h = f.listener(0);
    let waiter = {
        let safe_time = h.safe_time.clone();
        tokio::spawn(async move { safe_time.wait_for(ts(1_000)).await })
    };

    h.listener.on_shutdown();

    assert_eq!(h.listener.apply(sync(ts(10)), 1, 1), Err(FatalError::Stopped));
    assert!(waiter.await.unwrap().is_err());
    assert!(h.storage_index.is_closed());
}
