//! Secondary index maintenance
//!
//! Index entries point at row ids and are never versioned: an entry exists as long as
//! some version of the row (committed or intent) has that key. Readers re-check the
//! row they land on.

use crate::catalog::IndexDescriptor;
use shardline_common::{BinaryRow, RowId};
use shardline_hlc::HybridTimestamp;
use shardline_mvcc::{PartitionWriteBatch, Result, RowVersion};

/// Add `row` to every index in `indexes`.
pub fn add_to_indexes(
    batch: &mut PartitionWriteBatch<'_>,
    row_id: &RowId,
    row: Option<&BinaryRow>,
    indexes: &[IndexDescriptor],
) {
    let Some(row) = row else {
        return;
    };

    for index in indexes {
        if let Some(key) = index.index_key(row) {
            batch.put_index(index.id, &key, row_id);
        }
    }
}

/// Remove the entries of a discarded row version, unless a version that stays still
/// has the same key.
///
/// `kept` holds the rows that survive the change in the batch, besides the committed
/// versions already persisted.
pub fn try_remove_from_indexes(
    batch: &mut PartitionWriteBatch<'_>,
    row_id: &RowId,
    removed: Option<&BinaryRow>,
    kept: &[&BinaryRow],
    indexes: &[IndexDescriptor],
) -> Result<()> {
    let Some(removed) = removed else {
        return Ok(());
    };
    if indexes.is_empty() {
        return Ok(());
    }

    let committed: Vec<BinaryRow> = batch
        .scan_versions(row_id)?
        .into_iter()
        .filter_map(|version| match version {
            RowVersion::Committed(version) => version.row,
            RowVersion::Intent(_) => None,
        })
        .collect();

    for index in indexes {
        let Some(key) = index.index_key(removed) else {
            continue;
        };

        let still_referenced = kept
            .iter()
            .copied()
            .chain(committed.iter())
            .any(|row| index.index_key(row).as_ref() == Some(&key));

        if !still_referenced {
            batch.remove_index(index.id, &key, row_id);
        }
    }

    Ok(())
}

/// Picks the row versions an index build must add for one row.
///
/// Writes newer than the index are indexed by the writers themselves, so a build only
/// covers what existed before:
/// - a write intent of a transaction that began before the index was created
/// - the newest committed version older than the start of the build
#[derive(Debug, Clone, Copy)]
pub struct BuildIndexRowVersionChooser {
    create_index_activation_ts: HybridTimestamp,
    start_building_activation_ts: HybridTimestamp,
}

impl BuildIndexRowVersionChooser {
    pub fn new(
        create_index_activation_ts: HybridTimestamp,
        start_building_activation_ts: HybridTimestamp,
    ) -> Self {
        Self {
            create_index_activation_ts,
            start_building_activation_ts,
        }
    }

    /// Rows to index out of a version chain ordered newest first.
    pub fn choose(&self, versions: &[RowVersion]) -> Vec<BinaryRow> {
        let mut chosen = Vec::new();

        for version in versions {
            match version {
                RowVersion::Intent(intent) => {
                    let began = intent.tx_id.begin_timestamp();
                    if began < self.create_index_activation_ts {
                        chosen.extend(intent.row.clone());
                    }
                }
                RowVersion::Committed(committed) => {
                    if committed.commit_ts >= self.start_building_activation_ts {
                        continue;
                    }
                    chosen.extend(committed.row.clone());
                    break;
                }
            }
        }

        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_common::{PartitionId, TransactionId};
    use shardline_mvcc::{CommittedVersion, WriteIntent};

    fn ts(physical: u64) -> HybridTimestamp {
        HybridTimestamp::new(physical, 0)
    }

    fn committed(at: u64, value: Option<&str>) -> RowVersion {
        RowVersion::Committed(CommittedVersion {
            commit_ts: ts(at),
            row: value.map(BinaryRow::from_value),
        })
    }

    fn intent(began: u64, value: &str) -> RowVersion {
        RowVersion::Intent(WriteIntent {
            tx_id: TransactionId::new(ts(began)),
            commit_partition: PartitionId::new(1, 0),
            row: Some(BinaryRow::from_value(value)),
        })
    }

    #[test]
    fn test_newest_committed_before_build_start() {
        let chooser = BuildIndexRowVersionChooser::new(ts(100), ts(200));

        let versions = vec![committed(250, Some("new")), committed(150, Some("mid")), committed(50, Some("old"))];
        assert_eq!(chooser.choose(&versions), vec![BinaryRow::from_value("mid")]);
    }

    #[test]
    fn test_tombstone_is_not_indexed() {
        let chooser = BuildIndexRowVersionChooser::new(ts(100), ts(200));

        let versions = vec![committed(150, None), committed(50, Some("old"))];
        assert!(chooser.choose(&versions).is_empty());
    }

    #[test]
    fn test_intents_by_transaction_begin() {
        let chooser = BuildIndexRowVersionChooser::new(ts(100), ts(200));

        let old_tx = vec![intent(90, "pending"), committed(50, Some("old"))];
        assert_eq!(
            chooser.choose(&old_tx),
            vec![BinaryRow::from_value("pending"), BinaryRow::from_value("old")]
        );

        let new_tx = vec![intent(120, "pending"), committed(50, Some("old"))];
        assert_eq!(chooser.choose(&new_tx), vec![BinaryRow::from_value("old")]);
    }
}
