//! Multi-version partition storage
//!
//! One [`MvPartitionStorage`] holds every row version of a single table partition:
//! - committed versions keyed by row and inverted commit timestamp (newest first)
//! - at most one write intent per row, plus a reverse index by owning transaction
//! - secondary index entries
//! - metadata: the applied log position and index build cursors
//!
//! All mutations go through [`MvPartitionStorage::run_consistently`], which commits
//! them together with the applied position in a single fjall batch.

use crate::config::StorageConfig;
use crate::encoding::{
    AppliedPosition, Decode, decode_version_key, fixed, from_cbor, index_prefix, version_key,
};
use crate::error::Result;
use crate::row_version::{CommittedVersion, ReadResult, RowVersion, WriteIntent};
use crate::write_batch::PartitionWriteBatch;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use shardline_common::{BinaryRow, PartitionId, RowId, TransactionId};
use shardline_hlc::HybridTimestamp;
use std::collections::BTreeSet;

pub(crate) const LAST_APPLIED_KEY: &[u8] = b"last_applied";
pub(crate) const INDEX_BUILD_PREFIX: &[u8] = b"index_build:";

/// Logical areas of a partition storage, each backed by a fjall partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum Area {
    Rows,
    Intents,
    TxRows,
    Index,
    Meta,
}

/// Multi-version storage of one table partition.
pub struct MvPartitionStorage {
    partition_id: PartitionId,
    keyspace: Keyspace,

    rows: PartitionHandle,
    intents: PartitionHandle,
    tx_rows: PartitionHandle,
    index: PartitionHandle,
    meta: PartitionHandle,

    /// Striped row locks, held exclusively by a write batch until it commits
    row_locks: Vec<RwLock<()>>,

    /// Held shared by the apply path, exclusively while a snapshot is taken
    snapshot_lock: RwLock<()>,

    /// Cached applied position, updated after each batch commit
    applied: Mutex<AppliedPosition>,

    persist_mode: fjall::PersistMode,
}

impl MvPartitionStorage {
    pub(crate) fn open(
        keyspace: Keyspace,
        partition_id: PartitionId,
        config: &StorageConfig,
    ) -> Result<Self> {
        let name = partition_id.storage_name();

        let data_options = || {
            PartitionCreateOptions::default()
                .block_size(32 * 1024)
                .compression(config.compression)
        };

        let rows = keyspace.open_partition(&format!("{}_rows", name), data_options())?;
        let intents = keyspace.open_partition(&format!("{}_intents", name), data_options())?;
        let tx_rows = keyspace.open_partition(&format!("{}_tx_rows", name), data_options())?;
        let index = keyspace.open_partition(&format!("{}_index", name), data_options())?;
        let meta = keyspace.open_partition(
            &format!("{}_meta", name),
            PartitionCreateOptions::default()
                .block_size(16 * 1024)
                .compression(fjall::CompressionType::None),
        )?;

        // Restore the applied position
        let applied = match meta.get(LAST_APPLIED_KEY)? {
            Some(bytes) => AppliedPosition::decode(&bytes)?,
            None => AppliedPosition::default(),
        };

        let row_locks = (0..config.row_lock_stripes.max(1))
            .map(|_| RwLock::new(()))
            .collect();

        tracing::debug!(
            "[{}] Opened partition storage, last applied index {}",
            partition_id,
            applied.index
        );

        Ok(Self {
            partition_id,
            keyspace,
            rows,
            intents,
            tx_rows,
            index,
            meta,
            row_locks,
            snapshot_lock: RwLock::new(()),
            applied: Mutex::new(applied),
            persist_mode: config.persist_mode,
        })
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub(crate) fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    pub(crate) fn handle(&self, area: Area) -> &PartitionHandle {
        match area {
            Area::Rows => &self.rows,
            Area::Intents => &self.intents,
            Area::TxRows => &self.tx_rows,
            Area::Index => &self.index,
            Area::Meta => &self.meta,
        }
    }

    pub(crate) fn stripe(&self, row_id: &RowId) -> usize {
        (row_id.uuid().as_u128() % self.row_locks.len() as u128) as usize
    }

    pub(crate) fn row_lock(&self, stripe: usize) -> RwLockWriteGuard<'_, ()> {
        self.row_locks[stripe].write()
    }

    pub(crate) fn set_cached_applied(&self, position: AppliedPosition) {
        *self.applied.lock() = position;
    }

    /// Run `f` against a write batch and commit everything it staged atomically.
    ///
    /// Nothing is written if `f` fails. Row locks taken by the batch are held until
    /// the commit completes.
    pub fn run_consistently<R>(
        &self,
        f: impl FnOnce(&mut PartitionWriteBatch<'_>) -> Result<R>,
    ) -> Result<R> {
        let mut batch = PartitionWriteBatch::new(self);
        let result = f(&mut batch)?;
        batch.commit()?;
        Ok(result)
    }

    /// Shared side of the partition snapshot lock, held while applying commands.
    pub fn acquire_snapshot_read_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.snapshot_lock.read()
    }

    /// Exclusive side of the partition snapshot lock.
    pub fn acquire_snapshot_write_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.snapshot_lock.write()
    }

    /// Last applied log position.
    pub fn last_applied(&self) -> AppliedPosition {
        *self.applied.lock()
    }

    /// Read a row at `read_ts`.
    pub fn read(&self, row_id: &RowId, read_ts: HybridTimestamp) -> Result<ReadResult> {
        let _guard = self.row_locks[self.stripe(row_id)].read();

        Ok(ReadResult {
            row_id: *row_id,
            committed: self.committed_at(row_id, read_ts)?,
            write_intent: self.write_intent(row_id)?,
            newest_commit_ts: self.newest_committed(row_id)?.map(|v| v.commit_ts),
        })
    }

    /// Write intent of a row, if any.
    pub fn write_intent(&self, row_id: &RowId) -> Result<Option<WriteIntent>> {
        self.intents
            .get(row_id.to_bytes())?
            .map(|bytes| from_cbor::<WriteIntent>(&bytes))
            .transpose()
    }

    /// Newest committed version with `commit_ts <= ts`.
    pub fn committed_at(
        &self,
        row_id: &RowId,
        ts: HybridTimestamp,
    ) -> Result<Option<CommittedVersion>> {
        let start = version_key(row_id, ts);
        let end = version_key(row_id, HybridTimestamp::from_u64(0));

        match self.rows.range(start..=end).next() {
            Some(entry) => {
                let (key, value) = entry?;
                Ok(Some(self.decode_version(&key, &value)?))
            }
            None => Ok(None),
        }
    }

    fn newest_committed(&self, row_id: &RowId) -> Result<Option<CommittedVersion>> {
        match self.rows.prefix(row_id.to_bytes()).next() {
            Some(entry) => {
                let (key, value) = entry?;
                Ok(Some(self.decode_version(&key, &value)?))
            }
            None => Ok(None),
        }
    }

    fn decode_version(&self, key: &[u8], value: &[u8]) -> Result<CommittedVersion> {
        let (_, commit_ts) = decode_version_key(self.partition_id.partition, key)?;
        let row: Option<BinaryRow> = from_cbor(value)?;
        Ok(CommittedVersion { commit_ts, row })
    }

    /// Whole version chain of a row, newest first. A write intent comes first.
    pub fn scan_versions(&self, row_id: &RowId) -> Result<Vec<RowVersion>> {
        let _guard = self.row_locks[self.stripe(row_id)].read();
        self.scan_versions_unlocked(row_id)
    }

    /// Same as [`MvPartitionStorage::scan_versions`], for callers already holding the row lock.
    pub(crate) fn scan_versions_unlocked(&self, row_id: &RowId) -> Result<Vec<RowVersion>> {
        let mut versions = Vec::new();
        if let Some(intent) = self.write_intent(row_id)? {
            versions.push(RowVersion::Intent(intent));
        }

        for entry in self.rows.prefix(row_id.to_bytes()) {
            let (key, value) = entry?;
            versions.push(RowVersion::Committed(self.decode_version(&key, &value)?));
        }

        Ok(versions)
    }

    /// Up to `limit` row ids greater than or equal to `from`, in natural order.
    ///
    /// Rows that only have a write intent are included.
    pub fn row_ids_from(&self, from: &RowId, limit: usize) -> Result<Vec<RowId>> {
        let partition = self.partition_id.partition;
        let start = from.to_bytes().to_vec();
        let mut ids = BTreeSet::new();

        for entry in self.rows.range(start.clone()..) {
            let (key, _) = entry?;
            let (row_id, _) = decode_version_key(partition, &key)?;
            if !ids.contains(&row_id) {
                if ids.len() == limit {
                    break;
                }
                ids.insert(row_id);
            }
        }

        for entry in self.intents.range(start..).take(limit) {
            let (key, _) = entry?;
            ids.insert(RowId::from_bytes(partition, fixed::<16>(&key)?));
        }

        Ok(ids.into_iter().take(limit).collect())
    }

    /// Rows holding a write intent of `tx_id`.
    pub fn tx_intent_rows(&self, tx_id: TransactionId) -> Result<Vec<RowId>> {
        let partition = self.partition_id.partition;
        let mut rows = Vec::new();

        for entry in self.tx_rows.prefix(tx_id.to_bytes()) {
            let (key, _) = entry?;
            rows.push(RowId::from_bytes(partition, fixed::<16>(&key[16..])?));
        }

        Ok(rows)
    }

    /// Rows whose entry in `index_id` has exactly `index_key`.
    pub fn index_lookup(&self, index_id: u32, index_key: &[u8]) -> Result<Vec<RowId>> {
        let partition = self.partition_id.partition;
        let prefix = index_prefix(index_id, index_key);
        let mut rows = Vec::new();

        for entry in self.index.prefix(&prefix) {
            let (key, _) = entry?;
            rows.push(RowId::from_bytes(
                partition,
                fixed::<16>(&key[prefix.len()..])?,
            ));
        }

        Ok(rows)
    }

    /// Row id an index build should resume from, or `None` once the build is done.
    pub fn next_row_id_to_build(&self, index_id: u32) -> Result<Option<RowId>> {
        let partition = self.partition_id.partition;

        match self.meta.get(index_build_key(index_id))? {
            None => Ok(Some(RowId::lowest(partition))),
            Some(bytes) if bytes.is_empty() => Ok(None),
            Some(bytes) => Ok(Some(RowId::from_bytes(partition, fixed::<16>(&bytes)?))),
        }
    }

    /// Persist everything written so far.
    pub fn flush(&self) -> Result<()> {
        self.keyspace.persist(self.persist_mode)?;
        Ok(())
    }
}

pub(crate) fn index_build_key(index_id: u32) -> Vec<u8> {
    let mut key = INDEX_BUILD_PREFIX.to_vec();
    key.extend_from_slice(&index_id.to_be_bytes());
    key
}
