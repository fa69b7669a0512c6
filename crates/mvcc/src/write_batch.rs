//! Atomic write batch over one partition storage
//!
//! Writes are staged in memory and turned into a single fjall batch on commit, so each
//! key is written at most once per batch and reads made through the batch observe
//! what was staged before them.

use crate::encoding::{
    AppliedPosition, Encode, from_cbor, index_entry_key, to_cbor, tx_row_key, version_key,
};
use crate::error::{Error, Result};
use crate::partition::{Area, LAST_APPLIED_KEY, MvPartitionStorage, index_build_key};
use crate::row_version::{RowVersion, WriteIntent};
use parking_lot::RwLockWriteGuard;
use shardline_common::{BinaryRow, PartitionId, RowId, TransactionId};
use shardline_hlc::HybridTimestamp;
use std::collections::{BTreeMap, HashMap};

/// Staged mutations of a partition storage, committed atomically.
pub struct PartitionWriteBatch<'a> {
    storage: &'a MvPartitionStorage,

    /// `None` marks a removal
    staged: BTreeMap<(Area, Vec<u8>), Option<Vec<u8>>>,

    /// Row lock stripes held until commit
    locked: HashMap<usize, RwLockWriteGuard<'a, ()>>,

    applied: Option<AppliedPosition>,
}

impl<'a> PartitionWriteBatch<'a> {
    pub(crate) fn new(storage: &'a MvPartitionStorage) -> Self {
        Self {
            storage,
            staged: BTreeMap::new(),
            locked: HashMap::new(),
            applied: None,
        }
    }

    /// Lock a row until this batch commits. Re-locking the same stripe is a no-op.
    pub fn lock(&mut self, row_id: &RowId) {
        let stripe = self.storage.stripe(row_id);
        if !self.locked.contains_key(&stripe) {
            let guard = self.storage.row_lock(stripe);
            self.locked.insert(stripe, guard);
        }
    }

    fn put(&mut self, area: Area, key: Vec<u8>, value: Vec<u8>) {
        self.staged.insert((area, key), Some(value));
    }

    fn remove(&mut self, area: Area, key: Vec<u8>) {
        self.staged.insert((area, key), None);
    }

    fn get(&self, area: Area, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(staged) = self.staged.get(&(area, key.to_vec())) {
            return Ok(staged.clone());
        }
        Ok(self.storage.handle(area).get(key)?.map(|value| value.to_vec()))
    }

    /// Current write intent of a row, including staged changes.
    pub fn write_intent(&mut self, row_id: &RowId) -> Result<Option<WriteIntent>> {
        self.lock(row_id);
        self.get(Area::Intents, &row_id.to_bytes())?
            .map(|bytes| from_cbor::<WriteIntent>(&bytes))
            .transpose()
    }

    /// Version chain of a row as persisted before this batch, newest first.
    pub fn scan_versions(&mut self, row_id: &RowId) -> Result<Vec<RowVersion>> {
        self.lock(row_id);
        self.storage.scan_versions_unlocked(row_id)
    }

    /// Write (or overwrite) the write intent of `tx_id` on a row.
    ///
    /// Returns the intent it replaced. Fails if another transaction owns the row.
    pub fn add_write(
        &mut self,
        row_id: &RowId,
        row: Option<BinaryRow>,
        tx_id: TransactionId,
        commit_partition: PartitionId,
    ) -> Result<Option<WriteIntent>> {
        let previous = self.write_intent(row_id)?;

        if let Some(previous) = &previous {
            if previous.tx_id != tx_id {
                return Err(Error::TxIdMismatch {
                    row_id: *row_id,
                    expected: tx_id,
                    actual: previous.tx_id,
                });
            }
        }

        let intent = WriteIntent {
            tx_id,
            commit_partition,
            row,
        };
        self.put(Area::Intents, row_id.to_bytes().to_vec(), to_cbor(&intent)?);
        self.put(Area::TxRows, tx_row_key(tx_id, row_id), Vec::new());

        Ok(previous)
    }

    /// Write a committed version directly, bypassing the intent stage.
    pub fn add_write_committed(
        &mut self,
        row_id: &RowId,
        row: Option<BinaryRow>,
        commit_ts: HybridTimestamp,
    ) -> Result<()> {
        if let Some(intent) = self.write_intent(row_id)? {
            return Err(Error::WriteIntentExists {
                row_id: *row_id,
                tx_id: intent.tx_id,
            });
        }

        self.put(Area::Rows, version_key(row_id, commit_ts), to_cbor(&row)?);
        Ok(())
    }

    /// Turn the write intent of `tx_id` into a committed version at `commit_ts`.
    ///
    /// Returns the committed intent, or `None` if the row has no intent of `tx_id`.
    pub fn commit_write(
        &mut self,
        row_id: &RowId,
        commit_ts: HybridTimestamp,
        tx_id: TransactionId,
    ) -> Result<Option<WriteIntent>> {
        let Some(intent) = self.take_intent(row_id, tx_id)? else {
            return Ok(None);
        };

        self.put(Area::Rows, version_key(row_id, commit_ts), to_cbor(&intent.row)?);
        Ok(Some(intent))
    }

    /// Drop the write intent of `tx_id`, returning it.
    pub fn abort_write(
        &mut self,
        row_id: &RowId,
        tx_id: TransactionId,
    ) -> Result<Option<WriteIntent>> {
        self.take_intent(row_id, tx_id)
    }

    fn take_intent(&mut self, row_id: &RowId, tx_id: TransactionId) -> Result<Option<WriteIntent>> {
        match self.write_intent(row_id)? {
            Some(intent) if intent.tx_id == tx_id => {
                self.remove(Area::Intents, row_id.to_bytes().to_vec());
                self.remove(Area::TxRows, tx_row_key(tx_id, row_id));
                Ok(Some(intent))
            }
            _ => Ok(None),
        }
    }

    pub fn put_index(&mut self, index_id: u32, index_key: &[u8], row_id: &RowId) {
        self.put(Area::Index, index_entry_key(index_id, index_key, row_id), Vec::new());
    }

    pub fn remove_index(&mut self, index_id: u32, index_key: &[u8], row_id: &RowId) {
        self.remove(Area::Index, index_entry_key(index_id, index_key, row_id));
    }

    /// Record where the build of `index_id` resumes. `None` marks the build complete.
    pub fn set_next_row_id_to_build(&mut self, index_id: u32, next: Option<RowId>) {
        let value = next.map(|row_id| row_id.to_bytes().to_vec()).unwrap_or_default();
        self.put(Area::Meta, index_build_key(index_id), value);
    }

    /// Record the log position this batch corresponds to.
    pub fn set_last_applied(&mut self, index: u64, term: u64) {
        self.applied = Some(AppliedPosition::new(index, term));
    }

    pub(crate) fn commit(mut self) -> Result<()> {
        if let Some(applied) = self.applied {
            self.put(Area::Meta, LAST_APPLIED_KEY.to_vec(), applied.encode()?);
        }

        if self.staged.is_empty() {
            return Ok(());
        }

        let storage = self.storage;
        let mut batch = storage.keyspace().batch();
        for ((area, key), value) in std::mem::take(&mut self.staged) {
            match value {
                Some(value) => batch.insert(storage.handle(area), key, value),
                None => batch.remove(storage.handle(area), key),
            }
        }
        batch.commit()?;

        if let Some(applied) = self.applied {
            storage.set_cached_applied(applied);
        }

        // Row locks are released when `self` drops
        Ok(())
    }
}
