//! Persisted transaction state of a commit partition
//!
//! Every finished transaction whose commit partition is this partition has exactly one
//! [`TxMeta`] entry, written by compare-and-set. The store carries its own applied
//! log position, which is bumped by every CAS whether or not it succeeds.

use crate::config::StorageConfig;
use crate::encoding::{AppliedPosition, Decode, Encode, from_cbor, to_cbor};
use crate::error::Result;
use crate::partition::LAST_APPLIED_KEY;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use parking_lot::Mutex;
use shardline_common::{PartitionId, TransactionId, TxMeta};

/// Transaction state storage of one partition.
pub struct TxStateStorage {
    partition_id: PartitionId,
    keyspace: Keyspace,
    states: PartitionHandle,
    meta: PartitionHandle,

    /// Serializes compare-and-set; also caches the applied position
    applied: Mutex<AppliedPosition>,

    persist_mode: fjall::PersistMode,
}

impl TxStateStorage {
    pub(crate) fn open(
        keyspace: Keyspace,
        partition_id: PartitionId,
        config: &StorageConfig,
    ) -> Result<Self> {
        let name = partition_id.storage_name();

        let states = keyspace.open_partition(
            &format!("{}_tx_state", name),
            PartitionCreateOptions::default()
                .block_size(16 * 1024)
                .compression(config.compression),
        )?;
        let meta = keyspace.open_partition(
            &format!("{}_tx_meta", name),
            PartitionCreateOptions::default()
                .block_size(16 * 1024)
                .compression(fjall::CompressionType::None),
        )?;

        let applied = match meta.get(LAST_APPLIED_KEY)? {
            Some(bytes) => AppliedPosition::decode(&bytes)?,
            None => AppliedPosition::default(),
        };

        Ok(Self {
            partition_id,
            keyspace,
            states,
            meta,
            applied: Mutex::new(applied),
            persist_mode: config.persist_mode,
        })
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// Persisted metadata of a transaction.
    pub fn get(&self, tx_id: TransactionId) -> Result<Option<TxMeta>> {
        self.states
            .get(tx_id.to_bytes())?
            .map(|bytes| from_cbor::<TxMeta>(&bytes))
            .transpose()
    }

    /// Store `new` if the current value equals `expected`.
    ///
    /// The applied position is recorded in the same batch regardless of the outcome,
    /// so a replayed command is recognized as already applied.
    pub fn compare_and_set(
        &self,
        tx_id: TransactionId,
        expected: Option<&TxMeta>,
        new: TxMeta,
        index: u64,
        term: u64,
    ) -> Result<bool> {
        let mut applied = self.applied.lock();

        let current = self.get(tx_id)?;
        let matches = current.as_ref() == expected;

        let position = AppliedPosition::new(index, term);
        let mut batch = self.keyspace.batch();
        if matches {
            batch.insert(&self.states, tx_id.to_bytes(), to_cbor(&new)?);
        }
        batch.insert(&self.meta, LAST_APPLIED_KEY, position.encode()?);
        batch.commit()?;

        *applied = position;
        Ok(matches)
    }

    pub fn last_applied(&self) -> AppliedPosition {
        *self.applied.lock()
    }

    pub fn set_last_applied(&self, index: u64, term: u64) -> Result<()> {
        let mut applied = self.applied.lock();
        let position = AppliedPosition::new(index, term);
        self.meta.insert(LAST_APPLIED_KEY, position.encode()?)?;
        *applied = position;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.keyspace.persist(self.persist_mode)?;
        Ok(())
    }
}
