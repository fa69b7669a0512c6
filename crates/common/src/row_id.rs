//! Row identity within a partition

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identity of a logical row inside one partition.
///
/// Row ids are totally ordered by their uuid, which is what index builds rely on to
/// resume from a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowId {
    partition: u32,
    uuid: Uuid,
}

impl RowId {
    /// Allocate a fresh row id for `partition`.
    pub fn new(partition: u32) -> Self {
        Self {
            partition,
            uuid: Uuid::now_v7(),
        }
    }

    pub fn from_uuid(partition: u32, uuid: Uuid) -> Self {
        Self { partition, uuid }
    }

    /// The smallest row id of a partition.
    pub fn lowest(partition: u32) -> Self {
        Self {
            partition,
            uuid: Uuid::nil(),
        }
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The row id directly after this one, or `None` when this is the largest id.
    pub fn increment(&self) -> Option<RowId> {
        self.uuid.as_u128().checked_add(1).map(|next| RowId {
            partition: self.partition,
            uuid: Uuid::from_u128(next),
        })
    }

    /// Big-endian key bytes, order preserving within a partition.
    pub fn to_bytes(&self) -> [u8; 16] {
        *self.uuid.as_bytes()
    }

    pub fn from_bytes(partition: u32, bytes: [u8; 16]) -> Self {
        Self {
            partition,
            uuid: Uuid::from_bytes(bytes),
        }
    }
}

impl PartialOrd for RowId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RowId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.partition
            .cmp(&other.partition)
            .then_with(|| self.uuid.cmp(&other.uuid))
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowId[partition={}, uuid={}]", self.partition, self.uuid)
    }
}
