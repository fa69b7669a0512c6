//! Versioned catalog of secondary indexes
//!
//! Every catalog change produces a new version that becomes active at a hybrid
//! timestamp. The state machine resolves the indexes a transaction writes to by the
//! catalog active at the transaction's begin timestamp, and an index build chooses row
//! versions by the activation times of the versions that created the index and
//! started its build.

use parking_lot::RwLock;
use shardline_common::BinaryRow;
use shardline_hlc::{HybridTimestamp, SharedClock};

/// Lifecycle of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    /// Maintained by new writes, not yet backfilled
    Registered,
    /// Backfill in progress
    Building,
    /// Backfill done, usable by readers
    Available,
}

/// Secondary index over a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub id: u32,
    pub table_id: u32,
    pub name: String,
    /// Column positions making up the key
    pub columns: Vec<usize>,
    pub status: IndexStatus,
    pub creation_catalog_version: u32,
}

impl IndexDescriptor {
    /// Key of `row` in this index, or `None` if the row lacks a key column.
    pub fn index_key(&self, row: &BinaryRow) -> Option<Vec<u8>> {
        let mut key = Vec::new();
        for column in &self.columns {
            let value = row.column(*column)?;
            key.extend_from_slice(&(value.len() as u32).to_be_bytes());
            key.extend_from_slice(value);
        }
        Some(key)
    }

    /// Key built from column values, matching [`IndexDescriptor::index_key`].
    pub fn key_of(values: &[&[u8]]) -> Vec<u8> {
        let mut key = Vec::new();
        for value in values {
            key.extend_from_slice(&(value.len() as u32).to_be_bytes());
            key.extend_from_slice(value);
        }
        key
    }
}

/// One version of the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    pub version: u32,
    /// Time from which this version is active
    pub activation_ts: HybridTimestamp,
    pub indexes: Vec<IndexDescriptor>,
}

impl Catalog {
    pub fn index(&self, index_id: u32) -> Option<&IndexDescriptor> {
        self.indexes.iter().find(|index| index.id == index_id)
    }

    pub fn table_indexes(&self, table_id: u32) -> Vec<IndexDescriptor> {
        self.indexes
            .iter()
            .filter(|index| index.table_id == table_id)
            .cloned()
            .collect()
    }
}

/// Read access to catalog versions.
pub trait CatalogService: Send + Sync {
    /// A specific catalog version
    fn catalog(&self, version: u32) -> Option<Catalog>;

    /// The version active at `ts`
    fn active_catalog(&self, ts: HybridTimestamp) -> Catalog;

    /// Indexes of a table in the version active at `ts`.
    fn indexes_at(&self, table_id: u32, ts: HybridTimestamp) -> Vec<IndexDescriptor> {
        self.active_catalog(ts).table_indexes(table_id)
    }
}

/// Catalog kept in memory, shared by every node of a local cluster.
pub struct InMemoryCatalog {
    clock: SharedClock,
    versions: RwLock<Vec<Catalog>>,
}

impl InMemoryCatalog {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            versions: RwLock::new(vec![Catalog {
                version: 0,
                activation_ts: HybridTimestamp::from_u64(0),
                indexes: Vec::new(),
            }]),
        }
    }

    pub fn latest_version(&self) -> u32 {
        self.versions.read().last().map_or(0, |catalog| catalog.version)
    }

    /// Register a new index. Returns its id.
    pub fn create_index(&self, table_id: u32, name: impl Into<String>, columns: Vec<usize>) -> u32 {
        let name = name.into();
        let mut versions = self.versions.write();
        let id = versions
            .iter()
            .flat_map(|catalog| catalog.indexes.iter().map(|index| index.id))
            .max()
            .map_or(1, |max| max + 1);

        let version = Self::next_version(&versions);
        let mut indexes = Self::latest_indexes(&versions);
        indexes.push(IndexDescriptor {
            id,
            table_id,
            name: name.clone(),
            columns,
            status: IndexStatus::Registered,
            creation_catalog_version: version,
        });
        versions.push(Catalog {
            version,
            activation_ts: self.clock.now(),
            indexes,
        });

        tracing::info!("Index {} ({}) registered in catalog version {}", name, id, version);
        id
    }

    /// Move an index to [`IndexStatus::Building`]. Returns the new catalog version.
    pub fn start_building(&self, index_id: u32) -> Option<u32> {
        self.set_status(index_id, IndexStatus::Building)
    }

    /// Move an index to [`IndexStatus::Available`].
    pub fn make_available(&self, index_id: u32) -> Option<u32> {
        self.set_status(index_id, IndexStatus::Available)
    }

    fn set_status(&self, index_id: u32, status: IndexStatus) -> Option<u32> {
        let mut versions = self.versions.write();
        let mut indexes = Self::latest_indexes(&versions);
        indexes.iter_mut().find(|index| index.id == index_id)?.status = status;

        let version = Self::next_version(&versions);
        versions.push(Catalog {
            version,
            activation_ts: self.clock.now(),
            indexes,
        });

        tracing::debug!("Index {} is {:?} from catalog version {}", index_id, status, version);
        Some(version)
    }

    fn next_version(versions: &[Catalog]) -> u32 {
        versions.last().map_or(0, |catalog| catalog.version + 1)
    }

    fn latest_indexes(versions: &[Catalog]) -> Vec<IndexDescriptor> {
        versions.last().map(|catalog| catalog.indexes.clone()).unwrap_or_default()
    }
}

impl CatalogService for InMemoryCatalog {
    fn catalog(&self, version: u32) -> Option<Catalog> {
        self.versions
            .read()
            .iter()
            .find(|catalog| catalog.version == version)
            .cloned()
    }

    fn active_catalog(&self, ts: HybridTimestamp) -> Catalog {
        let versions = self.versions.read();
        versions
            .iter()
            .rev()
            .find(|catalog| catalog.activation_ts <= ts)
            .or_else(|| versions.first())
            .cloned()
            .unwrap_or(Catalog {
                version: 0,
                activation_ts: HybridTimestamp::from_u64(0),
                indexes: Vec::new(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_hlc::HybridClock;
    use std::sync::Arc;

    #[test]
    fn test_versions_activate_in_time() {
        let clock = Arc::new(HybridClock::new());
        let catalog = InMemoryCatalog::new(clock.clone());

        let before = clock.now();
        let index_id = catalog.create_index(1, "by_value", vec![0]);
        let after_create = clock.now();
        let building = catalog.start_building(index_id).unwrap();

        assert!(catalog.indexes_at(1, before).is_empty());
        let at_create = catalog.indexes_at(1, after_create);
        assert_eq!(at_create.len(), 1);
        assert_eq!(at_create[0].status, IndexStatus::Registered);
        assert!(catalog.indexes_at(2, after_create).is_empty());

        assert_eq!(building, catalog.latest_version());
        let latest = catalog.active_catalog(HybridTimestamp::MAX);
        assert_eq!(latest.index(index_id).unwrap().status, IndexStatus::Building);
        assert_eq!(latest.index(index_id).unwrap().creation_catalog_version, 1);
        assert!(catalog.start_building(99).is_none());
    }

    #[test]
    fn test_index_key() {
        let index = IndexDescriptor {
            id: 1,
            table_id: 1,
            name: "idx".into(),
            columns: vec![1, 0],
            status: IndexStatus::Available,
            creation_catalog_version: 1,
        };

        let row = BinaryRow::new(1, vec![b"a".to_vec(), b"bc".to_vec()]);
        assert_eq!(index.index_key(&row), Some(IndexDescriptor::key_of(&[b"bc".as_slice(), b"a".as_slice()])));
        assert_eq!(index.index_key(&BinaryRow::from_value("a")), None);
    }
}
