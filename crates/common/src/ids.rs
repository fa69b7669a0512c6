//! Partition and node identifiers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one partition of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId {
    pub table_id: u32,
    pub partition: u32,
}

impl PartitionId {
    pub const fn new(table_id: u32, partition: u32) -> Self {
        Self {
            table_id,
            partition,
        }
    }

    /// Name usable as a storage partition prefix.
    pub fn storage_name(&self) -> String {
        format!("t{}_p{}", self.table_id, self.partition)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_part_{}", self.table_id, self.partition)
    }
}

/// Consistent identifier of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}
