//! Binary row payload

use serde::{Deserialize, Serialize};

/// Opaque row payload stored in row versions.
///
/// Columns are kept as raw bytes; the storage layer never interprets them except to
/// extract index keys by column position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BinaryRow {
    pub schema_version: u32,
    pub columns: Vec<Vec<u8>>,
}

impl BinaryRow {
    pub fn new(schema_version: u32, columns: Vec<Vec<u8>>) -> Self {
        Self {
            schema_version,
            columns,
        }
    }

    /// Single column row, handy for key/value style tables.
    pub fn from_value(value: impl Into<Vec<u8>>) -> Self {
        Self::new(1, vec![value.into()])
    }

    pub fn column(&self, index: usize) -> Option<&[u8]> {
        self.columns.get(index).map(Vec::as_slice)
    }
}
