//! Transaction identifier carrying its begin timestamp
//!
//! The most significant 64 bits hold the packed [`HybridTimestamp`] the transaction
//! began at, so ids sort by begin time and schema visibility can be decided from the
//! id alone. The low 64 bits are random and only provide uniqueness.

use serde::{Deserialize, Serialize};
use shardline_hlc::HybridTimestamp;
use std::fmt;
use uuid::Uuid;

/// Globally unique transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Generate a new transaction ID that began at `begin_ts`
    pub fn new(begin_ts: HybridTimestamp) -> Self {
        Self::with_node_bits(begin_ts, rand::random::<u64>())
    }

    /// Build an id from its begin timestamp and the low 64 bits
    pub fn with_node_bits(begin_ts: HybridTimestamp, low: u64) -> Self {
        let value = ((begin_ts.as_u64() as u128) << 64) | low as u128;
        Self(Uuid::from_u128(value))
    }

    /// Create from existing UUID (for testing/deserialization)
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Timestamp the transaction began at.
    ///
    /// Used to decide which indexes a read-write transaction must maintain.
    pub fn begin_timestamp(&self) -> HybridTimestamp {
        HybridTimestamp::from_u64((self.0.as_u128() >> 64) as u64)
    }

    /// Convert to bytes (16 bytes, big-endian)
    pub fn to_bytes(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }

    /// Parse from bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parse from string representation
    pub fn parse(s: &str) -> Result<Self, String> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| format!("Invalid transaction ID: {}", e))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialOrd for TransactionId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TransactionId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_timestamp_roundtrip() {
        let begin = HybridTimestamp::new(1_700_000_000_123, 7);
        let id = TransactionId::new(begin);
        assert_eq!(id.begin_timestamp(), begin);
    }

    #[test]
    fn test_ordering_follows_begin_time() {
        let early = TransactionId::with_node_bits(HybridTimestamp::new(100, 0), u64::MAX);
        let late = TransactionId::with_node_bits(HybridTimestamp::new(101, 0), 0);
        assert!(early < late);
    }

    #[test]
    fn test_roundtrip() {
        let id = TransactionId::new(HybridTimestamp::new(5, 5));
        let parsed = TransactionId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);

        let from_bytes = TransactionId::from_bytes(id.to_bytes());
        assert_eq!(id, from_bytes);
    }

    #[test]
    fn test_unique_for_same_begin_time() {
        let begin = HybridTimestamp::new(42, 0);
        assert_ne!(TransactionId::new(begin), TransactionId::new(begin));
    }
}
