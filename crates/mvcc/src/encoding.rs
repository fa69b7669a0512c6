//! Encoding of storage keys and values
//!
//! Keys use hand-written big-endian layouts so that byte order equals logical order.
//! Values are CBOR via ciborium.

use crate::error::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use shardline_common::{RowId, TransactionId};
use shardline_hlc::HybridTimestamp;

/// Encode a value to bytes
pub trait Encode {
    fn encode(&self) -> Result<Vec<u8>>;
}

/// Decode a value from bytes
pub trait Decode: Sized {
    fn decode(bytes: &[u8]) -> Result<Self>;
}

impl Encode for u64 {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.to_be_bytes().to_vec())
    }
}

impl Decode for u64 {
    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(u64::from_be_bytes(fixed::<8>(bytes)?))
    }
}

/// Position of the last command applied to a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AppliedPosition {
    pub index: u64,
    pub term: u64,
}

impl AppliedPosition {
    pub const fn new(index: u64, term: u64) -> Self {
        Self { index, term }
    }
}

impl Encode for AppliedPosition {
    fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(16);
        bytes.extend_from_slice(&self.index.to_be_bytes());
        bytes.extend_from_slice(&self.term.to_be_bytes());
        Ok(bytes)
    }
}

impl Decode for AppliedPosition {
    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 16 {
            return Err(Error::Encoding(format!(
                "Expected 16 bytes for applied position, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            index: u64::decode(&bytes[..8])?,
            term: u64::decode(&bytes[8..])?,
        })
    }
}

pub(crate) fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| {
        Error::Encoding(format!("Expected {} bytes, got {}", N, bytes.len()))
    })
}

/// Serialize a value as CBOR.
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes)
        .map_err(|e| Error::Encoding(format!("Failed to serialize: {}", e)))?;
    Ok(bytes)
}

/// Deserialize a CBOR value.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::de::from_reader(bytes)
        .map_err(|e| Error::Encoding(format!("Failed to deserialize: {}", e)))
}

/// Key of a committed version: `{row_uuid(16)}{!commit_ts(8)}`.
///
/// The inverted timestamp makes a prefix scan return the newest version first.
pub(crate) fn version_key(row_id: &RowId, commit_ts: HybridTimestamp) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(&row_id.to_bytes());
    key.extend_from_slice(&(u64::MAX - commit_ts.as_u64()).to_be_bytes());
    key
}

pub(crate) fn decode_version_key(partition: u32, key: &[u8]) -> Result<(RowId, HybridTimestamp)> {
    if key.len() != 24 {
        return Err(Error::Encoding(format!(
            "Expected 24 bytes for version key, got {}",
            key.len()
        )));
    }
    let row_id = RowId::from_bytes(partition, fixed::<16>(&key[..16])?);
    let inverted = u64::decode(&key[16..])?;
    Ok((row_id, HybridTimestamp::from_u64(u64::MAX - inverted)))
}

/// Key linking a transaction to a row it wrote: `{tx_id(16)}{row_uuid(16)}`.
pub(crate) fn tx_row_key(tx_id: TransactionId, row_id: &RowId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(&tx_id.to_bytes());
    key.extend_from_slice(&row_id.to_bytes());
    key
}

/// Prefix of an index entry: `{index_id(4)}{key_len(4)}{key}`.
pub(crate) fn index_prefix(index_id: u32, index_key: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + index_key.len() + 16);
    key.extend_from_slice(&index_id.to_be_bytes());
    key.extend_from_slice(&(index_key.len() as u32).to_be_bytes());
    key.extend_from_slice(index_key);
    key
}

/// Full index entry key: the prefix followed by the row uuid.
pub(crate) fn index_entry_key(index_id: u32, index_key: &[u8], row_id: &RowId) -> Vec<u8> {
    let mut key = index_prefix(index_id, index_key);
    key.extend_from_slice(&row_id.to_bytes());
    key
}
