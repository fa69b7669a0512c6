//! Storage configuration

use std::path::{Path, PathBuf};

/// How a node's fjall keyspace is laid out and flushed
#[derive(Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,

    /// Shared block cache of the keyspace, in bytes
    pub block_cache_size: u64,

    /// Compression of the `rows` and `tx_meta` partitions. Intents, indexes and
    /// markers are small and stay uncompressed.
    pub compression: fjall::CompressionType,

    /// Used by `flush` and when the engine is persisted on stop
    pub persist_mode: fjall::PersistMode,

    /// Row locks are striped; rows hashing to the same stripe share a lock
    pub row_lock_stripes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            block_cache_size: 64 * 1024 * 1024,
            compression: fjall::CompressionType::Lz4,
            persist_mode: fjall::PersistMode::SyncData,
            row_lock_stripes: 64,
        }
    }
}

impl StorageConfig {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            ..Default::default()
        }
    }

    /// Small cache, buffered persistence
    pub fn for_testing(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            block_cache_size: 4 * 1024 * 1024,
            persist_mode: fjall::PersistMode::Buffer,
            row_lock_stripes: 8,
            ..Default::default()
        }
    }

    /// Same settings, rooted at `subdir` of this config's directory
    pub fn nested(&self, subdir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: self.data_dir.join(subdir),
            ..self.clone()
        }
    }

    pub fn with_compression(mut self, compression: fjall::CompressionType) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_persist_mode(mut self, mode: fjall::PersistMode) -> Self {
        self.persist_mode = mode;
        self
    }

    pub fn with_row_lock_stripes(mut self, stripes: usize) -> Self {
        self.row_lock_stripes = stripes.max(1);
        self
    }
}
