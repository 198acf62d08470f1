//! Configuration structures for BrambleDB.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage configuration for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the data file.
    pub data_path: PathBuf,
    /// Buffer pool size in number of frames.
    pub pool_size: usize,
    /// K parameter of the LRU-K replacer.
    pub replacer_k: usize,
    /// Bucket capacity of the page table's extendible hash directory.
    pub bucket_size: usize,
    /// Enable fsync for durability.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("./data/bramble.db"),
            pool_size: 1024,
            replacer_k: 2,
            bucket_size: 4,
            fsync_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Returns the total buffer pool size in bytes.
    pub fn buffer_pool_size_bytes(&self) -> usize {
        self.pool_size * crate::page::PAGE_SIZE
    }
}
