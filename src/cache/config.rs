//! Result store configuration.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::util::bytes::{HumanBytes, mebibytes};

use super::disk::DiskResultStore;
use super::memory::MemoryResultStore;
use super::store::{ResultStore, StoreError};

const DEFAULT_SIZE_MB: u64 = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Byte budget for terminal entries.
    pub capacity_bytes: u64,
    /// Persist terminal entries here; `None` keeps everything in memory.
    pub directory: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: mebibytes(DEFAULT_SIZE_MB),
            directory: None,
        }
    }
}

impl From<&crate::config::CacheSettings> for StoreConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            capacity_bytes: mebibytes(settings.size_mb.get()),
            directory: settings.directory.clone(),
        }
    }
}

impl StoreConfig {
    /// Build the configured store.
    pub fn open(&self) -> Result<Arc<dyn ResultStore>, StoreError> {
        match &self.directory {
            Some(directory) => {
                let store = DiskResultStore::open(directory, self.capacity_bytes)?;
                info!(
                    target = "depthcast::cache",
                    backend = "disk",
                    directory = %directory.display(),
                    capacity = %HumanBytes(self.capacity_bytes),
                    "Result store ready"
                );
                Ok(Arc::new(store))
            }
            None => {
                info!(
                    target = "depthcast::cache",
                    backend = "memory",
                    capacity = %HumanBytes(self.capacity_bytes),
                    "Result store ready"
                );
                Ok(Arc::new(MemoryResultStore::new(self.capacity_bytes)))
            }
        }
    }
}
