//! Depthcast result cache
//!
//! Maps job fingerprints to their [`ResultState`](crate::domain::ResultState):
//!
//! - **Pending** markers implement single-flight admission and carry a short TTL
//! - **Terminal** entries (success bytes or failure message) carry the job's
//!   own `expire` and count against a byte budget
//!
//! Two backends share one LRU/expiry index: [`MemoryResultStore`] keeps
//! everything in process, [`DiskResultStore`] persists terminal entries with
//! absolute expiry timestamps so they stay valid across restarts.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! size_mb = 500
//! # directory = "/var/cache/depthcast"
//! ```

mod config;
mod disk;
mod index;
mod memory;
mod store;

pub use config::StoreConfig;
pub use disk::DiskResultStore;
pub use memory::MemoryResultStore;
pub use store::{ResultStore, StoreError, StoreStats};
