//! Store-wide configuration, owned by the driver and borrowed by stages

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::chunker::ChunkerConfig;
use crate::rollhash::HashKind;

/// Default container size before compression: 16 MiB.
pub const DEFAULT_CONTAINER_SIZE: u64 = 16 * 1024 * 1024;

/// Default dedup segment batch: 20 MiB of chunks classified together so
/// capping sees whole segments.
pub const DEFAULT_SEGMENT_BYTES: u64 = 20 * 1024 * 1024;

/// Default base cache byte budget: 512 MiB.
pub const DEFAULT_CACHE_BYTES: u64 = 512 * 1024 * 1024;

/// Configuration for a chunkvault store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory holding `logicFiles/`, `storageFiles/`, the manifest
    /// and the kvstore.
    pub root: PathBuf,
    /// Target container size before compression.
    pub container_size: u64,
    /// Versions retained; exceeding this triggers the eliminator.
    pub retention: u64,
    /// Bytes of chunks batched per dedup segment.
    pub segment_bytes: u64,
    /// Minimum per-segment references a delta base needs; below this every
    /// delta intent against it is rejected.
    pub capping_threshold: u64,
    /// Base cache byte budget.
    pub cache_bytes: u64,
    /// Successful cache accesses per LRU sequence bump.
    pub cache_update_score: u64,
    /// Chunker bounds.
    pub chunker: ChunkerConfig,
    /// Enable similarity delta encoding.
    pub delta_enabled: bool,
    /// Rolling hash driving the Odess sampler.
    pub odess_hash: HashKind,
    /// Bounded depth of each inter-stage queue.
    pub queue_depth: usize,
    /// zstd level for containers and deltas.
    pub zstd_level: i32,
}

impl StoreConfig {
    /// Config rooted at `root` with defaults everywhere else.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            container_size: DEFAULT_CONTAINER_SIZE,
            retention: 3,
            segment_bytes: DEFAULT_SEGMENT_BYTES,
            capping_threshold: 10,
            cache_bytes: DEFAULT_CACHE_BYTES,
            cache_update_score: 2,
            chunker: ChunkerConfig::default(),
            delta_enabled: true,
            odess_hash: HashKind::Gear,
            queue_depth: 64,
            zstd_level: 1,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new(".")
    }
}
