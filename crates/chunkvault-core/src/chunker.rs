//! Content-defined chunking (FastCDC) feeding the ingest pipeline

use bytes::Bytes;
use fastcdc::v2020::FastCDC;
use serde::{Deserialize, Serialize};

/// A content-defined chunk of the input stream. `data` is a zero-copy
/// slice of the shared input buffer, so descriptors can cross stage
/// boundaries without reallocating.
#[derive(Debug, Clone)]
pub struct ChunkDescriptor {
    /// Chunk content
    pub data: Bytes,
    /// Byte offset of this chunk in the input stream
    pub offset: u64,
}

impl ChunkDescriptor {
    /// Chunk length in bytes.
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    /// True if the chunk carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Configuration for the FastCDC chunker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Minimum chunk size in bytes; keeps block-header scans addressable.
    pub min_size: usize,
    /// Average (target) chunk size in bytes
    pub avg_size: usize,
    /// Maximum chunk size in bytes
    pub max_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_size: 2048,
            avg_size: 8 * 1024,
            max_size: 64 * 1024,
        }
    }
}

/// Content-defined chunker using the FastCDC algorithm
pub struct Chunker {
    config: ChunkerConfig,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new()
    }
}

impl Chunker {
    /// Create a chunker with default sizes
    pub fn new() -> Self {
        Self {
            config: ChunkerConfig::default(),
        }
    }

    /// Create a chunker with custom configuration
    pub fn with_config(config: ChunkerConfig) -> Self {
        Self { config }
    }

    /// Chunk the input. Concatenating all descriptors' bytes reconstructs
    /// the original data.
    pub fn chunk(&self, data: &Bytes) -> Vec<ChunkDescriptor> {
        if data.is_empty() {
            return Vec::new();
        }
        FastCDC::new(
            data,
            self.config.min_size as u32,
            self.config.avg_size as u32,
            self.config.max_size as u32,
        )
        .map(|c| ChunkDescriptor {
            data: data.slice(c.offset..c.offset + c.length),
            offset: c.offset as u64,
        })
        .collect()
    }
}
