//! Task types exchanged between pipeline stages. Buffers move with the
//! task; a stage that consumes a task owns its bytes.

use bytes::Bytes;
use chunkvault_core::chunker::ChunkDescriptor;
use chunkvault_core::fingerprint::{Fingerprint, SimilarityFeatures};

/// Input to the hashing stage: one chunk in input order.
#[derive(Debug)]
pub struct HashTask {
    /// The chunk's bytes (a slice of the shared input buffer).
    pub chunk: ChunkDescriptor,
    /// Position of the chunk in the version's chunk sequence.
    pub index: u64,
}

/// Input to the dedup stage: a chunk with its fingerprint.
#[derive(Debug)]
pub struct DedupTask {
    /// The chunk's bytes.
    pub chunk: ChunkDescriptor,
    /// Content fingerprint computed by the hashing stage.
    pub fp: Fingerprint,
    /// Position of the chunk in the version's chunk sequence.
    pub index: u64,
}

/// Input to the write stage: one recipe record, optionally payload-bearing.
#[derive(Debug)]
pub enum WriteTask {
    /// New chunk: recipe record plus container payload.
    Unique {
        /// Chunk fingerprint.
        fp: Fingerprint,
        /// Chunk bytes.
        data: Bytes,
        /// Features recorded in the header for later re-anchoring.
        features: SimilarityFeatures,
    },
    /// Similar chunk reduced to a delta: recipe record plus delta payload.
    Similar {
        /// Chunk fingerprint.
        fp: Fingerprint,
        /// Encoded delta bytes.
        delta: Vec<u8>,
        /// Original chunk length.
        ori_length: u64,
        /// Fingerprint of the base the delta was encoded against.
        base: Fingerprint,
    },
    /// Duplicate within the current version: recipe record only.
    Internal {
        /// Chunk fingerprint.
        fp: Fingerprint,
        /// Chunk length.
        length: u64,
    },
    /// Duplicate of a delta within the current version: recipe-only, the
    /// record repeats the stored delta's base and lengths.
    InternalDelta {
        /// Chunk fingerprint.
        fp: Fingerprint,
        /// Stored delta length.
        length: u64,
        /// Original chunk length.
        ori_length: u64,
        /// The delta's base.
        base: Fingerprint,
    },
    /// Duplicate of the previous version: recipe record only.
    Adjacent {
        /// Chunk fingerprint.
        fp: Fingerprint,
        /// Chunk length.
        length: u64,
    },
    /// Duplicate of a delta from the previous version: recipe-only.
    AdjacentDelta {
        /// Chunk fingerprint.
        fp: Fingerprint,
        /// Stored delta length.
        length: u64,
        /// Original chunk length.
        ori_length: u64,
        /// The delta's base.
        base: Fingerprint,
    },
}

/// Arrangement read → filter: one decompressed container of an old
/// category, or the end of a category.
#[derive(Debug)]
pub enum FilterTask {
    /// A container's decompressed contents.
    Container {
        /// Concatenated header/payload records.
        buffer: Vec<u8>,
        /// The category the container was read from.
        category: u32,
    },
    /// All containers of the current category have been forwarded.
    CategoryEnd,
}

/// Arrangement filter → write: one routed record or a category boundary.
#[derive(Debug)]
pub enum ArrangeTask {
    /// One header + payload record to carry into the new layout.
    Record {
        /// The record's bytes (header included).
        bytes: Vec<u8>,
        /// True to keep the chunk active, false to archive it.
        active: bool,
    },
    /// The category boundary: flush both cursors and advance.
    CategoryEnd,
}

/// Restore read → decompress: one compressed container file.
#[derive(Debug)]
pub struct CompressedContainer {
    /// Raw file contents.
    pub bytes: Vec<u8>,
}

/// Restore decompress → parse: one decompressed container.
#[derive(Debug)]
pub struct ContainerBuffer {
    /// Concatenated header/payload records.
    pub bytes: Vec<u8>,
    /// On-disk size of the container, for read-amplification stats.
    pub compressed_len: u64,
}

/// Restore parse → write: positioned output operations.
#[derive(Debug)]
pub enum RestoreWriteTask {
    /// Pre-size the output file to the version's logical length.
    SetSize(u64),
    /// Write a unique chunk at its target offset.
    Data {
        /// Chunk bytes.
        bytes: Vec<u8>,
        /// Target offset.
        pos: u64,
    },
    /// Stage a delta's base into the delta's output slot.
    Base {
        /// The base chunk's bytes.
        bytes: Vec<u8>,
        /// The delta target's offset.
        pos: u64,
        /// The delta target's original length (the slot size).
        slot: u64,
    },
    /// Decode a delta in place: read the staged base back from the
    /// output, decode, and overwrite the slot with the original bytes.
    Delta {
        /// Encoded delta bytes.
        delta: Vec<u8>,
        /// The delta target's offset.
        pos: u64,
        /// The delta target's original length.
        ori_length: u64,
    },
}
