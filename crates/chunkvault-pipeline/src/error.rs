//! Error types for the chunkvault-pipeline crate

use chunkvault_core::error::CoreError;
use chunkvault_index::error::IndexError;
use chunkvault_store::error::StoreError;

/// All errors that can abort a pipeline run
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// I/O fault; fatal to the running pipeline
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Codec failure bubbled up from the core crate
    #[error(transparent)]
    Core(#[from] CoreError),
    /// Storage-layer failure
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Metadata persistence failure
    #[error(transparent)]
    Index(#[from] IndexError),
    /// The on-disk state violates the block format; indicates store corruption
    #[error("format violation: {0}")]
    Format(String),
    /// A stage thread died or a queue closed underneath a producer
    #[error("pipeline stage lost: {0}")]
    StageLost(String),
    /// The caller asked for something the store cannot satisfy
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl PipelineError {
    /// Shorthand for a lost-stage error.
    pub(crate) fn stage(name: &str) -> Self {
        PipelineError::StageLost(name.to_string())
    }
}
