//! Error types for the chunkvault-store crate

use chunkvault_core::error::CoreError;

/// All errors that can occur in the storage layer
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O fault on a container, recipe, or rename; fatal to the pipeline
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Codec failure bubbled up from the core crate
    #[error(transparent)]
    Core(#[from] CoreError),
    /// A container's contents violate the block format
    #[error("format violation: {0}")]
    Format(String),
    /// A background stage ended without delivering its result
    #[error("background worker lost: {0}")]
    WorkerLost(String),
}
