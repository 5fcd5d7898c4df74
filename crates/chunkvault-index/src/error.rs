//! Error types for the chunkvault-index crate

/// All errors that can occur in metadata persistence and validation
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// I/O error reading or writing the manifest or kvstore
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization or deserialization failed
    #[error("codec error: {0}")]
    Codec(String),
    /// Persisted state violates a store invariant
    #[error("corrupt metadata: {0}")]
    Corrupt(String),
}

impl From<bincode::Error> for IndexError {
    fn from(err: bincode::Error) -> Self {
        IndexError::Codec(err.to_string())
    }
}
