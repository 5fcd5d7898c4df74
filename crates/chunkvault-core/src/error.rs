//! Error types for the chunkvault-core crate

/// All errors that can occur in the core codecs and formats
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Container compression failed
    #[error("compression failed: {0}")]
    CompressionFailed(String),
    /// Container decompression failed; data may be corrupted
    #[error("decompression failed: {0}")]
    DecompressionFailed(String),
    /// Delta encoding failed; callers downgrade the chunk to unique
    #[error("delta encoding failed: {0}")]
    DeltaEncodeFailed(String),
    /// Delta decoding failed during restore; indicates store corruption
    #[error("delta decoding failed: {0}")]
    DeltaDecodeFailed(String),
    /// A block header could not be parsed from the given bytes
    #[error("malformed block header: {0}")]
    MalformedHeader(String),
}
