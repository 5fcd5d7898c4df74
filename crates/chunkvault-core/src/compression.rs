//! Per-container zstd compression, single-shot

use crate::error::CoreError;

/// Compress a container buffer. Returns the compressed blob written to disk.
pub fn compress(data: &[u8], level: i32) -> Result<Vec<u8>, CoreError> {
    zstd::encode_all(data, level).map_err(|e| CoreError::CompressionFailed(e.to_string()))
}

/// Decompress a container blob back to its header/payload concatenation.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CoreError> {
    zstd::decode_all(data).map_err(|e| CoreError::DecompressionFailed(e.to_string()))
}
