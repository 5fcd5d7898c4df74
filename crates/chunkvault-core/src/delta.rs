//! Similarity delta codec: zstd dictionary mode against a normalized base

use std::io::{Read, Write};

use crate::error::CoreError;

/// Truncate or zero-pad `base` to `len` bytes. The restore writer stages
/// bases into the target's output slot, so both sides of the codec must
/// see the same normalized dictionary regardless of the base's own length.
pub fn normalize(base: &[u8], len: usize) -> Vec<u8> {
    let mut dict = vec![0u8; len];
    let n = base.len().min(len);
    dict[..n].copy_from_slice(&base[..n]);
    dict
}

/// Encode `target` against `base`. The caller rejects deltas that are not
/// smaller than the target.
pub fn encode(target: &[u8], base: &[u8], level: i32) -> Result<Vec<u8>, CoreError> {
    if base.is_empty() || target.is_empty() {
        return Err(CoreError::DeltaEncodeFailed("empty base or target".into()));
    }
    let dict = normalize(base, target.len());
    let mut encoder = zstd::stream::write::Encoder::with_dictionary(Vec::new(), level, &dict)
        .map_err(|e| CoreError::DeltaEncodeFailed(e.to_string()))?;
    encoder
        .write_all(target)
        .map_err(|e| CoreError::DeltaEncodeFailed(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CoreError::DeltaEncodeFailed(e.to_string()))
}

/// Decode a delta back into the original chunk. `base` is the staged base
/// region and `target_len` the original chunk length recorded in the
/// block header; a length mismatch means the store is corrupt.
pub fn decode(delta: &[u8], base: &[u8], target_len: usize) -> Result<Vec<u8>, CoreError> {
    let dict = normalize(base, target_len);
    let mut decoder =
        zstd::stream::read::Decoder::with_dictionary(std::io::Cursor::new(delta), &dict)
            .map_err(|e| CoreError::DeltaDecodeFailed(e.to_string()))?;
    let mut out = Vec::with_capacity(target_len);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CoreError::DeltaDecodeFailed(e.to_string()))?;
    if out.len() != target_len {
        return Err(CoreError::DeltaDecodeFailed(format!(
            "decoded {} bytes, header says {}",
            out.len(),
            target_len
        )));
    }
    Ok(out)
}
