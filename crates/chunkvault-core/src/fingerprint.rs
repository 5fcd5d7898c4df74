//! Content fingerprinting: 160-bit chunk identities and similarity features

use serde::{Deserialize, Serialize};

/// Size of a fingerprint in bytes (160 bits).
pub const FINGERPRINT_LEN: usize = 20;

/// A 160-bit content hash identifying a chunk. Equality covers the full
/// 160 bits; `Hash` buckets by the first 64 bits only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// The all-zero fingerprint, used as padding in fixed-size records.
    pub const ZERO: Fingerprint = Fingerprint([0u8; FINGERPRINT_LEN]);

    /// Return the fingerprint as a lowercase hex string
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Return the raw bytes
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// First 64 bits, used for table bucketing
    pub fn bucket(&self) -> u64 {
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(word)
    }
}

impl std::hash::Hash for Fingerprint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u64(self.bucket());
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Compute the 160-bit fingerprint of a chunk's bytes.
pub fn fingerprint_of(data: &[u8]) -> Fingerprint {
    let hash = blake3::hash(data);
    let mut fp = [0u8; FINGERPRINT_LEN];
    fp.copy_from_slice(&hash.as_bytes()[..FINGERPRINT_LEN]);
    Fingerprint(fp)
}

/// Three 64-bit features from an Odess pass over a chunk's bytes.
/// Two chunks are similar when any one feature matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SimilarityFeatures(pub [u64; 3]);

impl SimilarityFeatures {
    /// True if any of the three features matches the other's.
    pub fn matches(&self, other: &SimilarityFeatures) -> bool {
        self.0.iter().zip(other.0.iter()).any(|(a, b)| a == b)
    }
}
