//! Odess similarity sampling: rolling hash + sampling mask + affine
//! transforms with max-selection + per-group feature hashing.

use crate::fingerprint::SimilarityFeatures;
use crate::rollhash::{HashKind, RollHash};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use xxhash_rust::xxh64::xxh64;

/// Positions where `hash & SAMPLING_MASK == 0` contribute to the features.
const SAMPLING_MASK: u64 = 0x0000_4003_0341_0000;

/// Seed of the per-group feature hash.
const FEATURE_SEED: u64 = 0x7fcaf1;

/// Twelve affine lanes, hashed down to three features of four lanes each.
const LANES: usize = 12;

/// Seed for the affine coefficients; fixed so features are stable across
/// processes and survive index persistence.
const COEFF_SEED: u64 = 0x6f64_6573_73;

/// Computes the three similarity features of a chunk. One sampler is owned
/// per dedup stage; it is stateful only across a single `features` call.
pub struct OdessSampler {
    hash: Box<dyn RollHash + Send>,
    mul: [u64; LANES],
    add: [u64; LANES],
}

impl OdessSampler {
    /// Build a sampler around the given rolling hash.
    pub fn new(kind: HashKind) -> Self {
        let mut rng = StdRng::seed_from_u64(COEFF_SEED);
        let mut mul = [0u64; LANES];
        let mut add = [0u64; LANES];
        for lane in 0..LANES {
            mul[lane] = rng.gen_range(0x0000_0000_0010_0000u64..0x0000_0000_1000_0000u64);
            add[lane] = rng.gen_range(0x0000_0000_0010_0000u64..0x0000_0000_ffff_ffffu64);
        }
        Self {
            hash: kind.build(),
            mul,
            add,
        }
    }

    /// Run the sampling pass over `data` and produce its three features.
    pub fn features(&mut self, data: &[u8]) -> SimilarityFeatures {
        let mut maxes = [0u64; LANES];
        self.hash.reset();
        for &byte in data {
            let value = self.hash.roll(byte);
            if value & SAMPLING_MASK == 0 {
                for lane in 0..LANES {
                    let transformed = value.wrapping_mul(self.mul[lane]).wrapping_add(self.add[lane]);
                    if transformed > maxes[lane] {
                        maxes[lane] = transformed;
                    }
                }
            }
        }

        let mut features = [0u64; 3];
        for (group, feature) in features.iter_mut().enumerate() {
            let mut bytes = [0u8; 32];
            for (lane, max) in maxes[group * 4..group * 4 + 4].iter().enumerate() {
                bytes[lane * 8..lane * 8 + 8].copy_from_slice(&max.to_le_bytes());
            }
            *feature = xxh64(&bytes, FEATURE_SEED);
        }
        SimilarityFeatures(features)
    }
}
