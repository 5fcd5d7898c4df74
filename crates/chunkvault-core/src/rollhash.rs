//! Byte-at-a-time rolling hashes driving the Odess sampler

use serde::{Deserialize, Serialize};

/// Which rolling hash an Odess sampler is built around. Picked once at
/// construction; no per-byte dispatch beyond the vtable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HashKind {
    /// Rabin-style rotate-and-xor hash.
    Rabin,
    /// Gear shift-and-add hash (the default sampler).
    #[default]
    Gear,
}

impl HashKind {
    /// Construct the rolling hash this kind names.
    pub fn build(self) -> Box<dyn RollHash + Send> {
        match self {
            HashKind::Rabin => Box::new(Rabin::new()),
            HashKind::Gear => Box::new(Gear::new()),
        }
    }
}

/// A rolling hash fed one byte at a time.
pub trait RollHash {
    /// Feed one byte and return the updated hash value.
    fn roll(&mut self, byte: u8) -> u64;
    /// Reset internal state between chunks.
    fn reset(&mut self);
}

/// 256-entry random table shared by both hashes, derived deterministically
/// from the byte value so features are stable across runs and processes.
fn derive_table(domain: &[u8]) -> [u64; 256] {
    let mut table = [0u64; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        let mut seed = [0u8; 64];
        seed[..domain.len()].copy_from_slice(domain);
        for b in seed[domain.len()..].iter_mut() {
            *b = i as u8;
        }
        let hash = blake3::hash(&seed);
        let mut word = [0u8; 8];
        word.copy_from_slice(&hash.as_bytes()[..8]);
        *slot = u64::from_le_bytes(word);
    }
    table
}

/// Gear hash: `h = (h << 1) + table[byte]`.
pub struct Gear {
    table: [u64; 256],
    value: u64,
}

impl Gear {
    /// Build a Gear hash with the canonical table.
    pub fn new() -> Self {
        Self {
            table: derive_table(b"gear"),
            value: 0,
        }
    }
}

impl Default for Gear {
    fn default() -> Self {
        Self::new()
    }
}

impl RollHash for Gear {
    fn roll(&mut self, byte: u8) -> u64 {
        self.value = (self.value << 1).wrapping_add(self.table[byte as usize]);
        self.value
    }

    fn reset(&mut self) {
        self.value = 0;
    }
}

/// Rabin-style hash: `h = rotl(h, 1) ^ table[byte]`.
pub struct Rabin {
    table: [u64; 256],
    value: u64,
}

impl Rabin {
    /// Build a Rabin hash with the canonical table.
    pub fn new() -> Self {
        Self {
            table: derive_table(b"rabin"),
            value: 0,
        }
    }
}

impl Default for Rabin {
    fn default() -> Self {
        Self::new()
    }
}

impl RollHash for Rabin {
    fn roll(&mut self, byte: u8) -> u64 {
        self.value = self.value.rotate_left(1) ^ self.table[byte as usize];
        self.value
    }

    fn reset(&mut self) {
        self.value = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gear_is_deterministic() {
        let mut a = Gear::new();
        let mut b = Gear::new();
        for byte in b"rolling hash input" {
            assert_eq!(a.roll(*byte), b.roll(*byte));
        }
    }

    #[test]
    fn reset_restarts_the_stream() {
        let mut h = Gear::new();
        let first: Vec<u64> = b"abc".iter().map(|b| h.roll(*b)).collect();
        h.reset();
        let second: Vec<u64> = b"abc".iter().map(|b| h.roll(*b)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn kinds_build_distinct_hashes() {
        let mut gear = HashKind::Gear.build();
        let mut rabin = HashKind::Rabin.build();
        let g: Vec<u64> = b"divergence".iter().map(|b| gear.roll(*b)).collect();
        let r: Vec<u64> = b"divergence".iter().map(|b| rabin.roll(*b)).collect();
        assert_ne!(g, r);
    }
}
