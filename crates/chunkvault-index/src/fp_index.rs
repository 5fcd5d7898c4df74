//! One generation of the fingerprint table

use std::collections::HashMap;

use chunkvault_core::fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};

/// A fingerprint table entry. `base` is set for delta chunks and must
/// resolve to a non-delta entry (no delta chains).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    /// The LC-group the chunk physically lives in.
    pub category_order: u32,
    /// Stored payload length; the delta length for delta entries.
    pub length: u64,
    /// Original chunk length.
    pub ori_length: u64,
    /// Base fingerprint for delta entries.
    pub base: Option<Fingerprint>,
}

impl TableEntry {
    /// A unique chunk's entry.
    pub fn unique(category_order: u32, length: u64) -> Self {
        Self {
            category_order,
            length,
            ori_length: length,
            base: None,
        }
    }

    /// A delta chunk's entry.
    pub fn delta(category_order: u32, length: u64, ori_length: u64, base: Fingerprint) -> Self {
        Self {
            category_order,
            length,
            ori_length,
            base: Some(base),
        }
    }

    /// True when this entry records a delta chunk.
    pub fn is_delta(&self) -> bool {
        self.base.is_some()
    }
}

/// Outcome of classifying a chunk fingerprint against both generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupResult {
    /// Never seen: the chunk's payload must be written.
    Unique,
    /// Already recorded in the current (later) generation.
    InternalDedup,
    /// Recorded in the later generation as a delta; carries the entry so
    /// the recipe record can repeat the base pointer.
    InternalDeltaDedup(TableEntry),
    /// Recorded in the earlier generation; carries the earlier entry.
    AdjacentDedup(TableEntry),
}

/// One generation of the fingerprint index.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FpGeneration {
    /// Logical size charged to this generation (payload + headers).
    pub total_size: u64,
    /// Portion of `total_size` that duplicates the earlier generation.
    pub migrate_size: u64,
    /// Fingerprint table.
    pub table: HashMap<Fingerprint, TableEntry>,
}

impl FpGeneration {
    /// Atomically take over `other`'s contents, leaving it empty.
    pub fn roll_from(&mut self, other: &mut FpGeneration) {
        self.table = std::mem::take(&mut other.table);
        self.total_size = other.total_size;
        self.migrate_size = other.migrate_size;
        other.total_size = 0;
        other.migrate_size = 0;
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// True when the generation holds no entries.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
