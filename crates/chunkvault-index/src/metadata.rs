//! The shared two-generation metadata index behind a single coarse lock

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use chunkvault_core::block::HEADER_LEN;
use chunkvault_core::fingerprint::{Fingerprint, SimilarityFeatures};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::IndexError;
use crate::fp_index::{FpGeneration, LookupResult, TableEntry};
use crate::sim_index::{BasePos, SimGeneration};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Inner {
    fp_earlier: FpGeneration,
    fp_later: FpGeneration,
    sim_earlier: SimGeneration,
    sim_later: SimGeneration,
}

/// Fingerprint and similarity tables for both generations, shared by the
/// dedup and arrangement stages. All access is mutually excluded by one
/// lock; the lookup ordering inside `dedup_lookup` guarantees
/// later-generation primacy.
#[derive(Debug, Default)]
pub struct MetadataIndex {
    inner: Mutex<Inner>,
}

impl MetadataIndex {
    /// An empty index (a store with no versions).
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify `fp` and charge the chunk to the later generation's
    /// accounting: later hits are internal, earlier hits are adjacent and
    /// additionally counted as migrated size.
    pub fn dedup_lookup(&self, fp: &Fingerprint, chunk_size: u64) -> LookupResult {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.fp_later.table.get(fp).copied() {
            return if entry.is_delta() {
                LookupResult::InternalDeltaDedup(entry)
            } else {
                LookupResult::InternalDedup
            };
        }
        inner.fp_later.total_size += chunk_size + HEADER_LEN as u64;
        match inner.fp_earlier.table.get(fp).copied() {
            Some(entry) => {
                inner.fp_later.migrate_size += chunk_size + HEADER_LEN as u64;
                LookupResult::AdjacentDedup(entry)
            }
            None => LookupResult::Unique,
        }
    }

    /// Classify `fp` without touching the accounting. Used by the dedup
    /// stage's waiting-list pass, which classifies every chunk a first
    /// time to plan capping before the charging pass emits it.
    pub fn peek_lookup(&self, fp: &Fingerprint) -> LookupResult {
        let inner = self.inner.lock();
        if let Some(entry) = inner.fp_later.table.get(fp).copied() {
            return if entry.is_delta() {
                LookupResult::InternalDeltaDedup(entry)
            } else {
                LookupResult::InternalDedup
            };
        }
        match inner.fp_earlier.table.get(fp).copied() {
            Some(entry) => LookupResult::AdjacentDedup(entry),
            None => LookupResult::Unique,
        }
    }

    /// First-hit similarity probe: earlier generation before later,
    /// feature lane 1 before 2 before 3.
    pub fn similarity_lookup(&self, features: &SimilarityFeatures) -> Option<BasePos> {
        let inner = self.inner.lock();
        for lane in 0..3 {
            if let Some(pos) = inner.sim_earlier.lookup_lane(lane, features.0[lane]) {
                return Some(pos);
            }
        }
        for lane in 0..3 {
            if let Some(pos) = inner.sim_later.lookup_lane(lane, features.0[lane]) {
                return Some(pos);
            }
        }
        None
    }

    /// All six candidate bases (earlier lanes then later lanes), for
    /// batch selection against the base cache.
    pub fn similarity_lookup_all(&self, features: &SimilarityFeatures) -> [Option<BasePos>; 6] {
        let inner = self.inner.lock();
        let mut out = [None; 6];
        for lane in 0..3 {
            out[lane] = inner.sim_earlier.lookup_lane(lane, features.0[lane]);
            out[lane + 3] = inner.sim_later.lookup_lane(lane, features.0[lane]);
        }
        out
    }

    /// Record a unique chunk in the later generation.
    pub fn unique_add_record(&self, fp: Fingerprint, category_order: u32, length: u64) {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.fp_later.table.contains_key(&fp));
        inner
            .fp_later
            .table
            .insert(fp, TableEntry::unique(category_order, length));
    }

    /// Record a delta chunk in the later generation and credit the
    /// realized saving against the generation's logical size.
    pub fn delta_add_record(
        &self,
        fp: Fingerprint,
        category_order: u32,
        base: Fingerprint,
        delta_length: u64,
        ori_length: u64,
    ) {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.fp_later.table.contains_key(&fp));
        inner.fp_later.table.insert(
            fp,
            TableEntry::delta(category_order, delta_length, ori_length, base),
        );
        inner.fp_later.total_size -= ori_length - delta_length;
    }

    /// Register a base's similarity features in the later generation.
    pub fn add_similar_feature(&self, features: &SimilarityFeatures, pos: BasePos) {
        let mut inner = self.inner.lock();
        inner.sim_later.insert(features, pos);
    }

    /// Carry an earlier-generation entry into the later generation
    /// (adjacent dedup re-anchoring). Overwrites are allowed.
    pub fn neighbor_add_record(&self, fp: Fingerprint, entry: TableEntry) {
        let mut inner = self.inner.lock();
        inner.fp_later.table.insert(fp, entry);
    }

    /// Pin a delta base into the later generation so it survives rolling.
    /// Extend-if-absent: a base already present is left untouched and
    /// nothing more is accounted.
    pub fn extend_base(&self, fp: Fingerprint, entry: TableEntry) {
        let mut inner = self.inner.lock();
        if !inner.fp_later.table.contains_key(&fp) {
            let charge = entry.ori_length + HEADER_LEN as u64;
            inner.fp_later.table.insert(fp, entry);
            inner.fp_later.migrate_size += charge;
        }
    }

    /// True when `fp` was re-referenced by the version being arranged
    /// (present in the later generation).
    pub fn arrangement_lookup(&self, fp: &Fingerprint) -> bool {
        self.inner.lock().fp_later.table.contains_key(fp)
    }

    /// Promote the later generation to earlier and start an empty later
    /// generation. One atomic step per version boundary.
    pub fn table_rolling(&self) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        inner.fp_earlier.roll_from(&mut inner.fp_later);
        inner.sim_earlier.roll_from(&mut inner.sim_later);
        debug!(
            earlier_entries = inner.fp_earlier.len(),
            "rolled metadata generations"
        );
    }

    /// Remap earlier-generation category orders after an elimination.
    pub fn similarity_table_merge(&self) {
        let mut inner = self.inner.lock();
        inner.sim_earlier.merge_categories();
    }

    /// Logical and migrated sizes of the later generation.
    pub fn later_sizes(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.fp_later.total_size, inner.fp_later.migrate_size)
    }

    /// Entry counts: (earlier, later).
    pub fn generation_lens(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.fp_earlier.len(), inner.fp_later.len())
    }

    /// Fetch an entry from the later generation, if present.
    pub fn later_entry(&self, fp: &Fingerprint) -> Option<TableEntry> {
        self.inner.lock().fp_later.table.get(fp).copied()
    }

    /// Fetch an entry from the earlier generation, if present.
    pub fn earlier_entry(&self, fp: &Fingerprint) -> Option<TableEntry> {
        self.inner.lock().fp_earlier.table.get(fp).copied()
    }

    /// Persist both generations to the kvstore file.
    pub fn save(&self, path: &Path) -> Result<(), IndexError> {
        let inner = self.inner.lock();
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, &*inner)?;
        let file = writer
            .into_inner()
            .map_err(|e| IndexError::Codec(e.to_string()))?;
        file.sync_data()?;
        info!(
            earlier_entries = inner.fp_earlier.len(),
            later_entries = inner.fp_later.len(),
            earlier_total = inner.fp_earlier.total_size,
            later_total = inner.fp_later.total_size,
            "saved metadata index"
        );
        Ok(())
    }

    /// Load both generations from the kvstore file. The in-memory index
    /// must still be empty.
    pub fn load(&self, path: &Path) -> Result<(), IndexError> {
        let mut inner = self.inner.lock();
        if !inner.fp_earlier.is_empty() || !inner.fp_later.is_empty() {
            return Err(IndexError::Corrupt(
                "loading into a non-empty index".into(),
            ));
        }
        let file = File::open(path)?;
        *inner = bincode::deserialize_from(BufReader::new(file))?;
        info!(
            earlier_entries = inner.fp_earlier.len(),
            later_entries = inner.fp_later.len(),
            "loaded metadata index"
        );
        Ok(())
    }
}
