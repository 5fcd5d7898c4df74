//! Bounded LRU of decompressed base chunks with container-granular
//! prefetch, used by the dedup stage during delta encoding.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chunkvault_core::block::Records;
use chunkvault_core::compression;
use chunkvault_core::fingerprint::Fingerprint;
use chunkvault_index::sim_index::BasePos;
use tracing::{debug, warn};

use crate::container::InflightContainers;
use crate::error::StoreError;
use crate::layout::Layout;

struct Entry {
    bytes: Arc<Vec<u8>>,
    score: u64,
    last_visit: u64,
}

/// Hit/miss accounting for a version's ingest.
#[derive(Debug, Default, Clone)]
pub struct BaseCacheStats {
    /// Probes that found their base resident.
    pub hits: u64,
    /// Probes that missed.
    pub misses: u64,
    /// Container loads triggered by misses.
    pub loads: u64,
    /// Bytes read from prefetched containers (pre-decompression).
    pub prefetched_bytes: u64,
    /// Bytes inserted into the cache.
    pub written_bytes: u64,
    /// Bytes served from the cache.
    pub read_bytes: u64,
    /// Entries evicted to hold the byte budget.
    pub evictions: u64,
    /// Misses that resolved to the version currently being ingested.
    pub self_hits: u64,
}

impl BaseCacheStats {
    /// Hit rate over all counted probes.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// LRU cache of decompressed base chunks keyed by fingerprint. Eviction
/// is by last-visit sequence, but the sequence only advances every
/// `update_score` successful accesses, which keeps cold scans from
/// thrashing the resident set. A miss loads the base's whole container
/// and inserts every non-delta chunk in it.
pub struct BaseCache {
    layout: Layout,
    budget: u64,
    update_score: u64,
    map: HashMap<Fingerprint, Entry>,
    lru: BTreeMap<u64, Fingerprint>,
    seq: u64,
    total: u64,
    current_version: u64,
    inflight: Option<InflightContainers>,
    stats: BaseCacheStats,
}

impl BaseCache {
    /// An empty cache with the given byte budget and score gate.
    pub fn new(layout: Layout, budget: u64, update_score: u64) -> Self {
        Self {
            layout,
            budget,
            update_score,
            map: HashMap::new(),
            lru: BTreeMap::new(),
            seq: 0,
            total: 0,
            current_version: 0,
            inflight: None,
            stats: BaseCacheStats::default(),
        }
    }

    /// Point the cache at the version being ingested. `inflight` lets the
    /// miss path consume containers the offline writer has not flushed.
    pub fn begin_version(&mut self, version: u64, inflight: Option<InflightContainers>) {
        self.current_version = version;
        self.inflight = inflight;
    }

    /// Cache accounting for this ingest.
    pub fn stats(&self) -> &BaseCacheStats {
        &self.stats
    }

    /// Insert a chunk's bytes, evicting oldest-sequence entries until the
    /// byte budget holds. Re-inserting an existing fingerprint only
    /// refreshes it.
    pub fn add_record(&mut self, fp: Fingerprint, bytes: &[u8]) {
        if self.map.contains_key(&fp) {
            self.refresh(&fp);
            return;
        }
        let entry = Entry {
            bytes: Arc::new(bytes.to_vec()),
            score: 0,
            last_visit: self.seq,
        };
        self.lru.insert(self.seq, fp);
        self.seq += 1;
        self.total += bytes.len() as u64;
        self.stats.written_bytes += bytes.len() as u64;
        self.map.insert(fp, entry);
        while self.total > self.budget {
            let Some((_, victim)) = self.lru.pop_first() else {
                break;
            };
            if let Some(entry) = self.map.remove(&victim) {
                self.total -= entry.bytes.len() as u64;
                self.stats.evictions += 1;
            }
        }
    }

    /// Fetch a resident base and refresh its LRU position.
    pub fn get(&mut self, fp: &Fingerprint) -> Option<Arc<Vec<u8>>> {
        let bytes = self.map.get(fp).map(|e| e.bytes.clone())?;
        self.stats.read_bytes += bytes.len() as u64;
        self.refresh(fp);
        Some(bytes)
    }

    /// Residency probe counted in the hit/miss statistics, without
    /// touching the LRU position.
    pub fn probe(&mut self, fp: &Fingerprint) -> Option<Arc<Vec<u8>>> {
        match self.map.get(fp) {
            Some(entry) => {
                self.stats.hits += 1;
                self.stats.read_bytes += entry.bytes.len() as u64;
                Some(entry.bytes.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Fetch without refreshing or counting; used right after a load.
    pub fn peek(&self, fp: &Fingerprint) -> Option<Arc<Vec<u8>>> {
        self.map.get(fp).map(|e| e.bytes.clone())
    }

    /// Container-granularity prefetch: resolve the base's container file
    /// from its position under the current version's layout, decompress
    /// it, and insert every non-delta chunk it holds.
    pub fn load_container(&mut self, pos: &BasePos) -> Result<(), StoreError> {
        let category = pos.category_order as u64;
        let raw = if category == self.current_version {
            self.stats.self_hits += 1;
            let in_queue = self
                .inflight
                .as_ref()
                .and_then(|inflight| inflight.get(category, self.current_version, pos.cid));
            match in_queue {
                Some(bytes) => {
                    // Already uncompressed in the write-back queue.
                    self.stats.loads += 1;
                    self.stats.prefetched_bytes += bytes.len() as u64;
                    self.scan_container(&bytes);
                    return Ok(());
                }
                None => std::fs::read(self.layout.active_container(
                    category,
                    self.current_version,
                    pos.cid,
                ))?,
            }
        } else if category > 0 {
            std::fs::read(
                self.layout
                    .active_container(category, self.current_version - 1, pos.cid),
            )?
        } else {
            std::fs::read(
                self.layout
                    .active_append(1, self.current_version - 1, pos.cid),
            )?
        };

        self.stats.loads += 1;
        self.stats.prefetched_bytes += raw.len() as u64;
        let decompressed = compression::decompress(&raw)?;
        if (pos.length as usize) > decompressed.len() {
            return Err(StoreError::Format(format!(
                "base of {} bytes cannot live in a {}-byte container",
                pos.length,
                decompressed.len()
            )));
        }
        self.scan_container(&decompressed);
        Ok(())
    }

    fn scan_container(&mut self, buffer: &[u8]) {
        for record in Records::new(buffer) {
            let Ok(record) = record else {
                break;
            };
            if !record.header.is_delta() {
                self.add_record(record.header.fp, record.payload);
            }
        }
        debug!(bytes = buffer.len(), resident = self.map.len(), "container scanned into cache");
    }

    /// Pick a base among the six candidates: any resident candidate wins;
    /// otherwise the first candidate's container is loaded and retried.
    /// Returns `None` when no candidate is valid or the load did not
    /// surface the base (the caller downgrades the chunk to unique).
    pub fn get_record_batch(
        &mut self,
        candidates: &[Option<BasePos>; 6],
    ) -> Result<Option<(BasePos, Arc<Vec<u8>>)>, StoreError> {
        let mut first_valid = None;
        for candidate in candidates.iter().flatten() {
            if first_valid.is_none() {
                first_valid = Some(*candidate);
            }
            if let Some(bytes) = self.probe(&candidate.fp) {
                self.refresh(&candidate.fp);
                return Ok(Some((*candidate, bytes)));
            }
        }
        let Some(chosen) = first_valid else {
            return Ok(None);
        };
        self.load_container(&chosen)?;
        match self.peek(&chosen.fp) {
            Some(bytes) => {
                self.refresh(&chosen.fp);
                Ok(Some((chosen, bytes)))
            }
            None => {
                warn!(base = %chosen.fp, "base absent from its prefetched container");
                Ok(None)
            }
        }
    }

    fn refresh(&mut self, fp: &Fingerprint) {
        let Some(entry) = self.map.get_mut(fp) else {
            return;
        };
        entry.score += 1;
        if entry.score > self.update_score {
            entry.score = 0;
            self.lru.remove(&entry.last_visit);
            entry.last_visit = self.seq;
            self.lru.insert(self.seq, *fp);
            self.seq += 1;
        }
    }
}
