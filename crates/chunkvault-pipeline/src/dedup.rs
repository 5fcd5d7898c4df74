//! Dedup stage: classify chunks against the two-generation index in
//! segment batches, cap cold delta bases, encode deltas, and emit write
//! tasks in input order.

use std::collections::HashMap;
use std::sync::Arc;

use chunkvault_core::block::HEADER_LEN;
use chunkvault_core::config::StoreConfig;
use chunkvault_core::delta;
use chunkvault_core::fingerprint::SimilarityFeatures;
use chunkvault_core::odess::OdessSampler;
use chunkvault_index::fp_index::{LookupResult, TableEntry};
use chunkvault_index::metadata::MetadataIndex;
use chunkvault_index::sim_index::BasePos;
use chunkvault_store::base_cache::{BaseCache, BaseCacheStats};
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::task::{DedupTask, WriteTask};

/// Per-version statistics from the dedup stage.
#[derive(Debug, Default, Clone)]
pub struct DedupStats {
    /// Bytes classified.
    pub total_bytes: u64,
    /// Chunks emitted as unique (including delta-downgrades).
    pub unique_chunks: u64,
    /// Chunks deduplicated within this version.
    pub internal_chunks: u64,
    /// Chunks deduplicated against the previous version.
    pub adjacent_chunks: u64,
    /// Chunks reduced to deltas.
    pub delta_chunks: u64,
    /// Bytes that reached the unique/delta path (pre-delta sizes).
    pub unique_bytes: u64,
    /// Bytes deduplicated against the previous version.
    pub adjacent_bytes: u64,
    /// Bytes saved by delta encoding.
    pub delta_reduced_bytes: u64,
    /// Delta intents rejected by capping.
    pub capping_rejects: u64,
    /// Delta encodes that failed or produced no saving.
    pub delta_failures: u64,
    /// Base cache accounting for this version.
    pub cache: BaseCacheStats,
}

impl DedupStats {
    /// Classified bytes over stored bytes (after dedup and delta).
    pub fn dedup_ratio(&self) -> f64 {
        let stored = self.unique_bytes.saturating_sub(self.delta_reduced_bytes);
        if stored == 0 {
            f64::INFINITY
        } else {
            self.total_bytes as f64 / stored as f64
        }
    }
}

struct Pending {
    task: DedupTask,
    similar: bool,
    features: Option<SimilarityFeatures>,
    base: Option<BasePos>,
    in_cache: bool,
    reject: bool,
}

/// The dedup stage worker. Owns the base cache for the duration of one
/// version and hands it back with the statistics when the input drains.
pub struct DedupStage {
    index: Arc<MetadataIndex>,
    config: StoreConfig,
    version: u64,
    cache: BaseCache,
    sampler: OdessSampler,
    out: Sender<WriteTask>,
    stats: DedupStats,
    category_bytes: u64,
    current_cid: u64,
}

impl DedupStage {
    /// Build the stage for one version's ingest.
    pub fn new(
        index: Arc<MetadataIndex>,
        config: StoreConfig,
        version: u64,
        cache: BaseCache,
        out: Sender<WriteTask>,
    ) -> Self {
        let sampler = OdessSampler::new(config.odess_hash);
        Self {
            index,
            config,
            version,
            cache,
            sampler,
            out,
            stats: DedupStats::default(),
            category_bytes: 0,
            current_cid: 0,
        }
    }

    /// Drain the chunk stream in segment batches. Within a segment chunks
    /// are classified in input order and emitted in input order; the
    /// capping decision sees the whole segment before any delta encodes.
    pub fn run(mut self, rx: Receiver<DedupTask>) -> Result<(BaseCache, DedupStats), PipelineError> {
        let mut segment: Vec<Pending> = Vec::new();
        let mut segment_bytes = 0u64;

        for task in rx {
            segment_bytes += task.chunk.len();
            segment.push(Pending {
                task,
                similar: false,
                features: None,
                base: None,
                in_cache: false,
                reject: false,
            });
            if segment_bytes > self.config.segment_bytes {
                self.process_segment(&mut segment)?;
                segment_bytes = 0;
            }
        }
        if !segment.is_empty() {
            self.process_segment(&mut segment)?;
        }

        self.stats.cache = self.cache.stats().clone();
        debug!(
            unique = self.stats.unique_chunks,
            internal = self.stats.internal_chunks,
            adjacent = self.stats.adjacent_chunks,
            delta = self.stats.delta_chunks,
            "dedup stage drained"
        );
        Ok((self.cache, self.stats))
    }

    fn process_segment(&mut self, segment: &mut Vec<Pending>) -> Result<(), PipelineError> {
        self.classify_waiting_list(segment);
        self.cap_base_chunks(segment);
        self.emit(segment)?;
        segment.clear();
        Ok(())
    }

    /// First pass: non-charging classification plus similarity probing
    /// for would-be unique chunks.
    fn classify_waiting_list(&mut self, segment: &mut [Pending]) {
        for pending in segment.iter_mut() {
            if !matches!(
                self.index.peek_lookup(&pending.task.fp),
                LookupResult::Unique
            ) {
                continue;
            }
            let features = self.sampler.features(&pending.task.chunk.data);
            pending.features = Some(features);
            if !self.config.delta_enabled {
                continue;
            }
            if let Some(pos) = self.index.similarity_lookup(&features) {
                pending.similar = true;
                pending.base = Some(pos);
                pending.in_cache = self.cache.probe(&pos.fp).is_some();
            }
        }
    }

    /// Second pass: tally uncached base containers across the segment and
    /// reject delta intents against bases referenced fewer than the
    /// capping threshold times. A cold base is not worth a
    /// container-granular prefetch at restore time.
    fn cap_base_chunks(&mut self, segment: &mut [Pending]) {
        let mut references: HashMap<(u32, u64), u64> = HashMap::new();
        for pending in segment.iter() {
            if pending.similar && !pending.in_cache {
                if let Some(pos) = &pending.base {
                    *references
                        .entry((pos.category_order, pos.cid))
                        .or_insert(0) += 1;
                }
            }
        }
        for pending in segment.iter_mut() {
            if pending.similar && !pending.in_cache {
                if let Some(pos) = &pending.base {
                    if references[&(pos.category_order, pos.cid)] < self.config.capping_threshold {
                        pending.reject = true;
                    }
                }
            }
        }
    }

    /// Third pass: charge, record, encode, and emit in input order.
    fn emit(&mut self, segment: &mut Vec<Pending>) -> Result<(), PipelineError> {
        // Drain preserving order; each chunk re-classifies under the
        // charging lookup so intra-segment duplicates turn internal.
        for pending in segment.drain(..) {
            let length = pending.task.chunk.len();
            self.stats.total_bytes += length;
            match self.index.dedup_lookup(&pending.task.fp, length) {
                LookupResult::Unique => self.emit_unique(pending)?,
                LookupResult::InternalDedup => {
                    self.stats.internal_chunks += 1;
                    self.send(WriteTask::Internal {
                        fp: pending.task.fp,
                        length,
                    })?;
                }
                LookupResult::InternalDeltaDedup(entry) => {
                    self.stats.internal_chunks += 1;
                    self.send(match entry.base {
                        Some(base) => WriteTask::InternalDelta {
                            fp: pending.task.fp,
                            length: entry.length,
                            ori_length: entry.ori_length,
                            base,
                        },
                        None => WriteTask::Internal {
                            fp: pending.task.fp,
                            length,
                        },
                    })?;
                }
                LookupResult::AdjacentDedup(entry) => self.emit_adjacent(pending, entry)?,
            }
        }
        Ok(())
    }

    fn emit_unique(&mut self, pending: Pending) -> Result<(), PipelineError> {
        let fp = pending.task.fp;
        let length = pending.task.chunk.len();
        let features = pending.features.unwrap_or_default();

        if self.config.delta_enabled && pending.similar && !pending.reject {
            if let Some((base_pos, delta_bytes)) = self.try_delta(&pending, &features)? {
                self.index.delta_add_record(
                    fp,
                    self.version as u32,
                    base_pos.fp,
                    delta_bytes.len() as u64,
                    length,
                );
                // Pin the base so it survives the rolling.
                self.index.extend_base(
                    base_pos.fp,
                    TableEntry::unique(base_pos.category_order, base_pos.length),
                );
                self.stats.delta_chunks += 1;
                self.stats.unique_bytes += length;
                self.stats.delta_reduced_bytes += length - delta_bytes.len() as u64;
                self.account_category(delta_bytes.len() as u64);
                return self.send(WriteTask::Similar {
                    fp,
                    delta: delta_bytes,
                    ori_length: length,
                    base: base_pos.fp,
                });
            }
        }

        if pending.reject {
            self.stats.capping_rejects += 1;
        }
        self.index.unique_add_record(fp, self.version as u32, length);
        self.index.add_similar_feature(
            &features,
            BasePos {
                fp,
                category_order: self.version as u32,
                cid: self.current_cid,
                length,
            },
        );
        self.cache.add_record(fp, &pending.task.chunk.data);
        self.stats.unique_chunks += 1;
        self.stats.unique_bytes += length;
        self.account_category(length);
        self.send(WriteTask::Unique {
            fp,
            data: pending.task.chunk.data,
            features,
        })
    }

    /// Fetch a base (batch selection over all six candidates, loading the
    /// first valid candidate's container on a full miss) and encode the
    /// chunk against it. `None` means the chunk falls through to unique.
    fn try_delta(
        &mut self,
        pending: &Pending,
        features: &SimilarityFeatures,
    ) -> Result<Option<(BasePos, Vec<u8>)>, PipelineError> {
        let candidates = self.index.similarity_lookup_all(features);
        let Some((base_pos, base_bytes)) = self.cache.get_record_batch(&candidates)? else {
            self.stats.delta_failures += 1;
            return Ok(None);
        };
        match delta::encode(
            &pending.task.chunk.data,
            &base_bytes,
            self.config.zstd_level,
        ) {
            Ok(delta_bytes) if (delta_bytes.len() as u64) < pending.task.chunk.len() => {
                Ok(Some((base_pos, delta_bytes)))
            }
            Ok(_) => {
                self.stats.delta_failures += 1;
                Ok(None)
            }
            Err(err) => {
                warn!(chunk = %pending.task.fp, %err, "delta encode failed, keeping chunk unique");
                self.stats.delta_failures += 1;
                Ok(None)
            }
        }
    }

    fn emit_adjacent(&mut self, pending: Pending, entry: TableEntry) -> Result<(), PipelineError> {
        let fp = pending.task.fp;
        let length = pending.task.chunk.len();
        self.stats.adjacent_chunks += 1;
        self.stats.adjacent_bytes += length;
        self.index.neighbor_add_record(fp, entry);
        match entry.base {
            Some(base) => {
                // The adjacent chunk is a stored delta: pin its base too,
                // so arrangement keeps the base active.
                self.index
                    .neighbor_add_record(base, TableEntry::unique(entry.category_order, 0));
                self.send(WriteTask::AdjacentDelta {
                    fp,
                    length: entry.length,
                    ori_length: entry.ori_length,
                    base,
                })
            }
            None => self.send(WriteTask::Adjacent { fp, length }),
        }
    }

    /// Mirror the container constructor's cid arithmetic so similarity
    /// features anchor at the cid their chunk will land in.
    fn account_category(&mut self, payload_len: u64) {
        self.category_bytes += payload_len + HEADER_LEN as u64;
        if self.category_bytes >= self.config.container_size {
            self.category_bytes = 0;
            self.current_cid += 1;
        }
    }

    fn send(&self, task: WriteTask) -> Result<(), PipelineError> {
        self.out.send(task).map_err(|_| PipelineError::stage("write"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chunkvault_core::chunker::ChunkDescriptor;
    use chunkvault_core::fingerprint::{fingerprint_of, Fingerprint};
    use chunkvault_core::rollhash::HashKind;
    use chunkvault_store::layout::Layout;
    use crossbeam_channel::bounded;

    fn task(data: &[u8], index: u64) -> DedupTask {
        DedupTask {
            chunk: ChunkDescriptor {
                data: Bytes::copy_from_slice(data),
                offset: index * 8192,
            },
            fp: fingerprint_of(data),
            index,
        }
    }

    fn task_with_fp(fp: Fingerprint, data: &[u8], index: u64) -> DedupTask {
        DedupTask {
            chunk: ChunkDescriptor {
                data: Bytes::copy_from_slice(data),
                offset: index * 8192,
            },
            fp,
            index,
        }
    }

    fn run_stage(
        index: Arc<MetadataIndex>,
        config: StoreConfig,
        cache: BaseCache,
        tasks: Vec<DedupTask>,
    ) -> (Vec<WriteTask>, DedupStats) {
        let (in_tx, in_rx) = bounded(256);
        let (out_tx, out_rx) = bounded(256);
        for t in tasks {
            in_tx.send(t).unwrap();
        }
        drop(in_tx);
        let stage = DedupStage::new(index, config, 2, cache, out_tx);
        let (_, stats) = stage.run(in_rx).unwrap();
        (out_rx.iter().collect(), stats)
    }

    fn fresh_cache(config: &StoreConfig, dir: &tempfile::TempDir) -> BaseCache {
        BaseCache::new(
            Layout::new(dir.path()),
            config.cache_bytes,
            config.cache_update_score,
        )
    }

    #[test]
    fn duplicates_within_a_version_turn_internal() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(MetadataIndex::new());
        let config = StoreConfig::new(dir.path());
        let cache = fresh_cache(&config, &dir);

        let a = vec![1u8; 4096];
        let b = vec![2u8; 4096];
        let (tasks, stats) = run_stage(
            index,
            config,
            cache,
            vec![task(&a, 0), task(&a, 1), task(&b, 2)],
        );

        assert_eq!(stats.unique_chunks, 2);
        assert_eq!(stats.internal_chunks, 1);
        assert!(matches!(tasks[0], WriteTask::Unique { .. }));
        assert!(matches!(tasks[1], WriteTask::Internal { .. }));
        assert!(matches!(tasks[2], WriteTask::Unique { .. }));
    }

    #[test]
    fn previous_version_chunks_turn_adjacent() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(MetadataIndex::new());
        let config = StoreConfig::new(dir.path());
        let cache = fresh_cache(&config, &dir);

        let a = vec![3u8; 4096];
        index.unique_add_record(fingerprint_of(&a), 1, 4096);
        index.table_rolling();

        let (tasks, stats) = run_stage(index.clone(), config, cache, vec![task(&a, 0)]);
        assert_eq!(stats.adjacent_chunks, 1);
        assert!(matches!(tasks[0], WriteTask::Adjacent { .. }));
        // The adjacent chunk was re-anchored into the later generation.
        assert!(index.later_entry(&fingerprint_of(&a)).is_some());
    }

    #[test]
    fn adjacent_delta_repins_its_base() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(MetadataIndex::new());
        let config = StoreConfig::new(dir.path());
        let cache = fresh_cache(&config, &dir);

        let delta_fp = fingerprint_of(b"stored delta");
        let base_fp = fingerprint_of(b"its base");
        index.unique_add_record(base_fp, 1, 8192);
        index.delta_add_record(delta_fp, 1, base_fp, 400, 8192);
        index.table_rolling();

        let (tasks, stats) = run_stage(
            index.clone(),
            config,
            cache,
            vec![task_with_fp(delta_fp, &[0u8; 8192], 0)],
        );

        assert_eq!(stats.adjacent_chunks, 1);
        match &tasks[0] {
            WriteTask::AdjacentDelta { base, length, ori_length, .. } => {
                assert_eq!(*base, base_fp);
                assert_eq!(*length, 400);
                assert_eq!(*ori_length, 8192);
            }
            other => panic!("expected adjacent delta, got {:?}", other),
        }
        // Both the delta and its base survive into the later generation.
        assert!(index.later_entry(&delta_fp).is_some());
        assert!(index.later_entry(&base_fp).is_some());
    }

    #[test]
    fn uncached_cold_base_is_capped_to_unique() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(MetadataIndex::new());
        let mut config = StoreConfig::new(dir.path());
        config.capping_threshold = 2;
        let cache = fresh_cache(&config, &dir);

        let chunk = vec![7u8; 8192];
        let base_fp = fingerprint_of(b"cold base");
        // Register the chunk's own features as pointing at the base, so
        // the similarity probe is deterministic.
        let features = OdessSampler::new(HashKind::Gear).features(&chunk);
        index.add_similar_feature(
            &features,
            BasePos {
                fp: base_fp,
                category_order: 1,
                cid: 0,
                length: 8192,
            },
        );
        index.table_rolling();

        let (tasks, stats) = run_stage(index, config, cache, vec![task(&chunk, 0)]);
        assert_eq!(stats.capping_rejects, 1);
        assert_eq!(stats.delta_chunks, 0);
        assert!(matches!(tasks[0], WriteTask::Unique { .. }));
    }

    #[test]
    fn cached_base_encodes_a_delta_and_pins_the_base() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(MetadataIndex::new());
        let config = StoreConfig::new(dir.path());
        let mut cache = fresh_cache(&config, &dir);

        let base = vec![5u8; 8192];
        let mut chunk = base.clone();
        chunk[8000] = 0;
        let base_fp = fingerprint_of(&base);
        cache.add_record(base_fp, &base);

        let features = OdessSampler::new(HashKind::Gear).features(&chunk);
        index.add_similar_feature(
            &features,
            BasePos {
                fp: base_fp,
                category_order: 1,
                cid: 0,
                length: 8192,
            },
        );
        index.table_rolling();

        let chunk_fp = fingerprint_of(&chunk);
        let (tasks, stats) = run_stage(index.clone(), config, cache, vec![task(&chunk, 0)]);

        assert_eq!(stats.delta_chunks, 1);
        assert_eq!(stats.capping_rejects, 0);
        match &tasks[0] {
            WriteTask::Similar { fp, base, ori_length, delta } => {
                assert_eq!(*fp, chunk_fp);
                assert_eq!(*base, base_fp);
                assert_eq!(*ori_length, 8192);
                assert!(delta.len() < 8192);
            }
            other => panic!("expected a delta, got {:?}", other),
        }
        let entry = index.later_entry(&chunk_fp).unwrap();
        assert_eq!(entry.base, Some(base_fp));
        // The pinned base is a non-delta entry: no delta chains.
        assert_eq!(index.later_entry(&base_fp).unwrap().base, None);
    }
}
