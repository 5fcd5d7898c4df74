//! The store driver: owns the configuration, layout, metadata index,
//! manifest, and base cache, and runs the staged pipelines per version.

use std::path::Path;
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use chunkvault_core::chunker::Chunker;
use chunkvault_core::config::StoreConfig;
use chunkvault_index::manifest::Manifest;
use chunkvault_index::metadata::MetadataIndex;
use chunkvault_store::base_cache::BaseCache;
use chunkvault_store::container::ContainerConstructor;
use chunkvault_store::eliminator::Eliminator;
use chunkvault_store::layout::Layout;
use crossbeam_channel::bounded;
use tracing::info;

use crate::arrange::{self, ArrangementStats};
use crate::dedup::{DedupStage, DedupStats};
use crate::error::PipelineError;
use crate::hash;
use crate::restore::{self, ParseStats};
use crate::restore_write::{self, RestoreWriteStats};
use crate::task::HashTask;
use crate::writer::{self, WriteStats};

/// Everything one `ingest` call did.
#[derive(Debug, Clone)]
pub struct IngestStats {
    /// The version this ingest created.
    pub version: u64,
    /// Chunks delivered by the chunker.
    pub chunks: u64,
    /// Dedup stage accounting.
    pub dedup: DedupStats,
    /// Write stage accounting.
    pub write: WriteStats,
    /// Arrangement accounting; `None` for the first version.
    pub arrangement: Option<ArrangementStats>,
    /// True when the retention pass retired the oldest version.
    pub eliminated: bool,
}

/// Everything one `restore` call did.
#[derive(Debug, Clone)]
pub struct RestoreStats {
    /// Containers read from disk.
    pub containers_read: u64,
    /// Parse stage accounting (restore map, read amplification).
    pub parse: ParseStats,
    /// Write stage accounting.
    pub write: RestoreWriteStats,
}

/// A versioned deduplicating backup store rooted at one directory.
/// `ingest` appends a version; `restore` reconstructs any retained one;
/// `save` persists the metadata index and manifest for the next run.
pub struct Store {
    config: StoreConfig,
    layout: Layout,
    index: Arc<MetadataIndex>,
    manifest: Manifest,
    cache: Option<BaseCache>,
}

impl Store {
    /// Open (or initialize) a store at `config.root`, loading the
    /// manifest and the persisted index when present.
    pub fn open(config: StoreConfig) -> Result<Store, PipelineError> {
        let layout = Layout::new(&config.root);
        layout.ensure_dirs()?;
        let manifest = Manifest::load(&layout.manifest())?;
        let index = Arc::new(MetadataIndex::new());
        if layout.kvstore().exists() {
            index.load(&layout.kvstore())?;
        }
        let cache = BaseCache::new(
            layout.clone(),
            config.cache_bytes,
            config.cache_update_score,
        );
        Ok(Store {
            config,
            layout,
            index,
            manifest,
            cache: Some(cache),
        })
    }

    /// Number of retained versions.
    pub fn total_versions(&self) -> u64 {
        self.manifest.total_version
    }

    /// The store's configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The store's on-disk layout.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// The shared metadata index.
    pub fn index(&self) -> &Arc<MetadataIndex> {
        &self.index
    }

    /// Ingest the contents of `input` as the next version.
    pub fn ingest_file(&mut self, input: &Path) -> Result<IngestStats, PipelineError> {
        let data = std::fs::read(input)?;
        self.ingest(Bytes::from(data))
    }

    /// Ingest one full image as the next version: chunk, fingerprint,
    /// deduplicate, write recipe + containers, then rearrange the older
    /// categories and roll the index generations. Runs the eliminator
    /// when retention is exceeded.
    pub fn ingest(&mut self, data: Bytes) -> Result<IngestStats, PipelineError> {
        let version = self.manifest.total_version + 1;
        info!(version, bytes = data.len(), "ingesting version");

        let chunks = Chunker::with_config(self.config.chunker.clone()).chunk(&data);
        let queue_depth = self.config.queue_depth;

        let (hash_tx, hash_rx) = bounded::<HashTask>(queue_depth);
        let (dedup_tx, dedup_rx) = bounded(queue_depth);
        let (write_tx, write_rx) = bounded(queue_depth);

        let constructor = ContainerConstructor::new(
            self.layout.clone(),
            version,
            self.config.container_size,
            self.config.zstd_level,
        );
        let mut cache = self
            .cache
            .take()
            .ok_or_else(|| PipelineError::stage("base cache lost by an earlier failure"))?;
        cache.begin_version(version, Some(constructor.inflight()));

        let hash_handle = thread::spawn(move || hash::run(hash_rx, dedup_tx));

        let dedup_stage = DedupStage::new(
            self.index.clone(),
            self.config.clone(),
            version,
            cache,
            write_tx,
        );
        let dedup_handle = thread::spawn(move || dedup_stage.run(dedup_rx));

        let write_layout = self.layout.clone();
        let write_handle =
            thread::spawn(move || writer::run(write_rx, &write_layout, version, constructor));

        for (index, chunk) in chunks.into_iter().enumerate() {
            let task = HashTask {
                chunk,
                index: index as u64,
            };
            if hash_tx.send(task).is_err() {
                // A stage died; stop feeding and let the joins report it.
                break;
            }
        }
        drop(hash_tx);

        let hash_result = hash_handle
            .join()
            .map_err(|_| PipelineError::stage("hash"))?;
        let dedup_result = dedup_handle
            .join()
            .map_err(|_| PipelineError::stage("dedup"))?;
        let write_result = write_handle
            .join()
            .map_err(|_| PipelineError::stage("write"))?;

        let (cache, dedup_stats) = dedup_result?;
        self.cache = Some(cache);
        let write_stats = write_result?;
        let chunk_count = hash_result?;

        // Re-sort the older categories for the new version, then promote
        // the generations. The first version has nothing to arrange.
        let arrangement = if version > 1 {
            Some(self.run_arrangement(version - 1)?)
        } else {
            None
        };
        self.index.table_rolling();

        self.manifest.total_version = version;
        self.manifest.save(&self.layout.manifest())?;

        let mut eliminated = false;
        if self.manifest.total_version > self.config.retention {
            Eliminator::new(&self.layout, &self.index).run(self.manifest.total_version)?;
            self.manifest.total_version -= 1;
            self.manifest.save(&self.layout.manifest())?;
            eliminated = true;
        }

        info!(
            version = self.manifest.total_version,
            chunks = chunk_count,
            eliminated,
            "ingest finished"
        );
        Ok(IngestStats {
            version,
            chunks: chunk_count,
            dedup: dedup_stats,
            write: write_stats,
            arrangement,
            eliminated,
        })
    }

    fn run_arrangement(&self, av: u64) -> Result<ArrangementStats, PipelineError> {
        let queue_depth = self.config.queue_depth;
        let (filter_tx, filter_rx) = bounded(queue_depth);
        let (write_tx, write_rx) = bounded(queue_depth);

        let read_layout = self.layout.clone();
        let read_handle = thread::spawn(move || arrange::read_stage(read_layout, av, filter_tx));

        let filter_index = self.index.clone();
        let filter_handle =
            thread::spawn(move || arrange::filter_stage(filter_index, filter_rx, write_tx));

        let write_layout = self.layout.clone();
        let write_index = self.index.clone();
        let container_size = self.config.container_size;
        let zstd_level = self.config.zstd_level;
        let write_handle = thread::spawn(move || {
            arrange::write_stage(
                write_layout,
                write_index,
                av,
                container_size,
                zstd_level,
                write_rx,
            )
        });

        let read_result = read_handle
            .join()
            .map_err(|_| PipelineError::stage("arrangement read"))?;
        let filter_result = filter_handle
            .join()
            .map_err(|_| PipelineError::stage("arrangement filter"))?;
        let write_result = write_handle
            .join()
            .map_err(|_| PipelineError::stage("arrangement write"))?;

        let (active_chunks, archived_chunks) = write_result?;
        let (rewritten_bytes, skipped_bytes) = filter_result?;
        let (containers_read, read_bytes) = read_result?;

        Ok(ArrangementStats {
            containers_read,
            read_bytes,
            rewritten_bytes,
            skipped_bytes,
            active_chunks,
            archived_chunks,
        })
    }

    /// Restore version `target` (1-based among the retained versions)
    /// into the file at `out`.
    pub fn restore(&self, target: u64, out: &Path) -> Result<RestoreStats, PipelineError> {
        let max = self.manifest.total_version;
        if target == 0 || target > max {
            return Err(PipelineError::InvalidRequest(format!(
                "version {} is not retained (store holds 1..={})",
                target, max
            )));
        }
        info!(target, max, out = %out.display(), "restoring version");
        let queue_depth = self.config.queue_depth;

        let (read_tx, read_rx) = bounded(queue_depth);
        let (parse_tx, parse_rx) = bounded(queue_depth);
        let (write_tx, write_rx) = bounded(queue_depth);

        let read_layout = self.layout.clone();
        let read_handle =
            thread::spawn(move || restore::read_stage(read_layout, target, max, read_tx));

        let decom_handle = thread::spawn(move || restore::decom_stage(read_rx, parse_tx));

        let parse_layout = self.layout.clone();
        let parse_handle =
            thread::spawn(move || restore::parse_stage(parse_layout, target, parse_rx, write_tx));

        let out_path = out.to_path_buf();
        let write_handle = thread::spawn(move || restore_write::write_stage(&out_path, write_rx));

        let read_result = read_handle
            .join()
            .map_err(|_| PipelineError::stage("restore read"))?;
        let decom_result = decom_handle
            .join()
            .map_err(|_| PipelineError::stage("restore decompress"))?;
        let parse_result = parse_handle
            .join()
            .map_err(|_| PipelineError::stage("restore parse"))?;
        let write_result = write_handle
            .join()
            .map_err(|_| PipelineError::stage("restore write"))?;

        let parse_stats = parse_result?;
        let write_stats = write_result?;
        decom_result?;
        let (containers_read, _) = read_result?;

        Ok(RestoreStats {
            containers_read,
            parse: parse_stats,
            write: write_stats,
        })
    }

    /// Persist the metadata index and manifest.
    pub fn save(&self) -> Result<(), PipelineError> {
        self.index.save(&self.layout.kvstore())?;
        self.manifest.save(&self.layout.manifest())?;
        Ok(())
    }
}
