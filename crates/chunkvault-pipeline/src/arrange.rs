//! Arrangement pass: after a version's ingest, re-sort every older
//! category into the locality-optimal layout for the next restore.
//! Chunks still referenced by the new version stay active in their
//! cohort; everything else is sealed into archived volumes.

use std::fs;
use std::sync::Arc;

use chunkvault_core::block::{BlockHeader, Records};
use chunkvault_core::compression;
use chunkvault_index::metadata::MetadataIndex;
use chunkvault_index::sim_index::BasePos;
use chunkvault_store::layout::{count_cids, Layout};
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::task::{ArrangeTask, FilterTask};

/// Statistics from one arrangement pass.
#[derive(Debug, Default, Clone)]
pub struct ArrangementStats {
    /// Containers read from the old layout.
    pub containers_read: u64,
    /// Payload bytes read.
    pub read_bytes: u64,
    /// Payload bytes rewritten into mixed containers.
    pub rewritten_bytes: u64,
    /// Payload bytes whose container was single-sided and cost no
    /// re-layout write beyond the copy.
    pub skipped_bytes: u64,
    /// Chunks kept active.
    pub active_chunks: u64,
    /// Chunks archived.
    pub archived_chunks: u64,
}

/// Read stage: stream every container of categories `1..=av` of the old
/// layout (including category 1's append overflow) to the filter,
/// unlinking files as they are consumed.
pub fn read_stage(
    layout: Layout,
    av: u64,
    tx: Sender<FilterTask>,
) -> Result<(u64, u64), PipelineError> {
    let mut containers = 0u64;
    let mut bytes = 0u64;
    for category in 1..=av {
        let (n, b) = read_family(
            &tx,
            category as u32,
            |cid| layout.active_container(category, av, cid),
        )?;
        containers += n;
        bytes += b;
        if category == 1 {
            let (n, b) = read_family(&tx, 1, |cid| layout.active_append(1, av, cid))?;
            containers += n;
            bytes += b;
        }
        tx.send(FilterTask::CategoryEnd)
            .map_err(|_| PipelineError::stage("arrangement filter"))?;
        debug!(category, "arrangement category forwarded");
    }
    info!(containers, bytes, "arrangement read stage drained");
    Ok((containers, bytes))
}

fn read_family(
    tx: &Sender<FilterTask>,
    category: u32,
    path_of: impl Fn(u64) -> std::path::PathBuf,
) -> Result<(u64, u64), PipelineError> {
    let mut bytes = 0u64;
    let count = count_cids(&path_of);
    for cid in 0..count {
        let path = path_of(cid);
        let raw = fs::read(&path)?;
        let buffer = compression::decompress(&raw)?;
        bytes += buffer.len() as u64;
        tx.send(FilterTask::Container { buffer, category })
            .map_err(|_| PipelineError::stage("arrangement filter"))?;
        fs::remove_file(&path)?;
    }
    Ok((count, bytes))
}

/// Filter stage: route every record by whether the new version still
/// references its fingerprint. Returns (rewritten, skipped) byte counts:
/// a container contributing to both sides required a true re-layout, a
/// single-sided container was pure copy-through.
pub fn filter_stage(
    index: Arc<MetadataIndex>,
    rx: Receiver<FilterTask>,
    tx: Sender<ArrangeTask>,
) -> Result<(u64, u64), PipelineError> {
    let mut rewritten = 0u64;
    let mut skipped = 0u64;
    for task in rx {
        match task {
            FilterTask::Container { buffer, category } => {
                let mut container_bytes = 0u64;
                let mut any_active = false;
                let mut any_archived = false;
                for record in Records::new(&buffer) {
                    let record = record.map_err(|e| {
                        PipelineError::Format(format!("category {}: {}", category, e))
                    })?;
                    let active = index.arrangement_lookup(&record.header.fp);
                    if active {
                        any_active = true;
                    } else {
                        any_archived = true;
                    }
                    container_bytes += record.header.length;
                    tx.send(ArrangeTask::Record {
                        bytes: record.to_bytes(),
                        active,
                    })
                    .map_err(|_| PipelineError::stage("arrangement write"))?;
                }
                if any_active && any_archived {
                    rewritten += container_bytes;
                } else {
                    skipped += container_bytes;
                }
            }
            FilterTask::CategoryEnd => {
                tx.send(ArrangeTask::CategoryEnd)
                    .map_err(|_| PipelineError::stage("arrangement write"))?;
            }
        }
    }
    info!(rewritten, skipped, "arrangement filter stage drained");
    Ok((rewritten, skipped))
}

struct Cursor {
    buffer: Vec<u8>,
    cid: u64,
}

impl Cursor {
    fn new() -> Self {
        Self {
            buffer: Vec::new(),
            cid: 0,
        }
    }
}

/// Write stage: two output cursors (active at layout version `av + 1`,
/// archived at volume version `av`), each rolling to a new cid whenever
/// its buffer crosses the container size. Active non-delta chunks
/// re-anchor their similarity features at their new position.
pub fn write_stage(
    layout: Layout,
    index: Arc<MetadataIndex>,
    av: u64,
    container_size: u64,
    zstd_level: i32,
    rx: Receiver<ArrangeTask>,
) -> Result<(u64, u64), PipelineError> {
    let mut category = 1u64;
    let mut active = Cursor::new();
    let mut archived = Cursor::new();
    let mut active_chunks = 0u64;
    let mut archived_chunks = 0u64;

    let flush = |cursor: &mut Cursor, category: u64, is_active: bool| -> Result<(), PipelineError> {
        if cursor.buffer.is_empty() {
            return Ok(());
        }
        let compressed = compression::compress(&cursor.buffer, zstd_level)?;
        let path = if is_active {
            layout.active_container(category, av + 1, cursor.cid)
        } else {
            layout.archived_container(category, av, cursor.cid)
        };
        fs::write(&path, &compressed)?;
        let file = fs::File::open(&path)?;
        file.sync_all()?;
        debug!(path = %path.display(), bytes = compressed.len(), "arrangement container written");
        cursor.buffer.clear();
        cursor.cid += 1;
        Ok(())
    };

    for task in rx {
        match task {
            ArrangeTask::Record { bytes, active: keep } => {
                if keep {
                    let header = BlockHeader::decode(&bytes)
                        .map_err(|e| PipelineError::Format(e.to_string()))?;
                    if let Some(features) = header.features() {
                        index.add_similar_feature(
                            &features,
                            BasePos {
                                fp: header.fp,
                                category_order: category as u32,
                                cid: active.cid,
                                length: header.length,
                            },
                        );
                    }
                    active.buffer.extend_from_slice(&bytes);
                    active_chunks += 1;
                    if active.buffer.len() as u64 >= container_size {
                        flush(&mut active, category, true)?;
                    }
                } else {
                    archived.buffer.extend_from_slice(&bytes);
                    archived_chunks += 1;
                    if archived.buffer.len() as u64 >= container_size {
                        flush(&mut archived, category, false)?;
                    }
                }
            }
            ArrangeTask::CategoryEnd => {
                flush(&mut active, category, true)?;
                flush(&mut archived, category, false)?;
                category += 1;
                active.cid = 0;
                archived.cid = 0;
            }
        }
    }
    // The stream always ends on a category boundary; flush defensively.
    flush(&mut active, category, true)?;
    flush(&mut archived, category, false)?;

    info!(active_chunks, archived_chunks, "arrangement write stage drained");
    Ok((active_chunks, archived_chunks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkvault_core::fingerprint::{fingerprint_of, SimilarityFeatures};
    use crossbeam_channel::bounded;

    fn record(payload: &[u8]) -> Vec<u8> {
        let header = BlockHeader::unique(
            fingerprint_of(payload),
            payload.len() as u64,
            SimilarityFeatures::default(),
        );
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn read_stage_consumes_and_unlinks_old_categories() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        layout.ensure_dirs().unwrap();

        let blob = compression::compress(b"records", 1).unwrap();
        std::fs::write(layout.active_container(1, 2, 0), &blob).unwrap();
        std::fs::write(layout.active_append(1, 2, 0), &blob).unwrap();
        std::fs::write(layout.active_container(2, 2, 0), &blob).unwrap();

        let (tx, rx) = bounded(16);
        let (containers, _) = read_stage(layout.clone(), 2, tx).unwrap();
        assert_eq!(containers, 3);

        let tasks: Vec<FilterTask> = rx.iter().collect();
        assert!(matches!(
            tasks[0],
            FilterTask::Container { category: 1, .. }
        ));
        assert!(matches!(
            tasks[1],
            FilterTask::Container { category: 1, .. }
        ));
        assert!(matches!(tasks[2], FilterTask::CategoryEnd));
        assert!(matches!(
            tasks[3],
            FilterTask::Container { category: 2, .. }
        ));
        assert!(matches!(tasks[4], FilterTask::CategoryEnd));

        // The old layout was consumed.
        assert!(!layout.active_container(1, 2, 0).exists());
        assert!(!layout.active_append(1, 2, 0).exists());
        assert!(!layout.active_container(2, 2, 0).exists());
    }

    #[test]
    fn filter_routes_by_later_generation_membership() {
        let index = Arc::new(MetadataIndex::new());
        let live = vec![1u8; 3000];
        let dead = vec![2u8; 3000];
        index.unique_add_record(fingerprint_of(&live), 1, live.len() as u64);

        let mut buffer = record(&live);
        buffer.extend_from_slice(&record(&dead));

        let (filter_tx, filter_rx) = bounded(4);
        let (write_tx, write_rx) = bounded(8);
        filter_tx
            .send(FilterTask::Container {
                buffer,
                category: 1,
            })
            .unwrap();
        filter_tx.send(FilterTask::CategoryEnd).unwrap();
        drop(filter_tx);

        let (rewritten, skipped) = filter_stage(index, filter_rx, write_tx).unwrap();
        // Both sides were touched, so the container counts as rewritten.
        assert_eq!(rewritten, 6000);
        assert_eq!(skipped, 0);

        let tasks: Vec<ArrangeTask> = write_rx.iter().collect();
        match (&tasks[0], &tasks[1], &tasks[2]) {
            (
                ArrangeTask::Record { active: true, .. },
                ArrangeTask::Record { active: false, .. },
                ArrangeTask::CategoryEnd,
            ) => {}
            other => panic!("unexpected routing: {:?}", other),
        }
    }

    #[test]
    fn single_sided_containers_count_as_skipped() {
        let index = Arc::new(MetadataIndex::new());
        let buffer = record(&vec![3u8; 2500]);

        let (filter_tx, filter_rx) = bounded(4);
        let (write_tx, write_rx) = bounded(8);
        filter_tx
            .send(FilterTask::Container {
                buffer,
                category: 1,
            })
            .unwrap();
        drop(filter_tx);

        let (rewritten, skipped) = filter_stage(index, filter_rx, write_tx).unwrap();
        assert_eq!(rewritten, 0);
        assert_eq!(skipped, 2500);
        drop(write_rx);
    }

    #[test]
    fn write_stage_splits_active_and_archived_per_category() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        layout.ensure_dirs().unwrap();
        let index = Arc::new(MetadataIndex::new());

        let (tx, rx) = bounded(8);
        tx.send(ArrangeTask::Record {
            bytes: record(&vec![1u8; 1000]),
            active: true,
        })
        .unwrap();
        tx.send(ArrangeTask::Record {
            bytes: record(&vec![2u8; 1000]),
            active: false,
        })
        .unwrap();
        tx.send(ArrangeTask::CategoryEnd).unwrap();
        drop(tx);

        let (active_chunks, archived_chunks) =
            write_stage(layout.clone(), index.clone(), 1, 1 << 20, 1, rx).unwrap();
        assert_eq!(active_chunks, 1);
        assert_eq!(archived_chunks, 1);

        // Active landed at the new layout version, archived at the old.
        assert!(layout.active_container(1, 2, 0).exists());
        assert!(layout.archived_container(1, 1, 0).exists());

        // The surviving unique chunk re-anchored its features.
        assert!(index
            .similarity_lookup(&SimilarityFeatures::default())
            .is_some());
    }
}
