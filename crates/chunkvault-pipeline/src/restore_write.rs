//! Restore write stage: positioned writes into the pre-sized output
//! file, in-place delta decoding, and an async fdatasync thread.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::thread::JoinHandle;

use chunkvault_core::delta;
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::task::RestoreWriteTask;

/// Writes between fdatasync requests.
const SYNC_INTERVAL: u64 = 1024;

/// Offloads fdatasync so the writer never blocks on durability. Requests
/// are best-effort: one queued sync at a time is enough.
pub struct FileFlusher {
    tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl FileFlusher {
    /// Start the flusher over a duplicated file handle.
    pub fn new(file: File) -> Self {
        let (tx, rx): (Sender<()>, Receiver<()>) = bounded(1);
        let worker = std::thread::spawn(move || {
            for () in rx {
                if let Err(err) = file.sync_data() {
                    warn!(%err, "async fdatasync failed");
                }
            }
        });
        Self {
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    /// Request a sync; silently coalesces with one already queued.
    pub fn request(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(());
        }
    }

    /// Stop the flusher and wait for any in-flight sync.
    pub fn finish(mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for FileFlusher {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Statistics from the restore writer.
#[derive(Debug, Default, Clone)]
pub struct RestoreWriteStats {
    /// Logical size of the restored file.
    pub total_size: u64,
    /// Positioned writes performed.
    pub chunks_written: u64,
    /// Deltas decoded in place.
    pub delta_chunks: u64,
}

/// Drain the write-task stream into `out`. Unique chunks write at their
/// target offsets; a delta's base is staged into the delta's slot first,
/// then the delta reads it back, decodes, and overwrites the slot. A
/// delta arriving before its base parks until the staging write lands.
pub fn write_stage(
    out: &Path,
    rx: Receiver<RestoreWriteTask>,
) -> Result<RestoreWriteStats, PipelineError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(out)?;
    let flusher = FileFlusher::new(file.try_clone()?);
    let mut stats = RestoreWriteStats::default();

    let mut staged: HashSet<u64> = HashSet::new();
    let mut done: HashSet<u64> = HashSet::new();
    let mut parked: HashMap<u64, (Vec<u8>, u64)> = HashMap::new();
    let mut writes = 0u64;

    for task in rx {
        match task {
            RestoreWriteTask::SetSize(size) => {
                file.set_len(size)?;
                stats.total_size = size;
            }
            RestoreWriteTask::Data { bytes, pos } => {
                file.write_all_at(&bytes, pos)?;
                stats.chunks_written += 1;
            }
            RestoreWriteTask::Base { bytes, pos, slot } => {
                if done.contains(&pos) {
                    continue;
                }
                let normalized = delta::normalize(&bytes, slot as usize);
                file.write_all_at(&normalized, pos)?;
                staged.insert(pos);
                if let Some((delta_bytes, ori_length)) = parked.remove(&pos) {
                    decode_in_place(&file, &delta_bytes, pos, ori_length)?;
                    staged.remove(&pos);
                    done.insert(pos);
                    stats.chunks_written += 1;
                    stats.delta_chunks += 1;
                }
            }
            RestoreWriteTask::Delta {
                delta,
                pos,
                ori_length,
            } => {
                if done.contains(&pos) {
                    continue;
                }
                if staged.contains(&pos) {
                    decode_in_place(&file, &delta, pos, ori_length)?;
                    staged.remove(&pos);
                    done.insert(pos);
                    stats.chunks_written += 1;
                    stats.delta_chunks += 1;
                } else {
                    parked.insert(pos, (delta, ori_length));
                }
            }
        }
        writes += 1;
        if writes % SYNC_INTERVAL == 0 {
            flusher.request();
        }
    }

    if !parked.is_empty() {
        return Err(PipelineError::Format(format!(
            "{} delta chunks never saw their base staged",
            parked.len()
        )));
    }
    file.sync_data()?;
    flusher.finish();
    info!(
        chunks = stats.chunks_written,
        deltas = stats.delta_chunks,
        bytes = stats.total_size,
        "restore write stage drained"
    );
    Ok(stats)
}

fn decode_in_place(
    file: &File,
    delta_bytes: &[u8],
    pos: u64,
    ori_length: u64,
) -> Result<(), PipelineError> {
    let mut base = vec![0u8; ori_length as usize];
    file.read_exact_at(&mut base, pos)?;
    let original = delta::decode(delta_bytes, &base, ori_length as usize)?;
    file.write_all_at(&original, pos)?;
    Ok(())
}
