//! Container construction for the active category of the version being
//! ingested, with an offline compress → write chain so the foreground
//! write stage never blocks on compression or disk.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::sync::Arc;
use std::thread::JoinHandle;

use chunkvault_core::compression;
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::layout::Layout;

/// Depth of the offline chain's queues; flushes are rare, so a short
/// queue bounds memory without stalling the foreground.
const OFFLINE_QUEUE_DEPTH: usize = 8;

/// Statistics from one version's container stream.
#[derive(Debug, Default, Clone)]
pub struct ContainerStats {
    /// Containers sealed and written.
    pub containers: u64,
    /// Bytes handed to the compressor.
    pub bytes_before_compression: u64,
    /// Bytes written to disk.
    pub bytes_after_compression: u64,
}

struct SealTask {
    cid: u64,
    bytes: Arc<Vec<u8>>,
}

struct FlushTask {
    cid: u64,
    compressed: Vec<u8>,
}

/// Read-side handle over containers still in the write-back queue.
/// Cloned into the base cache so a self-referencing base can be served
/// before its container reaches the disk.
#[derive(Debug, Clone)]
pub struct InflightContainers {
    version: u64,
    inner: Arc<Mutex<HashMap<u64, Arc<Vec<u8>>>>>,
}

impl InflightContainers {
    fn new(version: u64) -> Self {
        Self {
            version,
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Uncompressed bytes of container `(c, v, cid)` if it belongs to the
    /// current version and has not been written yet.
    pub fn get(&self, c: u64, v: u64, cid: u64) -> Option<Arc<Vec<u8>>> {
        if c != self.version || v != self.version {
            return None;
        }
        self.inner.lock().get(&cid).cloned()
    }
}

/// Buffers `(header, payload)` records up to the container size, then
/// seals the buffer into the offline chain: a compressor thread runs the
/// container codec, a writer thread persists and fsyncs the file and
/// retires it from the in-flight registry. Buffer memory is freed by
/// ownership once the writer drops the task.
pub struct ContainerConstructor {
    buffer: Vec<u8>,
    container_size: u64,
    version: u64,
    cid: u64,
    inflight: InflightContainers,
    seal_tx: Option<Sender<SealTask>>,
    compressor: Option<JoinHandle<Result<(), StoreError>>>,
    writer: Option<JoinHandle<Result<ContainerStats, StoreError>>>,
}

impl ContainerConstructor {
    /// Start the offline chain for the active category of `version`.
    pub fn new(layout: Layout, version: u64, container_size: u64, zstd_level: i32) -> Self {
        let inflight = InflightContainers::new(version);
        let (seal_tx, seal_rx) = bounded::<SealTask>(OFFLINE_QUEUE_DEPTH);
        let (flush_tx, flush_rx) = bounded::<FlushTask>(OFFLINE_QUEUE_DEPTH);

        let compressor = std::thread::spawn(move || -> Result<(), StoreError> {
            for task in seal_rx {
                let compressed = compression::compress(&task.bytes, zstd_level)?;
                if flush_tx
                    .send(FlushTask {
                        cid: task.cid,
                        compressed,
                    })
                    .is_err()
                {
                    return Err(StoreError::WorkerLost("container writer".into()));
                }
            }
            Ok(())
        });

        let registry = inflight.clone();
        let writer = std::thread::spawn(move || -> Result<ContainerStats, StoreError> {
            let mut stats = ContainerStats::default();
            for task in flush_rx {
                let path = layout.active_container(version, version, task.cid);
                let mut file = File::create(&path)?;
                file.write_all(&task.compressed)?;
                file.sync_all()?;
                let uncompressed = registry
                    .inner
                    .lock()
                    .remove(&task.cid)
                    .map(|b| b.len() as u64)
                    .unwrap_or(0);
                stats.containers += 1;
                stats.bytes_before_compression += uncompressed;
                stats.bytes_after_compression += task.compressed.len() as u64;
                debug!(cid = task.cid, bytes = task.compressed.len(), "container written");
            }
            Ok(stats)
        });

        Self {
            buffer: Vec::with_capacity(container_size as usize + container_size as usize / 5),
            container_size,
            version,
            cid: 0,
            inflight,
            seal_tx: Some(seal_tx),
            compressor: Some(compressor),
            writer: Some(writer),
        }
    }

    /// Handle for readers that may race the offline writer.
    pub fn inflight(&self) -> InflightContainers {
        self.inflight.clone()
    }

    /// Append one header + payload record. A record landing on or past
    /// the container boundary stays whole in the current container; the
    /// next record starts a fresh cid.
    pub fn write_class(&mut self, header: &[u8], payload: &[u8]) -> Result<(), StoreError> {
        self.buffer.extend_from_slice(header);
        self.buffer.extend_from_slice(payload);
        if self.buffer.len() as u64 >= self.container_size {
            self.seal()?;
        }
        Ok(())
    }

    fn seal(&mut self) -> Result<(), StoreError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let bytes = Arc::new(std::mem::take(&mut self.buffer));
        self.inflight.inner.lock().insert(self.cid, bytes.clone());
        let tx = self
            .seal_tx
            .as_ref()
            .ok_or_else(|| StoreError::WorkerLost("container chain closed".into()))?;
        tx.send(SealTask {
            cid: self.cid,
            bytes,
        })
        .map_err(|_| StoreError::WorkerLost("container compressor".into()))?;
        self.cid += 1;
        Ok(())
    }

    /// Seal the partial container and drain the offline chain. Returns
    /// once every container of this version is durably on disk.
    pub fn finish(mut self) -> Result<ContainerStats, StoreError> {
        self.seal()?;
        drop(self.seal_tx.take());
        let compressor = self
            .compressor
            .take()
            .ok_or_else(|| StoreError::WorkerLost("container compressor".into()))?;
        let writer = self
            .writer
            .take()
            .ok_or_else(|| StoreError::WorkerLost("container writer".into()))?;
        compressor
            .join()
            .map_err(|_| StoreError::WorkerLost("container compressor".into()))??;
        let stats = writer
            .join()
            .map_err(|_| StoreError::WorkerLost("container writer".into()))??;
        info!(
            version = self.version,
            containers = stats.containers,
            before = stats.bytes_before_compression,
            after = stats.bytes_after_compression,
            "container stream finished"
        );
        Ok(stats)
    }
}
