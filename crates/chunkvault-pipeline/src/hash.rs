//! Hashing stage: fingerprint every chunk and forward it in input order.

use chunkvault_core::fingerprint::fingerprint_of;
use crossbeam_channel::{Receiver, Sender};
use tracing::debug;

use crate::error::PipelineError;
use crate::task::{DedupTask, HashTask};

/// Consume the chunk stream, fingerprint each chunk, and forward it to
/// the dedup stage. Returns the number of chunks hashed once the input
/// channel drains.
pub fn run(rx: Receiver<HashTask>, tx: Sender<DedupTask>) -> Result<u64, PipelineError> {
    let mut hashed = 0u64;
    for task in rx {
        let fp = fingerprint_of(&task.chunk.data);
        tx.send(DedupTask {
            chunk: task.chunk,
            fp,
            index: task.index,
        })
        .map_err(|_| PipelineError::stage("dedup"))?;
        hashed += 1;
    }
    debug!(chunks = hashed, "hashing stage drained");
    Ok(hashed)
}
