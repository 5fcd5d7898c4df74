//! Restore read, decompress, and parse stages: compute the file set for
//! a target version, stream containers through decompression, and turn
//! the recipe plus container records into positioned write tasks.

use std::collections::HashMap;
use std::fs;

use chunkvault_core::block::{BlockHeader, HeaderAux, Record, Records, HEADER_LEN};
use chunkvault_core::compression;
use chunkvault_core::fingerprint::Fingerprint;
use chunkvault_store::layout::{count_cids, Layout};
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::task::{CompressedContainer, ContainerBuffer, RestoreWriteTask};

/// Read stage: archived volumes for versions `target..max` first, then
/// active categories in ascending cohort order, the append overflow of
/// category 1 ahead of its main family. Containers within a family are
/// iterated in reverse cid order, matching how arrangement appends; the
/// writer parks any delta that outruns its base, so ordering here is a
/// locality heuristic rather than a correctness requirement.
pub fn read_stage(
    layout: Layout,
    target: u64,
    max: u64,
    tx: Sender<CompressedContainer>,
) -> Result<(u64, u64), PipelineError> {
    let mut containers = 0u64;
    let mut bytes = 0u64;

    for version in target..max {
        for category in 1..=target {
            let count = count_cids(|cid| layout.archived_container(category, version, cid));
            for cid in (0..count).rev() {
                let raw = fs::read(layout.archived_container(category, version, cid))?;
                containers += 1;
                bytes += raw.len() as u64;
                tx.send(CompressedContainer { bytes: raw })
                    .map_err(|_| PipelineError::stage("restore decompress"))?;
            }
        }
        debug!(version, "archived volumes forwarded");
    }

    for category in 1..=target {
        if category == 1 {
            let count = count_cids(|cid| layout.active_append(1, max, cid));
            for cid in (0..count).rev() {
                let raw = fs::read(layout.active_append(1, max, cid))?;
                containers += 1;
                bytes += raw.len() as u64;
                tx.send(CompressedContainer { bytes: raw })
                    .map_err(|_| PipelineError::stage("restore decompress"))?;
            }
        }
        let count = count_cids(|cid| layout.active_container(category, max, cid));
        for cid in (0..count).rev() {
            let raw = fs::read(layout.active_container(category, max, cid))?;
            containers += 1;
            bytes += raw.len() as u64;
            tx.send(CompressedContainer { bytes: raw })
                .map_err(|_| PipelineError::stage("restore decompress"))?;
        }
    }

    info!(containers, bytes, "restore read stage drained");
    Ok((containers, bytes))
}

/// Decompress stage: one container at a time, preserving order.
pub fn decom_stage(
    rx: Receiver<CompressedContainer>,
    tx: Sender<ContainerBuffer>,
) -> Result<u64, PipelineError> {
    let mut bytes = 0u64;
    for task in rx {
        let decompressed = compression::decompress(&task.bytes)?;
        bytes += decompressed.len() as u64;
        tx.send(ContainerBuffer {
            bytes: decompressed,
            compressed_len: task.bytes.len() as u64,
        })
        .map_err(|_| PipelineError::stage("restore parse"))?;
    }
    Ok(bytes)
}

/// How a chunk's bytes serve one target position of the restore.
#[derive(Debug, Clone, Copy)]
enum Role {
    /// The chunk is written as-is.
    Data,
    /// The chunk is the base of a delta: staged into the delta's slot.
    Base { slot: u64 },
    /// The chunk is a stored delta decoded in place.
    Delta { ori_length: u64 },
}

#[derive(Debug, Clone, Copy)]
struct MapEntry {
    pos: u64,
    role: Role,
}

/// Statistics from the parse stage.
#[derive(Debug, Default, Clone)]
pub struct ParseStats {
    /// Logical size of the restored version.
    pub total_size: u64,
    /// Recipe records parsed.
    pub recipe_records: u64,
    /// Containers consumed.
    pub containers: u64,
    /// Compressed bytes consumed (for read amplification).
    pub compressed_bytes: u64,
    /// Write tasks emitted.
    pub writes_emitted: u64,
}

impl ParseStats {
    /// Compressed bytes read per logical byte restored.
    pub fn read_amplification(&self) -> f64 {
        if self.total_size == 0 {
            0.0
        } else {
            self.compressed_bytes as f64 / self.total_size as f64
        }
    }
}

/// Parse stage: build the restore map from the target's recipe, pre-size
/// the output, then resolve every container record against the map.
/// Within a container, unique records are emitted before delta records
/// so intra-container deltas find their base already staged.
pub fn parse_stage(
    layout: Layout,
    target: u64,
    rx: Receiver<ContainerBuffer>,
    tx: Sender<RestoreWriteTask>,
) -> Result<ParseStats, PipelineError> {
    let mut stats = ParseStats::default();
    let recipe = fs::read(layout.recipe(target))?;
    if recipe.len() % HEADER_LEN != 0 {
        return Err(PipelineError::Format(format!(
            "recipe of {} bytes is not a whole number of records",
            recipe.len()
        )));
    }

    let mut map: HashMap<Fingerprint, Vec<MapEntry>> = HashMap::new();
    let mut pos = 0u64;
    for raw in recipe.chunks(HEADER_LEN) {
        let header = BlockHeader::decode(raw).map_err(|e| PipelineError::Format(e.to_string()))?;
        match header.aux {
            HeaderAux::Base(base) => {
                map.entry(base).or_default().push(MapEntry {
                    pos,
                    role: Role::Base {
                        slot: header.ori_length,
                    },
                });
                map.entry(header.fp).or_default().push(MapEntry {
                    pos,
                    role: Role::Delta {
                        ori_length: header.ori_length,
                    },
                });
                pos += header.ori_length;
            }
            HeaderAux::Features(_) => {
                map.entry(header.fp).or_default().push(MapEntry {
                    pos,
                    role: Role::Data,
                });
                pos += header.length;
            }
        }
        stats.recipe_records += 1;
    }
    stats.total_size = pos;
    info!(
        records = stats.recipe_records,
        total_size = pos,
        "restore map built"
    );
    tx.send(RestoreWriteTask::SetSize(pos))
        .map_err(|_| PipelineError::stage("restore write"))?;

    for container in rx {
        stats.containers += 1;
        stats.compressed_bytes += container.compressed_len;
        let buffer = container.bytes;

        let mut uniques: Vec<Record> = Vec::new();
        let mut deltas: Vec<Record> = Vec::new();
        for record in Records::new(&buffer) {
            let record = record.map_err(|e| PipelineError::Format(e.to_string()))?;
            if record.header.is_delta() {
                deltas.push(record);
            } else {
                uniques.push(record);
            }
        }

        for record in uniques.iter().chain(deltas.iter()) {
            let Some(entries) = map.get(&record.header.fp) else {
                return Err(PipelineError::Format(format!(
                    "chunk {} is not in the restore map",
                    record.header.fp
                )));
            };
            for entry in entries {
                let task = match (entry.role, record.header.is_delta()) {
                    (Role::Data, false) => RestoreWriteTask::Data {
                        bytes: record.payload.to_vec(),
                        pos: entry.pos,
                    },
                    (Role::Base { slot }, false) => RestoreWriteTask::Base {
                        bytes: record.payload.to_vec(),
                        pos: entry.pos,
                        slot,
                    },
                    (Role::Delta { ori_length }, true) => RestoreWriteTask::Delta {
                        delta: record.payload.to_vec(),
                        pos: entry.pos,
                        ori_length,
                    },
                    _ => {
                        return Err(PipelineError::Format(format!(
                            "chunk {} arrived with the wrong delta tag for its recipe entry",
                            record.header.fp
                        )));
                    }
                };
                tx.send(task)
                    .map_err(|_| PipelineError::stage("restore write"))?;
                stats.writes_emitted += 1;
            }
        }
    }

    info!(
        containers = stats.containers,
        writes = stats.writes_emitted,
        amplification = stats.read_amplification(),
        "restore parse stage drained"
    );
    Ok(stats)
}
