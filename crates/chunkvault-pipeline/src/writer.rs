//! Write stage: append one recipe record per chunk and route payload
//! bytes into the active category's containers.

use std::fs::File;
use std::io::{BufWriter, Write};

use chunkvault_core::block::{BlockHeader, HEADER_LEN};
use chunkvault_store::container::{ContainerConstructor, ContainerStats};
use chunkvault_store::layout::Layout;
use crossbeam_channel::Receiver;
use tracing::info;

use crate::error::PipelineError;
use crate::task::WriteTask;

/// Per-version statistics from the write stage.
#[derive(Debug, Default, Clone)]
pub struct WriteStats {
    /// Recipe records written.
    pub recipe_records: u64,
    /// Logical bytes covered by the recipe (original chunk lengths).
    pub recipe_bytes: u64,
    /// Container stream accounting.
    pub containers: ContainerStats,
}

/// Drain the write-task stream for one version: every task appends a
/// recipe record; payload-bearing tasks also feed the container
/// constructor. Returns once the recipe is durable and the offline
/// container chain has flushed.
pub fn run(
    rx: Receiver<WriteTask>,
    layout: &Layout,
    version: u64,
    mut constructor: ContainerConstructor,
) -> Result<WriteStats, PipelineError> {
    let mut stats = WriteStats::default();
    let recipe_path = layout.recipe(version);
    let mut recipe = BufWriter::new(File::create(&recipe_path)?);

    for task in rx {
        let header = match &task {
            WriteTask::Unique { fp, data, features } => {
                BlockHeader::unique(*fp, data.len() as u64, *features)
            }
            WriteTask::Similar {
                fp,
                delta,
                ori_length,
                base,
            } => BlockHeader::delta(*fp, delta.len() as u64, *ori_length, *base),
            WriteTask::Internal { fp, length } | WriteTask::Adjacent { fp, length } => {
                BlockHeader::unique(*fp, *length, Default::default())
            }
            WriteTask::InternalDelta {
                fp,
                length,
                ori_length,
                base,
            }
            | WriteTask::AdjacentDelta {
                fp,
                length,
                ori_length,
                base,
            } => BlockHeader::delta(*fp, *length, *ori_length, *base),
        };
        let encoded = header.encode();
        recipe.write_all(&encoded)?;
        stats.recipe_records += 1;
        stats.recipe_bytes += header.ori_length;

        match task {
            WriteTask::Unique { data, .. } => constructor.write_class(&encoded, &data)?,
            WriteTask::Similar { delta, .. } => constructor.write_class(&encoded, &delta)?,
            _ => {}
        }
    }

    recipe.flush()?;
    let recipe_file = recipe
        .into_inner()
        .map_err(|e| PipelineError::Io(e.into_error()))?;
    recipe_file.sync_data()?;
    stats.containers = constructor.finish()?;
    info!(
        version,
        records = stats.recipe_records,
        recipe_bytes = stats.recipe_records * HEADER_LEN as u64,
        containers = stats.containers.containers,
        "write stage drained"
    );
    Ok(stats)
}
