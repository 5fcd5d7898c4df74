//! The store manifest: version count and arrangement debt

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::IndexError;

/// Persisted store header, read at startup and written after every
/// successful ingest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Number of versions currently retained.
    pub total_version: u64,
    /// Arrangement passes the store has deferred. Always zero: deferral is
    /// reserved in the format but unimplemented, and a nonzero value is
    /// rejected on load.
    pub arrangement_fall_behind: u64,
}

impl Manifest {
    /// Load the manifest, or an empty one when the store has no versions.
    pub fn load(path: &Path) -> Result<Manifest, IndexError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!("no manifest found, starting with 0 versions");
                return Ok(Manifest::default());
            }
            Err(err) => return Err(err.into()),
        };
        let manifest: Manifest = bincode::deserialize_from(BufReader::new(file))?;
        if manifest.arrangement_fall_behind != 0 {
            return Err(IndexError::Corrupt(format!(
                "arrangement fall-behind {} is unsupported",
                manifest.arrangement_fall_behind
            )));
        }
        info!(versions = manifest.total_version, "loaded manifest");
        Ok(manifest)
    }

    /// Write the manifest durably.
    pub fn save(&self, path: &Path) -> Result<(), IndexError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, self)?;
        let file = writer
            .into_inner()
            .map_err(|e| IndexError::Codec(e.to_string()))?;
        file.sync_data()?;
        Ok(())
    }
}
