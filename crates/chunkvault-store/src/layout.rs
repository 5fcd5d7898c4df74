//! Filesystem layout of a store: recipes, container families, manifest

use std::path::{Path, PathBuf};

/// Path construction for everything under the store root. Containers are
/// discovered by probing cids upward from zero, matching how the writers
/// number them.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// A layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the `logicFiles/` and `storageFiles/` directories.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.root.join("logicFiles"))?;
        std::fs::create_dir_all(self.root.join("storageFiles"))?;
        Ok(())
    }

    /// Recipe of version `v`.
    pub fn recipe(&self, v: u64) -> PathBuf {
        self.root.join("logicFiles").join(format!("Recipe{}", v))
    }

    /// Active category container `(c, v, cid)`.
    pub fn active_container(&self, c: u64, v: u64, cid: u64) -> PathBuf {
        self.root
            .join("storageFiles")
            .join(format!("Active_Cat({},{})Container{}", c, v, cid))
    }

    /// Append overflow of active category `(c, v, cid)`.
    pub fn active_append(&self, c: u64, v: u64, cid: u64) -> PathBuf {
        self.root
            .join("storageFiles")
            .join(format!("Active_Cat({},{})Append_Container{}", c, v, cid))
    }

    /// Archived volume container `(c, v, cid)`.
    pub fn archived_container(&self, c: u64, v: u64, cid: u64) -> PathBuf {
        self.root
            .join("storageFiles")
            .join(format!("Archived_Cat({},{})Container{}", c, v, cid))
    }

    /// The manifest file.
    pub fn manifest(&self) -> PathBuf {
        self.root.join("manifest")
    }

    /// The persisted metadata index.
    pub fn kvstore(&self) -> PathBuf {
        self.root.join("kvstore")
    }
}

/// Number of containers in a family: cids are dense from zero, so the
/// first missing file ends the family.
pub fn count_cids(path_of: impl Fn(u64) -> PathBuf) -> u64 {
    let mut cid = 0;
    while path_of(cid).exists() {
        cid += 1;
    }
    cid
}
