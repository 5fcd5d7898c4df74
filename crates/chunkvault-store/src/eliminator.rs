//! Retention pass: retire the oldest version by renaming and merging
//! category and recipe files. No payload bytes are rewritten.

use std::fs;
use std::path::PathBuf;

use chunkvault_index::metadata::MetadataIndex;
use tracing::info;

use crate::error::StoreError;
use crate::layout::Layout;

/// Drops version 1 from a store holding `max_version` versions: its
/// archived volumes are deleted, category 2 merges into category 1's
/// append family, every other category and volume shifts down by one,
/// recipes renumber, and the similarity table remaps its category orders.
pub struct Eliminator<'a> {
    layout: &'a Layout,
    index: &'a MetadataIndex,
}

impl<'a> Eliminator<'a> {
    /// An eliminator over the given layout and metadata index.
    pub fn new(layout: &'a Layout, index: &'a MetadataIndex) -> Self {
        Self { layout, index }
    }

    /// Run the full pass.
    pub fn run(&self, max_version: u64) -> Result<(), StoreError> {
        info!(max_version, "eliminating the earliest version");

        self.delete_version_volumes(1)?;

        self.merge_active_categories(max_version)?;
        for category in 3..=max_version {
            self.shift_active_category(category, max_version)?;
        }

        for version in 2..max_version {
            self.merge_archived_categories(version)?;
            self.shift_archived_categories(version)?;
        }

        for recipe in 2..=max_version {
            fs::rename(self.layout.recipe(recipe), self.layout.recipe(recipe - 1))?;
        }

        self.index.similarity_table_merge();
        info!("earliest version eliminated");
        Ok(())
    }

    fn rename_family(
        &self,
        from: impl Fn(u64) -> PathBuf,
        to: impl Fn(u64) -> PathBuf,
    ) -> Result<u64, StoreError> {
        let mut cid = 0;
        while from(cid).exists() {
            fs::rename(from(cid), to(cid))?;
            cid += 1;
        }
        Ok(cid)
    }

    /// Step 1: archived volumes of the dropped version are dead.
    fn delete_version_volumes(&self, version: u64) -> Result<(), StoreError> {
        for category in 1..=version {
            let mut cid = 0;
            loop {
                let path = self.layout.archived_container(category, version, cid);
                if !path.exists() {
                    break;
                }
                fs::remove_file(path)?;
                cid += 1;
            }
        }
        Ok(())
    }

    /// Step 2: category 1 keeps its place; category 2 becomes category
    /// 1's append family so existing base positions stay resolvable.
    fn merge_active_categories(&self, max_version: u64) -> Result<(), StoreError> {
        self.rename_family(
            |cid| self.layout.active_container(1, max_version, cid),
            |cid| self.layout.active_container(1, max_version - 1, cid),
        )?;
        self.rename_family(
            |cid| self.layout.active_container(2, max_version, cid),
            |cid| self.layout.active_append(1, max_version - 1, cid),
        )?;
        Ok(())
    }

    /// Step 3: categories >= 3 shift down by one.
    fn shift_active_category(&self, category: u64, max_version: u64) -> Result<(), StoreError> {
        self.rename_family(
            |cid| self.layout.active_container(category, max_version, cid),
            |cid| self.layout.active_container(category - 1, max_version - 1, cid),
        )?;
        Ok(())
    }

    /// Step 4a: archived categories 1 and 2 of `version` merge into a
    /// single category-1 family at `version - 1`, cids continuing.
    fn merge_archived_categories(&self, version: u64) -> Result<(), StoreError> {
        let merged = self.rename_family(
            |cid| self.layout.archived_container(1, version, cid),
            |cid| self.layout.archived_container(1, version - 1, cid),
        )?;
        let mut acid = 0;
        loop {
            let from = self.layout.archived_container(2, version, acid);
            if !from.exists() {
                break;
            }
            fs::rename(
                from,
                self.layout.archived_container(1, version - 1, merged + acid),
            )?;
            acid += 1;
        }
        Ok(())
    }

    /// Step 4b: archived categories >= 3 of `version` shift down by one.
    fn shift_archived_categories(&self, version: u64) -> Result<(), StoreError> {
        for category in 3..=version {
            self.rename_family(
                |cid| self.layout.archived_container(category, version, cid),
                |cid| self.layout.archived_container(category - 1, version - 1, cid),
            )?;
        }
        Ok(())
    }
}
