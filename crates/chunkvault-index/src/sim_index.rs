//! One generation of the three-feature similarity index

use std::collections::HashMap;

use chunkvault_core::fingerprint::{Fingerprint, SimilarityFeatures};
use serde::{Deserialize, Serialize};

/// Where a delta base physically lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasePos {
    /// The base chunk's fingerprint.
    pub fp: Fingerprint,
    /// LC-group the base lives in; 0 denotes the append overflow of the
    /// merged top category after an elimination.
    pub category_order: u32,
    /// Container id within the category.
    pub cid: u64,
    /// The base chunk's length.
    pub length: u64,
}

/// One generation of the similarity index: one map per feature lane.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SimGeneration {
    tables: [HashMap<u64, BasePos>; 3],
}

impl SimGeneration {
    /// Insert a base under all three of its features.
    pub fn insert(&mut self, features: &SimilarityFeatures, pos: BasePos) {
        for (lane, table) in self.tables.iter_mut().enumerate() {
            table.insert(features.0[lane], pos);
        }
    }

    /// Probe one feature lane.
    pub fn lookup_lane(&self, lane: usize, feature: u64) -> Option<BasePos> {
        self.tables[lane].get(&feature).copied()
    }

    /// Atomically take over `other`'s contents, leaving it empty.
    pub fn roll_from(&mut self, other: &mut SimGeneration) {
        self.tables = std::mem::take(&mut other.tables);
    }

    /// Remap category orders after an elimination: orders >= 3 shift down
    /// by one, order 2 becomes 0 (the merged category's append overflow),
    /// order 1 stays.
    pub fn merge_categories(&mut self) {
        for table in self.tables.iter_mut() {
            for pos in table.values_mut() {
                if pos.category_order >= 3 {
                    pos.category_order -= 1;
                } else if pos.category_order == 2 {
                    pos.category_order = 0;
                }
            }
        }
    }

    /// Entry count per lane (all three lanes are the same size except
    /// after feature collisions).
    pub fn lane_len(&self, lane: usize) -> usize {
        self.tables[lane].len()
    }
}
