//! Per-query execution counters.

use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

/// Counters accumulated while one query executes.
///
/// All counters only ever grow during an execution. Statistics from several
/// executions (for instance one per shard) combine additively.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    /// Documents visited by full collection and view scans.
    pub scanned_full: u64,
    /// Index entries visited, duplicates included.
    pub scanned_index: u64,
    /// Rows rejected by filter operators.
    pub filtered: u64,
    /// Total matches ignoring the outermost offset/limit. Only meaningful when
    /// a full count was requested.
    pub full_count: u64,
}

impl ExecutionStats {
    /// Adds `other` into `self`.
    pub fn merge(&mut self, other: &ExecutionStats) {
        self.scanned_full += other.scanned_full;
        self.scanned_index += other.scanned_index;
        self.filtered += other.filtered;
        self.full_count += other.full_count;
    }
}

impl AddAssign for ExecutionStats {
    fn add_assign(&mut self, rhs: Self) {
        self.merge(&rhs);
    }
}
