//! Small integer identifiers shared by the planner, executor and storage contract.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of a node inside a plan arena.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Index of a variable inside a plan's variable table.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct VarId(pub u32);

/// Primary key of a stored document.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct DocKey(pub u64);

impl DocKey {
    /// Smallest possible key; seeking to it rewinds a cursor.
    pub const MIN: DocKey = DocKey(0);
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(value: u32) -> Self {
        NodeId(value)
    }
}

impl From<u32> for VarId {
    fn from(value: u32) -> Self {
        VarId(value)
    }
}

impl From<u64> for DocKey {
    fn from(value: u64) -> Self {
        DocKey(value)
    }
}
