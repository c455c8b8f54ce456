//! Spindle: the optimizer and executor core of a document query engine.
//!
//! Plans are arena-allocated trees of operator nodes. The optimizer inlines
//! subqueries that feed a loop and turns OR-ed equality filters into index
//! scans. The executor pulls rows through a chain of blocks that can skip
//! without materializing, and reports scan counters plus an optional full
//! count of matches ignoring the outermost limit.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Query facade.
pub mod engine;
/// Crate-wide error type.
pub mod error;
/// Plans, rewrites and execution.
pub mod query;
/// Storage collaborator contract and the in-memory reference store.
pub mod storage;
/// Shared identifiers.
pub mod types;

pub use engine::QueryEngine;
pub use error::{Result, SpindleError};
