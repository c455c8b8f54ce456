#![forbid(unsafe_code)]

//! Query plans, their rewrites and their execution.
//!
//! Plans arrive already parsed, either built with [`builder::PlanBuilder`] or
//! deserialized from JSON. The optimizer rewrites them in place and the
//! executor runs them as a tree of pull-based blocks.

/// Fluent, scope-aware plan construction.
pub mod builder;

/// Pull-based execution blocks, the executor and query cursors.
pub mod exec;

/// Inspectable plan rendering and plan fingerprints.
pub mod explain;

/// Expression language evaluated by calculation, filter and view nodes.
pub mod expr;

/// Optimizer rules and their toggles.
///
/// Holds the subquery inliner with its safety analysis and the index
/// selection rule.
pub mod optimizer;

/// Caller-supplied query options and their TOML form.
pub mod options;

/// Arena-based plan node model.
pub mod plan;

/// Performance profiling for query operations.
///
/// Collects timing and count statistics to identify performance bottlenecks.
pub mod profile;

/// Per-query execution counters.
pub mod stats;

/// Runtime values.
pub mod value;

pub use builder::PlanBuilder;
pub use exec::{AbortHandle, Executor, QueryCursor, QueryResult};
pub use explain::{ExplainNode, ExplainOutput};
pub use expr::Expr;
pub use optimizer::{Optimizer, OptimizerRules};
pub use options::QueryOptions;
pub use plan::{CountingLimit, NodeKind, Plan, PlanNode, PlanOp};
pub use stats::ExecutionStats;
pub use value::Value;
