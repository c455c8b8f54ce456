//! Pull-based plan execution.
//!
//! [`Executor::cursor`] turns a plan into a tree of [`ExecutionBlock`]s, one
//! block per plan node, and wraps it in a [`QueryCursor`]. Nothing is read
//! from storage until the cursor is pulled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, SpindleError};
use crate::query::options::QueryOptions;
use crate::query::plan::{CountingLimit, Plan, PlanOp};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::query::stats::ExecutionStats;
use crate::query::value::Value;
use crate::storage::StorageEngine;
use crate::types::{NodeId, VarId};

/// Block trait, row type and the row-local operators.
pub mod block;
/// Grouping operator.
pub mod collect;
/// Deduplicating index scan over OR-ed lookups.
pub mod disjunction;
/// Offset/limit window with full counting.
pub mod limit;
/// Nested loops over collections, views and arrays.
pub mod scan;
/// Sorting operator.
pub mod sort;
/// Per-row subquery evaluation.
pub mod subquery;

pub use block::{Batch, BoxBlock, ExecutionBlock, Row};

use block::{CalculationBlock, FilterBlock, ReturnBlock, SingletonBlock};
use collect::{CollectBlock, CollectCapture};
use disjunction::IndexScan;
use limit::LimitBlock;
use scan::{CollectionScan, EnumerateBlock, ListEnumerator, ViewScan};
use sort::SortBlock;
use subquery::SubqueryBlock;

/// Cancellation flag shared between a cursor and its caller.
#[derive(Clone, Debug, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    /// Requests cancellation; the next pull fails with [`SpindleError::Aborted`].
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// State shared by every block of one execution.
pub struct ExecContext {
    /// Counters updated by the blocks.
    pub stats: ExecutionStats,
    storage: Arc<dyn StorageEngine>,
    abort: AbortHandle,
    batch_size: usize,
}

impl ExecContext {
    /// Creates a context over `storage`.
    pub fn new(
        storage: Arc<dyn StorageEngine>,
        abort: AbortHandle,
        batch_size: usize,
    ) -> Self {
        Self {
            stats: ExecutionStats::default(),
            storage,
            abort,
            batch_size: batch_size.max(1),
        }
    }

    /// Fails with [`SpindleError::Aborted`] once the caller aborted.
    pub fn check_abort(&self) -> Result<()> {
        if self.abort.is_aborted() {
            return Err(SpindleError::Aborted);
        }
        Ok(())
    }

    /// Row budget of one top-level pull.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Storage collaborator.
    pub fn storage(&self) -> &Arc<dyn StorageEngine> {
        &self.storage
    }
}

/// Materialized query result.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Returned values in output order.
    pub rows: Vec<Value>,
    /// Execution counters.
    pub stats: ExecutionStats,
}

/// Lazily pulled query output.
///
/// Dropping the cursor releases every block and storage cursor.
pub struct QueryCursor {
    root: BoxBlock,
    ctx: ExecContext,
    returned: VarId,
    /// Set when no top-level limit computes the full count.
    count_returned: bool,
    rows_returned: u64,
    done: bool,
}

impl QueryCursor {
    /// Next batch of at most `batch_size` values, or `None` once exhausted.
    /// A batch may be empty while more values follow.
    pub fn next_batch(&mut self) -> Result<Option<Vec<Value>>> {
        if self.done {
            return Ok(None);
        }
        if let Err(err) = self.ctx.check_abort() {
            self.fail(&err);
            return Err(err);
        }
        let timer = profile_timer();
        let size = self.ctx.batch_size();
        let result = self.root.produce(&mut self.ctx, size);
        record_profile_timer(QueryProfileKind::Pull, timer);
        let batch = match result {
            Ok(batch) => batch,
            Err(err) => {
                self.fail(&err);
                return Err(err);
            }
        };
        let rows: Vec<Value> = batch
            .rows
            .into_iter()
            .map(|mut row| row.remove(&self.returned).unwrap_or(Value::Null))
            .collect();
        self.rows_returned += rows.len() as u64;
        if !batch.has_more {
            self.finish();
        }
        Ok(Some(rows))
    }

    /// Counters so far; final once the cursor is exhausted.
    pub fn stats(&self) -> &ExecutionStats {
        &self.ctx.stats
    }

    /// Handle for aborting this cursor from elsewhere.
    pub fn abort_handle(&self) -> AbortHandle {
        self.ctx.abort.clone()
    }

    /// Whether every value has been handed out.
    pub fn is_exhausted(&self) -> bool {
        self.done
    }

    /// Pulls everything that is left.
    pub fn collect(mut self) -> Result<QueryResult> {
        let mut rows = Vec::new();
        while let Some(batch) = self.next_batch()? {
            rows.extend(batch);
        }
        Ok(QueryResult {
            rows,
            stats: self.ctx.stats,
        })
    }

    fn finish(&mut self) {
        self.done = true;
        if self.count_returned {
            self.ctx.stats.full_count = self.rows_returned;
        }
        self.root.release();
        info!(
            rows = self.rows_returned,
            scanned_full = self.ctx.stats.scanned_full,
            scanned_index = self.ctx.stats.scanned_index,
            filtered = self.ctx.stats.filtered,
            full_count = self.ctx.stats.full_count,
            "executor.query.complete"
        );
    }

    fn fail(&mut self, err: &SpindleError) {
        self.done = true;
        self.root.release();
        match err {
            SpindleError::Aborted => warn!(rows = self.rows_returned, "executor.query.aborted"),
            other => warn!(error = %other, code = other.code(), "executor.query.failed"),
        }
    }
}

impl Drop for QueryCursor {
    fn drop(&mut self) {
        if !self.done {
            self.root.release();
        }
    }
}

/// Builds block trees for plans.
pub struct Executor {
    storage: Arc<dyn StorageEngine>,
}

impl Executor {
    /// Creates an executor reading from `storage`.
    pub fn new(storage: Arc<dyn StorageEngine>) -> Self {
        Self { storage }
    }

    /// Executes `plan` to completion.
    pub fn execute(&self, plan: &Plan, options: &QueryOptions) -> Result<QueryResult> {
        self.cursor(plan, options)?.collect()
    }

    /// Prepares a lazily pulled cursor over `plan`. The plan must have its
    /// bind parameters applied.
    pub fn cursor(&self, plan: &Plan, options: &QueryOptions) -> Result<QueryCursor> {
        let timer = profile_timer();
        let main = plan.chain(plan.root())?;
        let counting = plan.counting_limit()?;
        let full_count_at = match counting {
            CountingLimit::Node(id) if options.full_count => Some(id),
            _ => None,
        };
        let (mut root, returned) = build_chain(plan, &main, full_count_at)?;
        root.initialize(&Row::new())?;
        record_profile_timer(QueryProfileKind::Build, timer);
        debug!(
            nodes = plan.len(),
            full_count = options.full_count,
            batch_size = options.batch_size,
            "executor.query.start"
        );
        let ctx = ExecContext::new(
            Arc::clone(&self.storage),
            AbortHandle::default(),
            options.batch_size,
        );
        Ok(QueryCursor {
            root,
            ctx,
            returned,
            count_returned: options.full_count && counting == CountingLimit::Returned,
            rows_returned: 0,
            done: false,
        })
    }
}

/// Folds one scope chain (singleton first, return last) into blocks.
fn build_chain(
    plan: &Plan,
    chain: &[NodeId],
    full_count_at: Option<NodeId>,
) -> Result<(BoxBlock, VarId)> {
    let mut block: BoxBlock = Box::new(SingletonBlock::new());
    let mut returned = None;
    for id in chain {
        let node = plan.expect_node(*id)?;
        block = match &node.op {
            PlanOp::Singleton => continue,
            PlanOp::EnumerateCollection { collection, out } => {
                if let Some(param) = collection.strip_prefix('@') {
                    return Err(SpindleError::BindParameterMissing(param.to_owned()));
                }
                Box::new(EnumerateBlock::new(
                    block,
                    CollectionScan::new(collection.clone()),
                    *out,
                ))
            }
            PlanOp::EnumerateIndex {
                collection,
                disjuncts,
                out,
            } => Box::new(EnumerateBlock::new(
                block,
                IndexScan::new(collection.clone(), disjuncts.clone()),
                *out,
            )),
            PlanOp::EnumerateView {
                view,
                condition,
                out,
            } => Box::new(EnumerateBlock::new(
                block,
                ViewScan::new(view.clone(), condition.clone(), *out),
                *out,
            )),
            PlanOp::EnumerateList { input, out } => Box::new(EnumerateBlock::new(
                block,
                ListEnumerator::new(*input),
                *out,
            )),
            PlanOp::Filter { input } => Box::new(FilterBlock::new(block, *input)),
            PlanOp::Calculation { expr, out } => {
                Box::new(CalculationBlock::new(block, expr.clone(), *out))
            }
            PlanOp::Limit { offset, limit } => Box::new(LimitBlock::new(
                block,
                *offset,
                *limit,
                full_count_at == Some(*id),
            )),
            PlanOp::Sort { keys } => Box::new(SortBlock::new(block, keys.clone())),
            PlanOp::Collect {
                groups,
                into,
                count,
                method,
            } => {
                let capture = into.as_ref().map(|into| CollectCapture {
                    out: into.out,
                    keep: into
                        .keep
                        .iter()
                        .map(|var| (plan.vars().name(*var).to_owned(), *var))
                        .collect(),
                });
                Box::new(CollectBlock::new(
                    block,
                    groups.clone(),
                    capture,
                    *count,
                    *method,
                ))
            }
            PlanOp::Subquery { body, out } => {
                let inner = plan.chain(*body)?;
                let (body_block, body_returned) = build_chain(plan, &inner, None)?;
                Box::new(SubqueryBlock::new(block, body_block, body_returned, *out))
            }
            PlanOp::Return { input } => {
                returned = Some(*input);
                Box::new(ReturnBlock::new(block, *input))
            }
        };
    }
    let returned = returned.ok_or(SpindleError::Invalid("scope does not end in RETURN"))?;
    Ok((block, returned))
}
