//! Pull protocol shared by every operator, plus the row-local operators.

use std::collections::{BTreeMap, VecDeque};

use crate::error::{Result, SpindleError};
use crate::query::exec::ExecContext;
use crate::query::expr::{Expr, VarResolver};
use crate::query::value::Value;
use crate::types::VarId;

/// Variable bindings of one row.
pub type Row = BTreeMap<VarId, Value>;

impl VarResolver for Row {
    fn resolve(&self, var: VarId) -> Option<&Value> {
        self.get(&var)
    }
}

/// Rows served by one [`ExecutionBlock::produce`] call.
#[derive(Debug, Default)]
pub struct Batch {
    /// Produced rows, at most the requested amount.
    pub rows: Vec<Row>,
    /// `false` once the block is exhausted. `true` may precede an empty batch.
    pub has_more: bool,
}

impl Batch {
    /// An empty, final batch.
    pub fn done() -> Self {
        Self {
            rows: Vec::new(),
            has_more: false,
        }
    }
}

/// Pull-based operator.
///
/// Blocks form a chain: each one owns its upstream and only does work when its
/// consumer asks. Upstream calls are lazy and depth-first.
pub trait ExecutionBlock: Send {
    /// Resets the block (and its upstream) for a fresh run whose singleton
    /// emits `input`. Called once before the first pull and again for every
    /// row a subquery is evaluated for.
    fn initialize(&mut self, input: &Row) -> Result<()>;

    /// Produces up to `at_most` rows.
    fn produce(&mut self, ctx: &mut ExecContext, at_most: usize) -> Result<Batch>;

    /// Advances past up to `n` rows without handing them out. Returns the
    /// number of rows skipped; less than `n` means the block is exhausted.
    fn skip(&mut self, ctx: &mut ExecContext, n: u64) -> Result<u64>;

    /// Drops cursors and buffered rows, here and upstream.
    fn release(&mut self);
}

/// Boxed block.
pub type BoxBlock = Box<dyn ExecutionBlock>;

/// Pulls every remaining row out of `upstream`.
pub(crate) fn materialize(upstream: &mut BoxBlock, ctx: &mut ExecContext) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    let step = ctx.batch_size();
    loop {
        ctx.check_abort()?;
        let batch = upstream.produce(ctx, step)?;
        rows.extend(batch.rows);
        if !batch.has_more {
            return Ok(rows);
        }
    }
}

/// Row-at-a-time reader over an upstream block.
pub(crate) struct Input {
    upstream: BoxBlock,
    buffered: VecDeque<Row>,
    exhausted: bool,
}

impl Input {
    pub(crate) fn new(upstream: BoxBlock) -> Self {
        Self {
            upstream,
            buffered: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Pulls the next upstream row, requesting one row at a time so that no
    /// upstream work happens ahead of demand.
    pub(crate) fn next_row(&mut self, ctx: &mut ExecContext) -> Result<Option<Row>> {
        loop {
            if let Some(row) = self.buffered.pop_front() {
                return Ok(Some(row));
            }
            if self.exhausted {
                return Ok(None);
            }
            ctx.check_abort()?;
            let batch = self.upstream.produce(ctx, 1)?;
            self.exhausted = !batch.has_more;
            self.buffered.extend(batch.rows);
        }
    }

    pub(crate) fn initialize(&mut self, input: &Row) -> Result<()> {
        self.buffered.clear();
        self.exhausted = false;
        self.upstream.initialize(input)
    }

    pub(crate) fn release(&mut self) {
        self.buffered.clear();
        self.upstream.release();
    }
}

/// Emits the row handed to [`ExecutionBlock::initialize`] exactly once.
pub struct SingletonBlock {
    input: Row,
    done: bool,
}

impl SingletonBlock {
    /// Creates a singleton that is exhausted until initialized.
    pub fn new() -> Self {
        Self {
            input: Row::new(),
            done: true,
        }
    }
}

impl Default for SingletonBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionBlock for SingletonBlock {
    fn initialize(&mut self, input: &Row) -> Result<()> {
        self.input = input.clone();
        self.done = false;
        Ok(())
    }

    fn produce(&mut self, _ctx: &mut ExecContext, at_most: usize) -> Result<Batch> {
        if self.done || at_most == 0 {
            return Ok(Batch {
                rows: Vec::new(),
                has_more: !self.done,
            });
        }
        self.done = true;
        Ok(Batch {
            rows: vec![self.input.clone()],
            has_more: false,
        })
    }

    fn skip(&mut self, _ctx: &mut ExecContext, n: u64) -> Result<u64> {
        if self.done || n == 0 {
            return Ok(0);
        }
        self.done = true;
        Ok(1)
    }

    fn release(&mut self) {
        self.input.clear();
        self.done = true;
    }
}

/// `LET out = expr`; row-count preserving.
pub struct CalculationBlock {
    upstream: BoxBlock,
    expr: Expr,
    out: VarId,
}

impl CalculationBlock {
    /// Wraps `upstream`.
    pub fn new(upstream: BoxBlock, expr: Expr, out: VarId) -> Self {
        Self {
            upstream,
            expr,
            out,
        }
    }
}

impl ExecutionBlock for CalculationBlock {
    fn initialize(&mut self, input: &Row) -> Result<()> {
        self.upstream.initialize(input)
    }

    fn produce(&mut self, ctx: &mut ExecContext, at_most: usize) -> Result<Batch> {
        let mut batch = self.upstream.produce(ctx, at_most)?;
        for row in &mut batch.rows {
            let value = self.expr.evaluate(&*row)?;
            row.insert(self.out, value);
        }
        Ok(batch)
    }

    fn skip(&mut self, ctx: &mut ExecContext, n: u64) -> Result<u64> {
        self.upstream.skip(ctx, n)
    }

    fn release(&mut self) {
        self.upstream.release();
    }
}

/// `FILTER input`; drops rows whose condition is falsy.
pub struct FilterBlock {
    upstream: BoxBlock,
    input: VarId,
    exhausted: bool,
}

impl FilterBlock {
    /// Wraps `upstream`.
    pub fn new(upstream: BoxBlock, input: VarId) -> Self {
        Self {
            upstream,
            input,
            exhausted: false,
        }
    }

    fn pull_matching(&mut self, ctx: &mut ExecContext, want: usize) -> Result<Vec<Row>> {
        let mut out = Vec::new();
        while out.len() < want && !self.exhausted {
            ctx.check_abort()?;
            let batch = self.upstream.produce(ctx, want - out.len())?;
            self.exhausted = !batch.has_more;
            for row in batch.rows {
                let keep = row
                    .get(&self.input)
                    .map(Value::is_truthy)
                    .ok_or_else(|| {
                        SpindleError::InvalidOwned(format!(
                            "filter variable {} is not bound",
                            self.input
                        ))
                    })?;
                if keep {
                    out.push(row);
                } else {
                    ctx.stats.filtered += 1;
                }
            }
        }
        Ok(out)
    }
}

impl ExecutionBlock for FilterBlock {
    fn initialize(&mut self, input: &Row) -> Result<()> {
        self.exhausted = false;
        self.upstream.initialize(input)
    }

    fn produce(&mut self, ctx: &mut ExecContext, at_most: usize) -> Result<Batch> {
        let rows = self.pull_matching(ctx, at_most)?;
        Ok(Batch {
            rows,
            has_more: !self.exhausted,
        })
    }

    fn skip(&mut self, ctx: &mut ExecContext, n: u64) -> Result<u64> {
        // Every candidate has to be evaluated; matches are counted, not kept.
        let mut skipped = 0;
        while skipped < n && !self.exhausted {
            let want = (n - skipped).min(ctx.batch_size() as u64) as usize;
            skipped += self.pull_matching(ctx, want)?.len() as u64;
        }
        Ok(skipped)
    }

    fn release(&mut self) {
        self.upstream.release();
    }
}

/// `RETURN input`; trims rows down to the returned variable.
pub struct ReturnBlock {
    upstream: BoxBlock,
    input: VarId,
}

impl ReturnBlock {
    /// Wraps `upstream`.
    pub fn new(upstream: BoxBlock, input: VarId) -> Self {
        Self { upstream, input }
    }
}

impl ExecutionBlock for ReturnBlock {
    fn initialize(&mut self, input: &Row) -> Result<()> {
        self.upstream.initialize(input)
    }

    fn produce(&mut self, ctx: &mut ExecContext, at_most: usize) -> Result<Batch> {
        let batch = self.upstream.produce(ctx, at_most)?;
        let rows = batch
            .rows
            .into_iter()
            .map(|mut row| {
                let value = row.remove(&self.input).ok_or_else(|| {
                    SpindleError::InvalidOwned(format!(
                        "returned variable {} is not bound",
                        self.input
                    ))
                })?;
                Ok(Row::from([(self.input, value)]))
            })
            .collect::<Result<_>>()?;
        Ok(Batch {
            rows,
            has_more: batch.has_more,
        })
    }

    fn skip(&mut self, ctx: &mut ExecContext, n: u64) -> Result<u64> {
        self.upstream.skip(ctx, n)
    }

    fn release(&mut self) {
        self.upstream.release();
    }
}
