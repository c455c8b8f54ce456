//! `LET out = ( body )`: runs the nested block chain once per input row.

use tracing::trace;

use crate::error::Result;
use crate::query::exec::block::{Batch, BoxBlock, ExecutionBlock, Row};
use crate::query::exec::ExecContext;
use crate::query::value::Value;
use crate::types::VarId;

/// Evaluates `body` for every upstream row and binds the array of its results.
pub struct SubqueryBlock {
    upstream: BoxBlock,
    body: BoxBlock,
    returned: VarId,
    out: VarId,
}

impl SubqueryBlock {
    /// `body` must end in a return block for `returned`.
    pub fn new(upstream: BoxBlock, body: BoxBlock, returned: VarId, out: VarId) -> Self {
        Self {
            upstream,
            body,
            returned,
            out,
        }
    }

    fn evaluate(&mut self, ctx: &mut ExecContext, row: &Row) -> Result<Value> {
        self.body.initialize(row)?;
        let step = ctx.batch_size();
        let mut results = Vec::new();
        loop {
            ctx.check_abort()?;
            let batch = self.body.produce(ctx, step)?;
            results.extend(
                batch
                    .rows
                    .into_iter()
                    .filter_map(|mut row| row.remove(&self.returned)),
            );
            if !batch.has_more {
                break;
            }
        }
        trace!(results = results.len(), "executor.subquery.evaluated");
        Ok(Value::Array(results))
    }
}

impl ExecutionBlock for SubqueryBlock {
    fn initialize(&mut self, input: &Row) -> Result<()> {
        self.upstream.initialize(input)
    }

    fn produce(&mut self, ctx: &mut ExecContext, at_most: usize) -> Result<Batch> {
        let mut batch = self.upstream.produce(ctx, at_most)?;
        for row in &mut batch.rows {
            match self.evaluate(ctx, row) {
                Ok(value) => {
                    row.insert(self.out, value);
                }
                Err(err) => {
                    self.body.release();
                    return Err(err);
                }
            }
        }
        Ok(batch)
    }

    fn skip(&mut self, ctx: &mut ExecContext, n: u64) -> Result<u64> {
        // The body has no side effects; skipped rows need no evaluation.
        self.upstream.skip(ctx, n)
    }

    fn release(&mut self) {
        self.body.release();
        self.upstream.release();
    }
}
