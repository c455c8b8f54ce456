//! `SORT`: materializes its input on the first pull and serves it in order.

use std::cmp::Ordering;
use std::collections::VecDeque;

use tracing::debug;

use crate::error::Result;
use crate::query::exec::block::{materialize, Batch, BoxBlock, ExecutionBlock, Row};
use crate::query::exec::ExecContext;
use crate::query::plan::SortKey;
use crate::query::value::Value;

/// Stable multi-key sort.
pub struct SortBlock {
    upstream: BoxBlock,
    keys: Vec<SortKey>,
    sorted: Option<VecDeque<Row>>,
}

impl SortBlock {
    /// Wraps `upstream`.
    pub fn new(upstream: BoxBlock, keys: Vec<SortKey>) -> Self {
        Self {
            upstream,
            keys,
            sorted: None,
        }
    }

    fn rows(&mut self, ctx: &mut ExecContext) -> Result<&mut VecDeque<Row>> {
        if self.sorted.is_none() {
            let mut rows = materialize(&mut self.upstream, ctx)?;
            rows.sort_by(|a, b| compare(&self.keys, a, b));
            debug!(rows = rows.len(), keys = self.keys.len(), "executor.sort.materialized");
            self.sorted = Some(rows.into());
        }
        Ok(self.sorted.get_or_insert_with(VecDeque::new))
    }
}

fn compare(keys: &[SortKey], a: &Row, b: &Row) -> Ordering {
    static NULL: Value = Value::Null;
    for key in keys {
        let left = a.get(&key.var).unwrap_or(&NULL);
        let right = b.get(&key.var).unwrap_or(&NULL);
        let ordering = if key.ascending {
            left.cmp(right)
        } else {
            right.cmp(left)
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

impl ExecutionBlock for SortBlock {
    fn initialize(&mut self, input: &Row) -> Result<()> {
        self.sorted = None;
        self.upstream.initialize(input)
    }

    fn produce(&mut self, ctx: &mut ExecContext, at_most: usize) -> Result<Batch> {
        let rows = self.rows(ctx)?;
        let take = at_most.min(rows.len());
        let out: Vec<Row> = rows.drain(..take).collect();
        Ok(Batch {
            rows: out,
            has_more: !rows.is_empty(),
        })
    }

    fn skip(&mut self, ctx: &mut ExecContext, n: u64) -> Result<u64> {
        let rows = self.rows(ctx)?;
        let take = (n.min(rows.len() as u64)) as usize;
        rows.drain(..take);
        Ok(take as u64)
    }

    fn release(&mut self) {
        self.sorted = None;
        self.upstream.release();
    }
}
