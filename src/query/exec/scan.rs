//! Enumeration blocks: nested loops over collections, views and arrays.
//!
//! An [`EnumerateBlock`] pulls one upstream row at a time and runs its
//! [`Enumerator`] to completion for that row before asking for the next one.
//! Skips are forwarded to the enumerator so that sources can advance their
//! cursors without materializing documents.

use tracing::{debug, trace};

use crate::error::{Result, SpindleError};
use crate::query::exec::block::{Batch, BoxBlock, ExecutionBlock, Input, Row};
use crate::query::exec::ExecContext;
use crate::query::expr::{Expr, VarResolver};
use crate::query::value::Value;
use crate::storage::Cursor;
use crate::types::{DocKey, VarId};

/// Per-input-row value source of an [`EnumerateBlock`].
pub(crate) trait Enumerator: Send {
    /// Starts enumerating for `row`.
    fn open(&mut self, ctx: &mut ExecContext, row: &Row) -> Result<()>;

    /// Next value for the current row.
    fn next(&mut self, ctx: &mut ExecContext, row: &Row) -> Result<Option<Value>>;

    /// Skips up to `n` values for the current row.
    fn skip(&mut self, ctx: &mut ExecContext, row: &Row, n: u64) -> Result<u64>;

    /// Drops every open cursor.
    fn release(&mut self);
}

pub(crate) struct EnumerateBlock<E> {
    input: Input,
    enumerator: E,
    out: VarId,
    current: Option<Row>,
}

impl<E: Enumerator> EnumerateBlock<E> {
    pub(crate) fn new(upstream: BoxBlock, enumerator: E, out: VarId) -> Self {
        Self {
            input: Input::new(upstream),
            enumerator,
            out,
            current: None,
        }
    }

    /// Moves to the next upstream row; `false` once upstream is exhausted.
    fn advance(&mut self, ctx: &mut ExecContext) -> Result<bool> {
        match self.input.next_row(ctx)? {
            Some(row) => {
                self.enumerator.open(ctx, &row)?;
                self.current = Some(row);
                Ok(true)
            }
            None => {
                self.enumerator.release();
                Ok(false)
            }
        }
    }

    fn produce_rows(&mut self, ctx: &mut ExecContext, at_most: usize) -> Result<Batch> {
        let mut rows = Vec::new();
        while rows.len() < at_most {
            let Some(row) = self.current.as_ref() else {
                if !self.advance(ctx)? {
                    return Ok(Batch {
                        rows,
                        has_more: false,
                    });
                }
                continue;
            };
            match self.enumerator.next(ctx, row)? {
                Some(value) => {
                    let mut out = row.clone();
                    out.insert(self.out, value);
                    rows.push(out);
                }
                None => self.current = None,
            }
        }
        Ok(Batch {
            rows,
            has_more: true,
        })
    }

    fn skip_rows(&mut self, ctx: &mut ExecContext, n: u64) -> Result<u64> {
        let mut skipped = 0;
        while skipped < n {
            let Some(row) = self.current.as_ref() else {
                if !self.advance(ctx)? {
                    break;
                }
                continue;
            };
            let want = n - skipped;
            let done = self.enumerator.skip(ctx, row, want)?;
            skipped += done;
            if done < want {
                self.current = None;
            }
        }
        Ok(skipped)
    }

    fn fail<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.enumerator.release();
            self.current = None;
        }
        result
    }
}

impl<E: Enumerator> ExecutionBlock for EnumerateBlock<E> {
    fn initialize(&mut self, input: &Row) -> Result<()> {
        self.current = None;
        self.input.initialize(input)
    }

    fn produce(&mut self, ctx: &mut ExecContext, at_most: usize) -> Result<Batch> {
        let result = self.produce_rows(ctx, at_most);
        self.fail(result)
    }

    fn skip(&mut self, ctx: &mut ExecContext, n: u64) -> Result<u64> {
        let result = self.skip_rows(ctx, n);
        self.fail(result)
    }

    fn release(&mut self) {
        self.current = None;
        self.enumerator.release();
        self.input.release();
    }
}

/// Full scan over one collection. The cursor is opened once and rewound for
/// every further input row.
pub(crate) struct CollectionScan {
    collection: String,
    cursor: Option<Box<dyn Cursor>>,
}

impl CollectionScan {
    pub(crate) fn new(collection: String) -> Self {
        Self {
            collection,
            cursor: None,
        }
    }
}

impl Enumerator for CollectionScan {
    fn open(&mut self, ctx: &mut ExecContext, _row: &Row) -> Result<()> {
        match self.cursor.as_mut() {
            Some(cursor) => cursor.seek(DocKey::MIN),
            None => {
                self.cursor = Some(ctx.storage().collection_cursor(&self.collection)?);
                debug!(collection = self.collection.as_str(), "executor.cursor.open");
                Ok(())
            }
        }
    }

    fn next(&mut self, ctx: &mut ExecContext, _row: &Row) -> Result<Option<Value>> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };
        let doc = cursor.next()?;
        if doc.is_some() {
            ctx.stats.scanned_full += 1;
        }
        Ok(doc.map(|doc| doc.value))
    }

    fn skip(&mut self, ctx: &mut ExecContext, _row: &Row, n: u64) -> Result<u64> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(0);
        };
        let skipped = cursor.skip(n)?;
        ctx.stats.scanned_full += skipped;
        Ok(skipped)
    }

    fn release(&mut self) {
        if self.cursor.take().is_some() {
            trace!(collection = self.collection.as_str(), "executor.cursor.release");
        }
    }
}

/// Resolves one extra binding on top of a row.
struct Bound<'a> {
    row: &'a Row,
    var: VarId,
    value: &'a Value,
}

impl VarResolver for Bound<'_> {
    fn resolve(&self, var: VarId) -> Option<&Value> {
        if var == self.var {
            Some(self.value)
        } else {
            self.row.get(&var)
        }
    }
}

/// Scan over the collections linked to a view, filtered by the search
/// condition.
pub(crate) struct ViewScan {
    view: String,
    condition: Option<Expr>,
    out: VarId,
    collections: Vec<String>,
    next_collection: usize,
    cursor: Option<Box<dyn Cursor>>,
}

impl ViewScan {
    pub(crate) fn new(view: String, condition: Option<Expr>, out: VarId) -> Self {
        Self {
            view,
            condition,
            out,
            collections: Vec::new(),
            next_collection: 0,
            cursor: None,
        }
    }

    /// Current cursor, moving on to the next linked collection as needed.
    fn cursor(&mut self, ctx: &ExecContext) -> Result<Option<&mut Box<dyn Cursor>>> {
        if self.cursor.is_none() {
            let Some(collection) = self.collections.get(self.next_collection) else {
                return Ok(None);
            };
            self.cursor = Some(ctx.storage().collection_cursor(collection)?);
            self.next_collection += 1;
        }
        Ok(self.cursor.as_mut())
    }

    fn matches(&self, row: &Row, value: &Value) -> Result<bool> {
        let Some(condition) = &self.condition else {
            return Ok(true);
        };
        let bound = Bound {
            row,
            var: self.out,
            value,
        };
        Ok(condition.evaluate(&bound)?.is_truthy())
    }
}

impl Enumerator for ViewScan {
    fn open(&mut self, ctx: &mut ExecContext, _row: &Row) -> Result<()> {
        self.cursor = None;
        self.next_collection = 0;
        self.collections = ctx.storage().view_collections(&self.view)?;
        debug!(
            view = self.view.as_str(),
            collections = self.collections.len(),
            "executor.view.open"
        );
        Ok(())
    }

    fn next(&mut self, ctx: &mut ExecContext, row: &Row) -> Result<Option<Value>> {
        loop {
            let Some(cursor) = self.cursor(ctx)? else {
                return Ok(None);
            };
            let Some(doc) = cursor.next()? else {
                self.cursor = None;
                continue;
            };
            ctx.stats.scanned_full += 1;
            if self.matches(row, &doc.value)? {
                return Ok(Some(doc.value));
            }
            ctx.stats.filtered += 1;
        }
    }

    fn skip(&mut self, ctx: &mut ExecContext, row: &Row, n: u64) -> Result<u64> {
        let mut skipped = 0;
        if self.condition.is_some() {
            while skipped < n && self.next(ctx, row)?.is_some() {
                skipped += 1;
            }
            return Ok(skipped);
        }
        while skipped < n {
            let Some(cursor) = self.cursor(ctx)? else {
                break;
            };
            let want = n - skipped;
            let done = cursor.skip(want)?;
            ctx.stats.scanned_full += done;
            skipped += done;
            if done < want {
                self.cursor = None;
            }
        }
        Ok(skipped)
    }

    fn release(&mut self) {
        self.cursor = None;
        self.collections.clear();
    }
}

/// Iteration over an array-valued variable.
pub(crate) struct ListEnumerator {
    input: VarId,
    items: Vec<Value>,
    pos: usize,
}

impl ListEnumerator {
    pub(crate) fn new(input: VarId) -> Self {
        Self {
            input,
            items: Vec::new(),
            pos: 0,
        }
    }
}

impl Enumerator for ListEnumerator {
    fn open(&mut self, _ctx: &mut ExecContext, row: &Row) -> Result<()> {
        self.pos = 0;
        self.items = match row.get(&self.input) {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => {
                return Err(SpindleError::InvalidOwned(format!(
                    "FOR expects an array, got {}",
                    other.type_name()
                )))
            }
            None => {
                return Err(SpindleError::InvalidOwned(format!(
                    "loop source variable {} is not bound",
                    self.input
                )))
            }
        };
        Ok(())
    }

    fn next(&mut self, _ctx: &mut ExecContext, _row: &Row) -> Result<Option<Value>> {
        let Some(slot) = self.items.get_mut(self.pos) else {
            return Ok(None);
        };
        self.pos += 1;
        Ok(Some(std::mem::replace(slot, Value::Null)))
    }

    fn skip(&mut self, _ctx: &mut ExecContext, _row: &Row, n: u64) -> Result<u64> {
        let remaining = (self.items.len() - self.pos) as u64;
        let skipped = remaining.min(n);
        self.pos += skipped as usize;
        Ok(skipped)
    }

    fn release(&mut self) {
        self.items = Vec::new();
        self.pos = 0;
    }
}
