//! Index scan over an OR of equality lookups.
//!
//! A single lookup streams straight from its index cursor, so a `LIMIT`
//! above it stops the scan early. With more than one disjunct every cursor
//! is drained when the scan opens: each visited index entry is counted,
//! duplicates included, and the keys are deduplicated in visit order. The
//! raw-scan counter therefore does not depend on how many rows are consumed.
//! Documents are fetched by key only when a row is produced.

use rustc_hash::FxHashSet;
use tracing::{debug, trace};

use crate::error::{Result, SpindleError};
use crate::query::exec::block::Row;
use crate::query::exec::scan::Enumerator;
use crate::query::exec::ExecContext;
use crate::query::plan::IndexDisjunct;
use crate::query::value::Value;
use crate::storage::Cursor;
use crate::types::DocKey;

enum Source {
    Closed,
    Lazy(Box<dyn Cursor>),
    Merged { keys: Vec<DocKey>, pos: usize },
}

pub(crate) struct IndexScan {
    collection: String,
    disjuncts: Vec<IndexDisjunct>,
    source: Source,
}

impl IndexScan {
    pub(crate) fn new(collection: String, disjuncts: Vec<IndexDisjunct>) -> Self {
        Self {
            collection,
            disjuncts,
            source: Source::Closed,
        }
    }

    fn merge(ctx: &mut ExecContext, cursors: Vec<Box<dyn Cursor>>) -> Result<Vec<DocKey>> {
        let mut seen = FxHashSet::default();
        let mut keys = Vec::new();
        for (disjunct, mut cursor) in cursors.into_iter().enumerate() {
            while let Some(key) = cursor.next_key()? {
                ctx.stats.scanned_index += 1;
                if seen.insert(key) {
                    keys.push(key);
                }
            }
            trace!(disjunct, "executor.index.disjunct_done");
        }
        Ok(keys)
    }
}

impl Enumerator for IndexScan {
    fn open(&mut self, ctx: &mut ExecContext, row: &Row) -> Result<()> {
        self.release();
        let mut cursors = Vec::with_capacity(self.disjuncts.len());
        for disjunct in &self.disjuncts {
            let lookup = disjunct.lookup.evaluate(row)?;
            cursors.push(
                ctx.storage()
                    .index_cursor(&self.collection, &disjunct.index, &lookup)?,
            );
        }
        debug!(
            collection = self.collection.as_str(),
            disjuncts = cursors.len(),
            "executor.index.open"
        );
        self.source = if cursors.len() == 1 {
            cursors.pop().map_or(Source::Closed, Source::Lazy)
        } else {
            let keys = Self::merge(ctx, cursors)?;
            debug!(
                collection = self.collection.as_str(),
                distinct = keys.len(),
                "executor.index.merged"
            );
            Source::Merged { keys, pos: 0 }
        };
        Ok(())
    }

    fn next(&mut self, ctx: &mut ExecContext, _row: &Row) -> Result<Option<Value>> {
        match &mut self.source {
            Source::Closed => Ok(None),
            Source::Lazy(cursor) => {
                let doc = cursor.next()?;
                if doc.is_some() {
                    ctx.stats.scanned_index += 1;
                }
                Ok(doc.map(|doc| doc.value))
            }
            Source::Merged { keys, pos } => {
                let Some(key) = keys.get(*pos).copied() else {
                    return Ok(None);
                };
                *pos += 1;
                let doc = ctx.storage().document(&self.collection, key)?.ok_or_else(|| {
                    SpindleError::Storage(format!(
                        "indexed document {key} missing from '{}'",
                        self.collection
                    ))
                })?;
                Ok(Some(doc.value))
            }
        }
    }

    fn skip(&mut self, ctx: &mut ExecContext, _row: &Row, n: u64) -> Result<u64> {
        match &mut self.source {
            Source::Closed => Ok(0),
            Source::Lazy(cursor) => {
                let skipped = cursor.skip(n)?;
                ctx.stats.scanned_index += skipped;
                Ok(skipped)
            }
            Source::Merged { keys, pos } => {
                let remaining = (keys.len() - *pos) as u64;
                let skipped = n.min(remaining);
                *pos += skipped as usize;
                Ok(skipped)
            }
        }
    }

    fn release(&mut self) {
        self.source = Source::Closed;
    }
}
