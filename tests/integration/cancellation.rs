#![allow(missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;
use spindle::query::{Expr, Plan, PlanBuilder, QueryOptions, Value};
use spindle::storage::{Cursor, Document, IndexDef, MemoryStore, StorageEngine};
use spindle::types::DocKey;
use spindle::{QueryEngine, Result, SpindleError};

/// Wraps a [`MemoryStore`] and tracks how many cursors are alive.
struct TrackingStore {
    inner: MemoryStore,
    open: Arc<AtomicUsize>,
    fail_after: Option<u64>,
    broken_index: Option<&'static str>,
}

impl TrackingStore {
    fn track(&self, inner: Box<dyn Cursor>) -> Box<dyn Cursor> {
        self.open.fetch_add(1, Ordering::SeqCst);
        Box::new(TrackedCursor {
            inner,
            open: Arc::clone(&self.open),
            fail_after: self.fail_after,
            served: 0,
        })
    }
}

impl StorageEngine for TrackingStore {
    fn collection_cursor(&self, collection: &str) -> Result<Box<dyn Cursor>> {
        Ok(self.track(self.inner.collection_cursor(collection)?))
    }

    fn index_cursor(
        &self,
        collection: &str,
        index: &str,
        lookup: &Value,
    ) -> Result<Box<dyn Cursor>> {
        if self.broken_index == Some(index) {
            return Err(SpindleError::Storage(format!("index {index} is corrupt")));
        }
        Ok(self.track(self.inner.index_cursor(collection, index, lookup)?))
    }

    fn indexes(&self, collection: &str) -> Result<Vec<IndexDef>> {
        self.inner.indexes(collection)
    }

    fn view_collections(&self, view: &str) -> Result<Vec<String>> {
        self.inner.view_collections(view)
    }
}

struct TrackedCursor {
    inner: Box<dyn Cursor>,
    open: Arc<AtomicUsize>,
    fail_after: Option<u64>,
    served: u64,
}

impl TrackedCursor {
    fn tick(&mut self) -> Result<()> {
        if self.fail_after == Some(self.served) {
            return Err(SpindleError::Storage("read failed".into()));
        }
        self.served += 1;
        Ok(())
    }
}

impl Cursor for TrackedCursor {
    fn next(&mut self) -> Result<Option<Document>> {
        self.tick()?;
        self.inner.next()
    }

    fn next_key(&mut self) -> Result<Option<DocKey>> {
        self.tick()?;
        self.inner.next_key()
    }

    fn seek(&mut self, key: DocKey) -> Result<()> {
        self.inner.seek(key)
    }
}

impl Drop for TrackedCursor {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

fn store() -> Result<MemoryStore> {
    let mut store = MemoryStore::new();
    store.create_collection("c")?;
    for i in 0..100i64 {
        store.insert("c", Value::from_json(json!({ "n": i, "m": i % 10 })))?;
    }
    store.ensure_index("c", "idx_n", "n")?;
    store.ensure_index("c", "idx_m", "m")?;
    Ok(store)
}

fn engine(
    fail_after: Option<u64>,
    broken_index: Option<&'static str>,
) -> Result<(QueryEngine, Arc<AtomicUsize>)> {
    let open = Arc::new(AtomicUsize::new(0));
    let tracking = TrackingStore {
        inner: store()?,
        open: Arc::clone(&open),
        fail_after,
        broken_index,
    };
    Ok((QueryEngine::new(Arc::new(tracking)), open))
}

fn scan() -> Result<Plan> {
    let mut b = PlanBuilder::new();
    let doc = b.for_collection("doc", "c")?;
    b.return_(Expr::var(doc).attr("n"))?;
    b.build()
}

fn small_batches() -> QueryOptions {
    QueryOptions::default().with_batch_size(10)
}

#[test]
fn abort_between_pulls_fails_the_next_pull() -> Result<()> {
    let (engine, open) = engine(None, None)?;
    let mut cursor = engine.cursor(&scan()?, &small_batches())?;

    let first = cursor.next_batch()?;
    assert_eq!(first.map(|rows| rows.len()), Some(10));
    assert_eq!(open.load(Ordering::SeqCst), 1);

    cursor.abort_handle().abort();
    let err = cursor.next_batch().err();
    assert!(matches!(err, Some(SpindleError::Aborted)));
    assert_eq!(open.load(Ordering::SeqCst), 0);
    assert!(cursor.next_batch()?.is_none());
    Ok(())
}

#[test]
fn abort_before_the_first_pull() -> Result<()> {
    let (engine, open) = engine(None, None)?;
    let mut cursor = engine.cursor(&scan()?, &small_batches())?;
    let handle = cursor.abort_handle();
    handle.abort();
    assert!(handle.is_aborted());

    assert!(matches!(cursor.next_batch(), Err(SpindleError::Aborted)));
    assert_eq!(open.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn dropping_a_cursor_releases_storage() -> Result<()> {
    let (engine, open) = engine(None, None)?;
    let mut cursor = engine.cursor(&scan()?, &small_batches())?;
    cursor.next_batch()?;
    assert_eq!(open.load(Ordering::SeqCst), 1);

    drop(cursor);
    assert_eq!(open.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn exhaustion_releases_storage() -> Result<()> {
    let (engine, open) = engine(None, None)?;
    let result = engine.execute(&scan()?, &small_batches())?;
    assert_eq!(result.rows.len(), 100);
    assert_eq!(open.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn storage_errors_pass_through_unchanged() -> Result<()> {
    let (engine, open) = engine(Some(25), None)?;
    let mut cursor = engine.cursor(&scan()?, &small_batches())?;
    cursor.next_batch()?;
    cursor.next_batch()?;

    match cursor.next_batch() {
        Err(SpindleError::Storage(message)) => assert_eq!(message, "read failed"),
        other => panic!("expected storage error, got {other:?}"),
    }
    assert_eq!(open.load(Ordering::SeqCst), 0);
    assert!(cursor.is_exhausted());
    Ok(())
}

#[test]
fn storage_errors_surface_while_skipping() -> Result<()> {
    let (engine, open) = engine(Some(25), None)?;
    let mut b = PlanBuilder::new();
    let doc = b.for_collection("doc", "c")?;
    b.limit(50, 5)?;
    b.return_(Expr::var(doc))?;
    let err = engine.execute(&b.build()?, &QueryOptions::default()).err();

    assert_eq!(err.map(|err| err.code()), Some("Storage"));
    assert_eq!(open.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn failing_disjunct_closes_the_cursors_already_open() -> Result<()> {
    let (engine, open) = engine(None, Some("idx_m"))?;
    let mut b = PlanBuilder::new();
    let doc = b.for_collection("doc", "c")?;
    b.filter(Expr::any([
        Expr::eq(Expr::var(doc).attr("n"), Expr::lit(3i64)),
        Expr::eq(Expr::var(doc).attr("m"), Expr::lit(3i64)),
    ]))?;
    b.return_(Expr::var(doc))?;
    let plan = b.build()?;

    let explained = engine.explain(&plan, &QueryOptions::default())?;
    assert!(explained.find("IndexNode").is_some());
    let err = engine.execute(&plan, &QueryOptions::default()).err();
    assert_eq!(err.map(|err| err.code()), Some("Storage"));
    assert_eq!(open.load(Ordering::SeqCst), 0);
    Ok(())
}
