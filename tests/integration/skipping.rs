#![allow(missing_docs)]

use std::sync::Arc;

use spindle::query::{Expr, Plan, PlanBuilder, QueryOptions, QueryResult, Value};
use spindle::storage::MemoryStore;
use spindle::{QueryEngine, Result};

const DOCS: i64 = 2000;

fn engine() -> Result<QueryEngine> {
    let mut store = MemoryStore::new();
    store.create_collection("c")?;
    for i in 0..DOCS {
        store.insert("c", Value::from_json(serde_json::json!({ "value": i })))?;
    }
    Ok(QueryEngine::new(Arc::new(store)))
}

fn scan_with_limit(offset: u64, limit: u64) -> Result<Plan> {
    let mut b = PlanBuilder::new();
    let doc = b.for_collection("doc", "c")?;
    b.limit(offset, limit)?;
    b.return_(Expr::var(doc).attr("value"))?;
    b.build()
}

fn full_count() -> QueryOptions {
    QueryOptions::default().with_full_count(true)
}

fn run(plan: &Plan, options: &QueryOptions) -> Result<QueryResult> {
    engine()?.execute(plan, options)
}

#[test]
fn offset_beyond_the_input_still_counts_everything() -> Result<()> {
    for limit in [0, 1, 300, 5000] {
        let result = run(&scan_with_limit(3000, limit)?, &full_count())?;
        assert!(result.rows.is_empty());
        assert_eq!(result.stats.full_count, 2000);
        assert_eq!(result.stats.scanned_full, 2000);
    }
    Ok(())
}

#[test]
fn window_in_the_middle_touches_each_document_once() -> Result<()> {
    let result = run(&scan_with_limit(900, 300)?, &full_count())?;
    assert_eq!(result.rows.len(), 300);
    assert_eq!(result.rows[0], Value::Int(900));
    assert_eq!(result.rows[299], Value::Int(1199));
    assert_eq!(result.stats.full_count, 2000);
    assert_eq!(result.stats.scanned_full, 2000);
    Ok(())
}

#[test]
fn without_full_count_the_scan_stops_at_the_window() -> Result<()> {
    let result = run(&scan_with_limit(900, 300)?, &QueryOptions::default())?;
    assert_eq!(result.rows.len(), 300);
    assert_eq!(result.stats.scanned_full, 1200);
    assert_eq!(result.stats.full_count, 0);

    let result = run(&scan_with_limit(10, 10)?, &QueryOptions::default())?;
    assert_eq!(result.stats.scanned_full, 20);
    Ok(())
}

#[test]
fn filter_skips_by_evaluating_candidates() -> Result<()> {
    let mut b = PlanBuilder::new();
    let doc = b.for_collection("doc", "c")?;
    b.filter(Expr::lt(Expr::var(doc).attr("value"), Expr::lit(1000i64)))?;
    b.limit(100, 10)?;
    b.return_(Expr::var(doc).attr("value"))?;
    let result = run(&b.build()?, &full_count())?;

    assert_eq!(result.rows.first(), Some(&Value::Int(100)));
    assert_eq!(result.rows.len(), 10);
    assert_eq!(result.stats.full_count, 1000);
    assert_eq!(result.stats.filtered, 1000);
    assert_eq!(result.stats.scanned_full, 2000);
    Ok(())
}

#[test]
fn sorted_window_with_full_count() -> Result<()> {
    let mut b = PlanBuilder::new();
    let doc = b.for_collection("doc", "c")?;
    b.sort([(Expr::var(doc).attr("value"), false)])?;
    b.limit(0, 3)?;
    b.return_(Expr::var(doc).attr("value"))?;
    let result = run(&b.build()?, &full_count())?;

    assert_eq!(
        result.rows,
        vec![Value::Int(1999), Value::Int(1998), Value::Int(1997)]
    );
    assert_eq!(result.stats.full_count, 2000);
    Ok(())
}

#[test]
fn skip_crosses_outer_loop_iterations() -> Result<()> {
    let mut b = PlanBuilder::new();
    let i = b.for_in("i", Expr::range(1, 3))?;
    let doc = b.for_collection("doc", "c")?;
    b.limit(2500, 2)?;
    b.return_(Expr::array_of([Expr::var(i), Expr::var(doc).attr("value")]))?;
    let result = run(&b.build()?, &full_count())?;

    assert_eq!(
        result.rows,
        vec![
            Value::from_json(serde_json::json!([2, 500])),
            Value::from_json(serde_json::json!([2, 501])),
        ]
    );
    assert_eq!(result.stats.full_count, 6000);
    assert_eq!(result.stats.scanned_full, 6000);
    Ok(())
}

#[test]
fn limits_inside_subqueries_do_not_affect_the_full_count() -> Result<()> {
    let mut b = PlanBuilder::new();
    let doc = b.for_collection("doc", "c")?;
    let firsts = b.subquery("firsts", |s| {
        let j = s.for_in("j", Expr::range(1, 10))?;
        s.limit(0, 2)?;
        s.return_(Expr::var(j))
    })?;
    b.limit(5, 2)?;
    b.return_(Expr::array_of([Expr::var(doc).attr("value"), Expr::var(firsts)]))?;
    // The subquery's output is read by the return, so it stays a subquery.
    let result = run(&b.build()?, &full_count())?;

    assert_eq!(
        result.rows,
        vec![
            Value::from_json(serde_json::json!([5, [1, 2]])),
            Value::from_json(serde_json::json!([6, [1, 2]])),
        ]
    );
    assert_eq!(result.stats.full_count, 2000);
    Ok(())
}

#[test]
fn full_count_without_limit_is_the_result_size() -> Result<()> {
    let mut b = PlanBuilder::new();
    let doc = b.for_collection("doc", "c")?;
    b.filter(Expr::ge(Expr::var(doc).attr("value"), Expr::lit(1500i64)))?;
    b.return_(Expr::var(doc))?;
    let result = run(&b.build()?, &full_count())?;
    assert_eq!(result.rows.len(), 500);
    assert_eq!(result.stats.full_count, 500);
    Ok(())
}

#[test]
fn cursor_batches_respect_the_batch_size() -> Result<()> {
    let engine = engine()?;
    let plan = scan_with_limit(0, 250)?;
    let options = QueryOptions::default().with_batch_size(100);
    let mut cursor = engine.cursor(&plan, &options)?;

    let mut sizes = Vec::new();
    while let Some(batch) = cursor.next_batch()? {
        sizes.push(batch.len());
    }
    assert_eq!(sizes, vec![100, 100, 50]);
    assert!(cursor.is_exhausted());
    assert_eq!(cursor.stats().scanned_full, 250);
    Ok(())
}
