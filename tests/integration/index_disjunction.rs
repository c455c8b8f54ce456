#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::json;
use spindle::query::{Expr, Plan, PlanBuilder, QueryOptions, Value};
use spindle::storage::MemoryStore;
use spindle::types::VarId;
use spindle::{QueryEngine, Result};

/// 7^4 documents, one per combination of `a`, `b`, `c`, `d` in `0..7`, with
/// hash indexes on `a`, `b` and `c`.
fn engine() -> Result<QueryEngine> {
    let mut store = MemoryStore::new();
    store.create_collection("grid")?;
    for a in 0..7i64 {
        for b in 0..7i64 {
            for c in 0..7i64 {
                for d in 0..7i64 {
                    store.insert(
                        "grid",
                        Value::from_json(json!({ "a": a, "b": b, "c": c, "d": d })),
                    )?;
                }
            }
        }
    }
    store.ensure_index("grid", "idx_a", "a")?;
    store.ensure_index("grid", "idx_b", "b")?;
    store.ensure_index("grid", "idx_c", "c")?;
    Ok(QueryEngine::new(Arc::new(store)))
}

fn equals_one(doc: VarId, fields: &[&str]) -> Expr {
    Expr::any(
        fields
            .iter()
            .map(|field| Expr::eq(Expr::var(doc).attr(*field), Expr::lit(1i64))),
    )
}

fn disjunction(fields: &[&str], window: Option<(u64, u64)>) -> Result<Plan> {
    let mut b = PlanBuilder::new();
    let doc = b.for_collection("doc", "grid")?;
    b.filter(equals_one(doc, fields))?;
    if let Some((offset, limit)) = window {
        b.limit(offset, limit)?;
    }
    b.return_(Expr::var(doc))?;
    b.build()
}

fn keys(rows: &[Value]) -> BTreeSet<String> {
    rows.iter()
        .filter_map(|row| row.attribute("_key").as_str().map(str::to_owned))
        .collect()
}

#[test]
fn explain_lists_one_index_per_disjunct() -> Result<()> {
    let engine = engine()?;
    let output = engine.explain(&disjunction(&["a", "b"], None)?, &QueryOptions::default())?;
    assert_eq!(
        output.node_types(),
        vec!["SingletonNode", "IndexNode", "ReturnNode"]
    );
    let index = output.find("IndexNode").map(|node| node.attributes["indexes"].clone());
    assert_eq!(
        index,
        Some(json!([
            { "name": "idx_a", "fields": ["a"] },
            { "name": "idx_b", "fields": ["b"] },
        ]))
    );
    Ok(())
}

#[test]
fn two_overlapping_disjuncts_return_each_document_once() -> Result<()> {
    let engine = engine()?;
    let result = engine.execute(&disjunction(&["a", "b"], None)?, &QueryOptions::default())?;
    assert_eq!(result.rows.len(), 637);
    assert_eq!(keys(&result.rows).len(), 637);
    assert_eq!(result.stats.scanned_index, 686);
    assert_eq!(result.stats.scanned_full, 0);
    Ok(())
}

#[test]
fn three_disjuncts_follow_inclusion_exclusion() -> Result<()> {
    let engine = engine()?;
    let result = engine.execute(
        &disjunction(&["a", "b", "c"], None)?,
        &QueryOptions::default(),
    )?;
    assert_eq!(result.rows.len(), 889);
    assert_eq!(result.stats.scanned_index, 3 * 343);
    Ok(())
}

#[test]
fn window_applies_to_the_deduplicated_stream() -> Result<()> {
    let engine = engine()?;
    let options = QueryOptions::default().with_full_count(true);
    let full = engine.execute(&disjunction(&["a", "b"], None)?, &options)?;
    let window = engine.execute(&disjunction(&["a", "b"], Some((100, 50)))?, &options)?;

    assert_eq!(window.rows.as_slice(), &full.rows[100..150]);
    assert_eq!(window.stats.full_count, 637);
    assert_eq!(window.stats.scanned_index, 686);

    // Offsets reaching into the second cursor count the duplicates passed on the way.
    let late = engine.execute(&disjunction(&["a", "b"], Some((600, 100)))?, &options)?;
    assert_eq!(late.rows.len(), 37);
    assert_eq!(late.stats.full_count, 637);
    assert_eq!(late.stats.scanned_index, 686);
    Ok(())
}

#[test]
fn raw_scan_counter_does_not_depend_on_the_window() -> Result<()> {
    let engine = engine()?;
    let options = QueryOptions::default();

    let two = engine.execute(&disjunction(&["a", "b"], Some((37, 100)))?, &options)?;
    assert_eq!(two.rows.len(), 100);
    assert_eq!(two.stats.scanned_index, 686);

    let three = engine.execute(&disjunction(&["a", "b", "c"], Some((89, 100)))?, &options)?;
    assert_eq!(three.rows.len(), 100);
    assert_eq!(three.stats.scanned_index, 3 * 343);

    let full = engine.execute(&disjunction(&["a", "b", "c"], None)?, &options)?;
    assert_eq!(three.rows.as_slice(), &full.rows[89..189]);
    Ok(())
}

#[test]
fn single_index_scan_stops_after_the_window() -> Result<()> {
    let engine = engine()?;
    let result = engine.execute(
        &disjunction(&["a"], Some((43, 100)))?,
        &QueryOptions::default(),
    )?;
    assert_eq!(result.rows.len(), 100);
    assert_eq!(result.stats.scanned_index, 143);
    Ok(())
}

#[test]
fn results_match_a_full_scan() -> Result<()> {
    let engine = engine()?;
    let plan = disjunction(&["a", "b", "c"], None)?;
    let indexed = engine.execute(&plan, &QueryOptions::default())?;
    let scanned = engine.execute(&plan, &QueryOptions::default().with_rules(["-use-indexes"]))?;

    assert_eq!(keys(&indexed.rows), keys(&scanned.rows));
    assert_eq!(scanned.stats.scanned_full, 2401);
    assert_eq!(scanned.stats.scanned_index, 0);
    Ok(())
}

#[test]
fn lookups_may_read_outer_loop_variables() -> Result<()> {
    let engine = engine()?;
    let mut b = PlanBuilder::new();
    let v = b.for_in("v", Expr::array([1i64, 2]))?;
    let doc = b.for_collection("doc", "grid")?;
    b.filter(Expr::eq(Expr::var(v), Expr::var(doc).attr("a")))?;
    b.return_(Expr::var(doc).attr("a"))?;
    let plan = b.build()?;

    let output = engine.explain(&plan, &QueryOptions::default())?;
    assert!(output.find("IndexNode").is_some());
    let result = engine.execute(&plan, &QueryOptions::default())?;
    assert_eq!(result.rows.len(), 686);
    assert_eq!(result.rows[343], Value::Int(2));
    Ok(())
}

#[test]
fn bind_parameters_feed_index_lookups() -> Result<()> {
    let engine = engine()?;
    let mut b = PlanBuilder::new();
    let doc = b.for_collection("doc", "@coll")?;
    b.filter(Expr::eq(Expr::var(doc).attr("b"), Expr::param("value")))?;
    b.return_(Expr::var(doc))?;
    let plan = b.build()?;

    let options = QueryOptions::default()
        .with_bind_var("@coll", "grid")
        .with_bind_var("value", 6i64);
    let result = engine.execute(&plan, &options)?;
    assert_eq!(result.rows.len(), 343);
    assert_eq!(result.stats.scanned_index, 343);
    Ok(())
}
