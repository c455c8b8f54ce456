#![allow(missing_docs)]

use std::sync::Arc;

use spindle::query::optimizer::safety::find_candidate;
use spindle::query::optimizer::INLINE_SUBQUERIES;
use spindle::query::{Expr, Plan, PlanBuilder, QueryOptions, Value};
use spindle::storage::MemoryStore;
use spindle::{QueryEngine, Result, SpindleError};

fn engine() -> Result<QueryEngine> {
    let mut store = MemoryStore::new();
    store.create_collection("users")?;
    for i in 0..40i64 {
        store.insert(
            "users",
            Value::from_json(serde_json::json!({ "n": i, "group": i % 4 })),
        )?;
    }
    store.create_view("people", vec!["users".to_owned()])?;
    Ok(QueryEngine::new(Arc::new(store)))
}

fn without_inlining() -> QueryOptions {
    QueryOptions::default().with_rules(["-inline-subqueries"])
}

/// Runs `plan` with and without inlining and checks the rows agree.
fn same_rows(engine: &QueryEngine, plan: &Plan) -> Result<Vec<Value>> {
    let inlined = engine.execute(plan, &QueryOptions::default())?;
    let plain = engine.execute(plan, &without_inlining())?;
    assert_eq!(inlined.rows, plain.rows);
    Ok(inlined.rows)
}

#[test]
fn collection_subquery_is_inlined() -> Result<()> {
    let engine = engine()?;
    let mut b = PlanBuilder::new();
    let x = b.subquery("x", |s| {
        let u = s.for_collection("u", "users")?;
        s.return_(Expr::var(u).attr("n"))
    })?;
    let n = b.for_in("n", Expr::var(x))?;
    b.return_(Expr::var(n))?;
    let plan = b.build()?;

    let raw = engine.explain_raw(&plan)?;
    assert_eq!(
        raw.node_types(),
        vec!["SingletonNode", "SubqueryNode", "EnumerateListNode", "ReturnNode"]
    );
    let explained = engine.explain(&plan, &QueryOptions::default())?;
    assert_eq!(explained.rules, vec![INLINE_SUBQUERIES.to_owned()]);
    assert_eq!(
        explained.node_types(),
        vec![
            "SingletonNode",
            "EnumerateCollectionNode",
            "CalculationNode",
            "ReturnNode"
        ]
    );
    assert_eq!(same_rows(&engine, &plan)?.len(), 40);
    Ok(())
}

#[test]
fn inner_sort_limit_and_filter_survive_the_splice() -> Result<()> {
    let engine = engine()?;
    let mut b = PlanBuilder::new();
    let x = b.subquery("x", |s| {
        let u = s.for_collection("u", "users")?;
        s.filter(Expr::eq(Expr::var(u).attr("group"), Expr::lit(1i64)))?;
        s.sort([(Expr::var(u).attr("n"), false)])?;
        s.limit(1, 3)?;
        s.return_(Expr::var(u).attr("n"))
    })?;
    let n = b.for_in("n", Expr::var(x))?;
    b.return_(Expr::var(n))?;
    let plan = b.build()?;

    let explained = engine.explain(&plan, &QueryOptions::default())?;
    assert!(explained.find("SubqueryNode").is_none());
    assert!(explained.find("LimitNode").is_some());
    assert_eq!(
        same_rows(&engine, &plan)?,
        vec![Value::Int(33), Value::Int(29), Value::Int(25)]
    );
    Ok(())
}

#[test]
fn grouping_survives_the_splice() -> Result<()> {
    let engine = engine()?;
    let mut b = PlanBuilder::new();
    let x = b.subquery("x", |s| {
        let u = s.for_collection("u", "users")?;
        let vars = s.collect(
            vec![("g", Expr::var(u).attr("group"))],
            None,
            Some("size"),
        )?;
        let size = vars.count.ok_or(SpindleError::Invalid("missing count"))?;
        s.return_(Expr::array_of([Expr::var(vars.groups[0]), Expr::var(size)]))
    })?;
    let row = b.for_in("row", Expr::var(x))?;
    b.return_(Expr::var(row))?;
    let plan = b.build()?;

    let rows = same_rows(&engine, &plan)?;
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0], Value::from_json(serde_json::json!([0, 10])));
    Ok(())
}

#[test]
fn second_use_in_return_blocks_inlining() -> Result<()> {
    let engine = engine()?;
    let mut b = PlanBuilder::new();
    let x = b.subquery("x", |s| {
        let u = s.for_collection("u", "users")?;
        s.limit(0, 2)?;
        s.return_(Expr::var(u).attr("n"))
    })?;
    let n = b.for_in("n", Expr::var(x))?;
    b.return_(Expr::array_of([Expr::var(n), Expr::var(x)]))?;
    let plan = b.build()?;

    let explained = engine.explain(&plan, &QueryOptions::default())?;
    assert!(explained.rules.is_empty());
    assert!(explained.find("SubqueryNode").is_some());
    let rows = same_rows(&engine, &plan)?;
    assert_eq!(rows[1], Value::from_json(serde_json::json!([1, [0, 1]])));
    Ok(())
}

#[test]
fn deeply_nested_length_check_blocks_inlining() -> Result<()> {
    let mut b = PlanBuilder::new();
    let x = b.subquery("x", |s| {
        let u = s.for_collection("u", "users")?;
        s.return_(Expr::var(u))
    })?;
    let doc = b.for_in("doc", Expr::var(x))?;
    let outer = b.subquery("outer", |s| {
        let inner = s.subquery("inner", |t| {
            let i = t.for_in("i", Expr::range(1, 2))?;
            t.filter(Expr::gt(Expr::length(Expr::var(x)), Expr::lit(0i64)))?;
            t.return_(Expr::var(i))
        })?;
        s.return_(Expr::var(inner))
    })?;
    b.return_(Expr::array_of([Expr::var(doc), Expr::var(outer)]))?;
    let plan = b.build()?;

    assert!(find_candidate(&plan).is_none());
    let engine = engine()?;
    let explained = engine.explain(&plan, &QueryOptions::default())?;
    let subqueries = explained
        .node_types()
        .into_iter()
        .filter(|t| *t == "SubqueryNode")
        .count();
    assert_eq!(subqueries, 2);
    Ok(())
}

#[test]
fn chain_of_subqueries_collapses_in_one_pass() -> Result<()> {
    let engine = engine()?;
    let mut b = PlanBuilder::new();
    let a = b.subquery("a", |s| {
        let bq = s.subquery("b", |t| {
            let cq = t.subquery("c", |u| {
                let doc = u.for_collection("doc", "users")?;
                u.filter(Expr::lt(Expr::var(doc).attr("n"), Expr::lit(5i64)))?;
                u.return_(Expr::var(doc).attr("n"))
            })?;
            let cv = t.for_in("cv", Expr::var(cq))?;
            t.return_(Expr::var(cv))
        })?;
        let bv = s.for_in("bv", Expr::var(bq))?;
        s.return_(Expr::var(bv))
    })?;
    let av = b.for_in("av", Expr::var(a))?;
    b.return_(Expr::var(av))?;
    let plan = b.build()?;

    let (rewritten, rules) = engine.prepare(&plan, &QueryOptions::default())?;
    assert_eq!(rules, vec![INLINE_SUBQUERIES]);
    assert_eq!(rewritten.scopes()?.len(), 1);

    let (again, rules) = engine.prepare(&rewritten, &QueryOptions::default())?;
    assert!(rules.is_empty());
    assert_eq!(again, rewritten);
    assert_eq!(same_rows(&engine, &plan)?.len(), 5);
    Ok(())
}

#[test]
fn limit_under_an_outer_loop_is_kept_materialized() -> Result<()> {
    let engine = engine()?;
    let mut b = PlanBuilder::new();
    let i = b.for_in("i", Expr::range(1, 3))?;
    let x = b.subquery("x", |s| {
        let u = s.for_collection("u", "users")?;
        s.limit(0, 2)?;
        s.return_(Expr::var(u).attr("n"))
    })?;
    let n = b.for_in("n", Expr::var(x))?;
    b.return_(Expr::array_of([Expr::var(i), Expr::var(n)]))?;
    let plan = b.build()?;

    let explained = engine.explain(&plan, &QueryOptions::default())?;
    assert!(explained.rules.is_empty());
    assert_eq!(same_rows(&engine, &plan)?.len(), 6);
    Ok(())
}

#[test]
fn correlated_subquery_without_windowing_is_inlined() -> Result<()> {
    let engine = engine()?;
    let mut b = PlanBuilder::new();
    let g = b.for_in("g", Expr::array([0i64, 2]))?;
    let x = b.subquery("x", |s| {
        let u = s.for_collection("u", "users")?;
        s.filter(Expr::eq(Expr::var(u).attr("group"), Expr::var(g)))?;
        s.return_(Expr::var(u).attr("n"))
    })?;
    let n = b.for_in("n", Expr::var(x))?;
    b.return_(Expr::var(n))?;
    let plan = b.build()?;

    let explained = engine.explain(&plan, &QueryOptions::default())?;
    assert_eq!(explained.rules, vec![INLINE_SUBQUERIES.to_owned()]);
    let rows = same_rows(&engine, &plan)?;
    assert_eq!(rows.len(), 20);
    assert_eq!(rows[10], Value::Int(2));
    Ok(())
}

#[test]
fn view_condition_keeps_reading_outer_variables() -> Result<()> {
    let engine = engine()?;
    let mut b = PlanBuilder::new();
    let g = b.for_in("g", Expr::array([1i64, 3]))?;
    let x = b.subquery("x", |s| {
        let p = s.for_view("p", "people", |p| {
            Some(Expr::eq(Expr::var(p).attr("group"), Expr::var(g)))
        })?;
        s.return_(Expr::var(p).attr("n"))
    })?;
    let n = b.for_in("n", Expr::var(x))?;
    b.return_(Expr::var(n))?;
    let plan = b.build()?;

    let explained = engine.explain(&plan, &QueryOptions::default())?;
    assert!(explained.find("EnumerateViewNode").is_some());
    assert!(explained.find("SubqueryNode").is_none());
    let rows = same_rows(&engine, &plan)?;
    assert_eq!(rows.len(), 20);
    assert_eq!(rows[0], Value::Int(1));
    assert_eq!(rows[10], Value::Int(3));
    Ok(())
}

#[test]
fn distinct_body_is_inlined_at_top_level() -> Result<()> {
    let engine = engine()?;
    let mut b = PlanBuilder::new();
    let x = b.subquery("x", |s| {
        let u = s.for_collection("u", "users")?;
        s.return_distinct(Expr::var(u).attr("group"))
    })?;
    let g = b.for_in("g", Expr::var(x))?;
    b.return_(Expr::var(g))?;
    let plan = b.build()?;

    let explained = engine.explain(&plan, &QueryOptions::default())?;
    assert_eq!(explained.rules, vec![INLINE_SUBQUERIES.to_owned()]);
    assert_eq!(
        same_rows(&engine, &plan)?,
        vec![Value::Int(0), Value::Int(1), Value::Int(2), Value::Int(3)]
    );
    Ok(())
}

#[test]
fn full_count_does_not_depend_on_inlining() -> Result<()> {
    let engine = engine()?;
    let counted = |options: QueryOptions| options.with_full_count(true);

    let mut b = PlanBuilder::new();
    let x = b.subquery("x", |s| {
        let j = s.for_in("j", Expr::array([1i64, 2, 3, 4]))?;
        s.limit(0, 2)?;
        s.return_(Expr::var(j))
    })?;
    let k = b.for_in("k", Expr::var(x))?;
    b.return_(Expr::var(k))?;
    let inner_limit_only = b.build()?;

    let mut b = PlanBuilder::new();
    let x = b.subquery("x", |s| {
        let j = s.for_in("j", Expr::array([1i64, 2, 3, 4]))?;
        s.sort([(Expr::var(j), false)])?;
        s.limit(0, 3)?;
        s.return_(Expr::var(j))
    })?;
    let k = b.for_in("k", Expr::var(x))?;
    b.limit(0, 2)?;
    b.return_(Expr::var(k))?;
    let both_limits = b.build()?;

    for (plan, rows, total) in [
        (inner_limit_only, vec![1i64, 2], 2),
        (both_limits, vec![4, 3], 3),
    ] {
        let explained = engine.explain(&plan, &QueryOptions::default())?;
        assert_eq!(explained.rules, vec![INLINE_SUBQUERIES.to_owned()]);

        let inlined = engine.execute(&plan, &counted(QueryOptions::default().with_rules(["+all"])))?;
        let plain = engine.execute(&plan, &counted(without_inlining()))?;
        let expected: Vec<Value> = rows.into_iter().map(Value::Int).collect();
        assert_eq!(inlined.rows, expected);
        assert_eq!(inlined.rows, plain.rows);
        assert_eq!(inlined.stats.full_count, total);
        assert_eq!(plain.stats.full_count, total);
    }
    Ok(())
}
