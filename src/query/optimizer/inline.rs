//! Subquery inlining.
//!
//! `LET x = (body) ... FOR k IN x` becomes `... body'` where `body'` is the
//! body chain without its `Singleton` and `Return`, spliced at the position of
//! the loop. The loop variable and the body's returned variable are unified:
//! when the body produces the returned variable itself, that producer now
//! binds `k`; otherwise (the body returns an outer variable) every read of `k`
//! is redirected to it. The rewrite repeats until no candidate remains.

use tracing::debug;

use crate::error::{Result, SpindleError};
use crate::query::optimizer::safety::{find_candidate, Candidate};
use crate::query::plan::{Plan, PlanOp};
use crate::types::NodeId;

/// Inlines subqueries until none qualifies; returns the number of splices.
pub fn inline_subqueries(plan: &mut Plan) -> Result<usize> {
    let mut splices = 0;
    while let Some(candidate) = find_candidate(plan) {
        splice(plan, candidate)?;
        splices += 1;
        if splices > plan.len() + 1 {
            return Err(SpindleError::internal(
                "inline-subqueries did not reach a fixpoint",
            ));
        }
    }
    Ok(splices)
}

fn splice(plan: &mut Plan, candidate: Candidate) -> Result<()> {
    let Candidate {
        subquery,
        consumer,
    } = candidate;
    let (body, result) = match &plan.expect_node(subquery)?.op {
        PlanOp::Subquery { body, out } => (*body, *out),
        _ => return Err(SpindleError::internal(format!("node {subquery} is not a subquery"))),
    };
    let loop_var = match &plan.expect_node(consumer)?.op {
        PlanOp::EnumerateList { input, out } if *input == result => *out,
        _ => {
            return Err(SpindleError::internal(format!(
                "node {consumer} does not iterate the subquery result"
            )))
        }
    };
    let inner = plan.chain(body)?;
    let (body_singleton, body_return) = match (inner.first(), inner.last()) {
        (Some(first), Some(last)) if inner.len() >= 2 => (*first, *last),
        _ => return Err(SpindleError::internal("subquery body is too short")),
    };
    let returned = match &plan.expect_node(body_return)?.op {
        PlanOp::Return { input } => *input,
        _ => return Err(SpindleError::internal("subquery body does not end in RETURN")),
    };
    let spliced: Vec<NodeId> = inner[1..inner.len() - 1].to_vec();

    let outer = plan
        .scopes()?
        .into_iter()
        .find(|scope| scope.position(subquery).is_some())
        .ok_or_else(|| SpindleError::internal(format!("subquery {subquery} has no scope")))?;
    let mut chain = Vec::with_capacity(outer.nodes.len() + spliced.len());
    for id in &outer.nodes {
        if *id == subquery {
            continue;
        }
        if *id == consumer {
            chain.extend_from_slice(&spliced);
            continue;
        }
        chain.push(*id);
    }
    let mut predecessor = None;
    for id in &chain {
        plan.set_predecessor(*id, predecessor)?;
        predecessor = Some(*id);
    }

    for id in [subquery, consumer, body_singleton, body_return] {
        plan.remove_node(id)?;
    }

    let produced_inside = spliced.iter().any(|id| {
        plan.node(*id)
            .is_some_and(|node| node.op.vars_set().contains(&returned))
    });
    if produced_inside {
        plan.replace_var(returned, loop_var);
    } else {
        plan.replace_var(loop_var, returned);
    }
    plan.refresh_producers();

    debug!(
        subquery = %subquery,
        consumer = %consumer,
        spliced = spliced.len(),
        produced_inside,
        "optimizer.inline_subqueries.splice"
    );

    plan.validate().map_err(|err| {
        SpindleError::internal(format!(
            "inlining subquery {subquery} into {consumer} broke the plan: {err}"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::builder::PlanBuilder;
    use crate::query::expr::Expr;
    use crate::query::plan::NodeKind;

    fn main_kinds(plan: &Plan) -> Result<Vec<NodeKind>> {
        plan.chain(plan.root())?
            .into_iter()
            .map(|id| Ok(plan.expect_node(id)?.op.kind()))
            .collect()
    }

    #[test]
    fn collection_subquery_collapses_to_three_nodes() -> Result<()> {
        let mut b = PlanBuilder::new();
        let x = b.subquery("x", |s| {
            let doc = s.for_collection("doc", "c")?;
            s.return_(Expr::var(doc))
        })?;
        let doc2 = b.for_in("doc2", Expr::var(x))?;
        b.return_(Expr::var(doc2))?;
        let mut plan = b.build()?;

        assert_eq!(inline_subqueries(&mut plan)?, 1);
        assert_eq!(
            main_kinds(&plan)?,
            vec![
                NodeKind::Singleton,
                NodeKind::EnumerateCollection,
                NodeKind::Return
            ]
        );
        let PlanOp::Return { input } = plan.expect_node(plan.root())?.op else {
            panic!("root is not a return");
        };
        assert_eq!(plan.vars().name(input), "doc2");
        Ok(())
    }

    #[test]
    fn outer_variable_return_redirects_loop_reads() -> Result<()> {
        let mut b = PlanBuilder::new();
        let i = b.for_in("i", Expr::range(1, 2))?;
        let x = b.subquery("x", |s| {
            s.for_in("j", Expr::range(1, 3))?;
            s.return_(Expr::var(i))
        })?;
        let k = b.for_in("k", Expr::var(x))?;
        b.return_(Expr::var(k))?;
        let mut plan = b.build()?;

        inline_subqueries(&mut plan)?;
        let PlanOp::Return { input } = plan.expect_node(plan.root())?.op else {
            panic!("root is not a return");
        };
        assert_eq!(input, i);
        assert_eq!(plan.scopes()?.len(), 1);
        Ok(())
    }

    #[test]
    fn nested_chain_collapses_in_one_pass() -> Result<()> {
        let mut b = PlanBuilder::new();
        let outer = b.subquery("a", |s| {
            let inner = s.subquery("b", |t| {
                let c = t.for_in("c", Expr::array([1i64, 2]))?;
                t.return_(Expr::var(c))
            })?;
            let bv = s.for_in("bv", Expr::var(inner))?;
            s.return_(Expr::var(bv))
        })?;
        let av = b.for_in("av", Expr::var(outer))?;
        b.return_(Expr::var(av))?;
        let mut plan = b.build()?;

        assert_eq!(inline_subqueries(&mut plan)?, 2);
        assert_eq!(inline_subqueries(&mut plan)?, 0);
        assert!(!main_kinds(&plan)?.contains(&NodeKind::Subquery));
        Ok(())
    }

    #[test]
    fn second_run_is_a_no_op() -> Result<()> {
        let mut b = PlanBuilder::new();
        let x = b.subquery("x", |s| {
            let j = s.for_in("j", Expr::array([1i64, 2, 3]))?;
            s.return_(Expr::var(j))
        })?;
        let i = b.for_in("i", Expr::var(x))?;
        b.return_(Expr::var(i))?;
        let mut plan = b.build()?;

        inline_subqueries(&mut plan)?;
        let once = plan.clone();
        assert_eq!(inline_subqueries(&mut plan)?, 0);
        assert_eq!(plan, once);
        Ok(())
    }
}
