//! Eligibility check for subquery inlining.
//!
//! A subquery `LET x = (body)` may be spliced into its consumer only when
//! `FOR k IN x` is the one and only reader of `x` anywhere in the plan, and
//! that loop lives downstream in the same scope. Every other reference, no
//! matter how deeply nested, keeps the materialized array alive.
//!
//! The analysis never fails: any structural surprise answers `false`.

use crate::query::plan::{NodeKind, Plan, PlanOp, Scope};
use crate::types::NodeId;

/// A subquery together with the loop that consumes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candidate {
    /// The `Subquery` node.
    pub subquery: NodeId,
    /// The `EnumerateList` node iterating the subquery result.
    pub consumer: NodeId,
}

/// Whether `subquery` can be inlined into its consuming loop.
pub fn is_inlinable(plan: &Plan, subquery: NodeId) -> bool {
    check(plan, subquery).is_some()
}

/// First inlinable subquery, main scope first, then nested scopes.
pub fn find_candidate(plan: &Plan) -> Option<Candidate> {
    let scopes = plan.scopes().ok()?;
    scopes.iter().find_map(|scope| {
        scope
            .nodes
            .iter()
            .filter(|id| matches!(kind_of(plan, **id), Some(NodeKind::Subquery)))
            .find_map(|id| check_in_scope(plan, scope, *id))
    })
}

fn kind_of(plan: &Plan, id: NodeId) -> Option<NodeKind> {
    plan.node(id).map(|node| node.op.kind())
}

fn check(plan: &Plan, subquery: NodeId) -> Option<Candidate> {
    let scopes = plan.scopes().ok()?;
    let scope = scopes
        .iter()
        .find(|scope| scope.position(subquery).is_some())?;
    check_in_scope(plan, scope, subquery)
}

fn check_in_scope(plan: &Plan, scope: &Scope, subquery: NodeId) -> Option<Candidate> {
    let PlanOp::Subquery { body, out } = &plan.node(subquery)?.op else {
        return None;
    };

    let uses = plan.use_sites(*out);
    let [consumer] = uses.as_slice() else {
        return None;
    };
    match &plan.node(*consumer)?.op {
        PlanOp::EnumerateList { input, .. } if input == out => {}
        _ => return None,
    }
    let sub_pos = scope.position(subquery)?;
    let consumer_pos = scope.position(*consumer)?;
    if consumer_pos <= sub_pos {
        return None;
    }

    let inner = plan.chain(*body).ok()?;
    let (first, last) = (inner.first()?, inner.last()?);
    if kind_of(plan, *first)? != NodeKind::Singleton || kind_of(plan, *last)? != NodeKind::Return {
        return None;
    }

    // Windowing operators would apply across all iterations of an outer loop
    // once spliced below it.
    let windowing = inner
        .iter()
        .filter_map(|id| kind_of(plan, *id))
        .any(NodeKind::is_windowing);
    if windowing {
        let outer_loop = scope.nodes[..consumer_pos]
            .iter()
            .filter_map(|id| kind_of(plan, *id))
            .any(NodeKind::is_enumeration);
        if outer_loop {
            return None;
        }
    }

    Some(Candidate {
        subquery,
        consumer: *consumer,
    })
}
