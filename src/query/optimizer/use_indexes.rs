//! Index selection for equality filters.
//!
//! Rewrites
//!
//! ```text
//! FOR d IN coll  LET t = d.a == e1 || d.b == e2  FILTER t
//! ```
//!
//! into a single index node with one disjunct per OR-branch, provided each
//! attribute is covered by a single-field index and `t` has no other reader.

use tracing::debug;

use crate::error::{Result, SpindleError};
use crate::query::expr::{BinaryOp, Expr};
use crate::query::plan::{IndexDisjunct, Plan, PlanOp};
use crate::storage::{IndexDef, IndexKind, StorageEngine};
use crate::types::{NodeId, VarId};

struct Rewrite {
    scan: NodeId,
    calculation: NodeId,
    filter: NodeId,
    disjuncts: Vec<IndexDisjunct>,
}

/// Applies the rule everywhere it matches; returns the number of rewrites.
pub fn use_indexes(plan: &mut Plan, storage: &dyn StorageEngine) -> Result<usize> {
    let mut rewrites = 0;
    loop {
        let Some(rewrite) = find_rewrite(plan, storage)? else {
            return Ok(rewrites);
        };
        apply(plan, rewrite)?;
        rewrites += 1;
    }
}

fn find_rewrite(plan: &Plan, storage: &dyn StorageEngine) -> Result<Option<Rewrite>> {
    for scope in plan.scopes()? {
        for window in scope.nodes.windows(3) {
            if let Some(rewrite) = match_window(plan, window, storage)? {
                return Ok(Some(rewrite));
            }
        }
    }
    Ok(None)
}

fn match_window(
    plan: &Plan,
    window: &[NodeId],
    storage: &dyn StorageEngine,
) -> Result<Option<Rewrite>> {
    let [scan, calculation, filter] = window else {
        return Ok(None);
    };
    let PlanOp::EnumerateCollection { collection, out } = &plan.expect_node(*scan)?.op else {
        return Ok(None);
    };
    let PlanOp::Calculation { expr, out: temp } = &plan.expect_node(*calculation)?.op else {
        return Ok(None);
    };
    match &plan.expect_node(*filter)?.op {
        PlanOp::Filter { input } if input == temp => {}
        _ => return Ok(None),
    }
    if plan.use_sites(*temp) != [*filter] || collection.starts_with('@') {
        return Ok(None);
    }

    let mut terms = Vec::new();
    flatten_or(expr, &mut terms);
    let indexes = match storage.indexes(collection) {
        Ok(indexes) => indexes,
        Err(SpindleError::NotFound(_)) => return Ok(None),
        Err(err) => return Err(err),
    };
    let mut disjuncts = Vec::with_capacity(terms.len());
    for term in terms {
        let Some((field, lookup)) = equality_on(term, *out) else {
            return Ok(None);
        };
        let Some(index) = hash_index_for(&indexes, &field) else {
            return Ok(None);
        };
        disjuncts.push(IndexDisjunct {
            index: index.name.clone(),
            field,
            lookup,
        });
    }
    Ok(Some(Rewrite {
        scan: *scan,
        calculation: *calculation,
        filter: *filter,
        disjuncts,
    }))
}

fn flatten_or<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
    match expr {
        Expr::Binary(BinaryOp::Or, left, right) => {
            flatten_or(left, out);
            flatten_or(right, out);
        }
        other => out.push(other),
    }
}

/// Matches `doc.field == e` or `e == doc.field` where `e` does not read `doc`.
fn equality_on(term: &Expr, doc: VarId) -> Option<(String, Expr)> {
    let Expr::Binary(BinaryOp::Eq, left, right) = term else {
        return None;
    };
    let attribute = |side: &Expr| match side {
        Expr::Attribute(base, field) if base.as_var() == Some(doc) => Some(field.clone()),
        _ => None,
    };
    let (field, lookup) = match (attribute(left), attribute(right)) {
        (Some(field), _) if !right.references(doc) => (field, (**right).clone()),
        (_, Some(field)) if !left.references(doc) => (field, (**left).clone()),
        _ => return None,
    };
    Some((field, lookup))
}

fn hash_index_for<'a>(indexes: &'a [IndexDef], field: &str) -> Option<&'a IndexDef> {
    indexes
        .iter()
        .find(|index| index.kind == IndexKind::Hash && index.covers(field))
}

fn apply(plan: &mut Plan, rewrite: Rewrite) -> Result<()> {
    let Rewrite {
        scan,
        calculation,
        filter,
        disjuncts,
    } = rewrite;
    let successor = plan
        .scopes()?
        .into_iter()
        .find_map(|scope| scope.successor(filter))
        .ok_or_else(|| SpindleError::internal(format!("filter {filter} has no successor")))?;

    let node = plan
        .node_mut(scan)
        .ok_or_else(|| SpindleError::internal(format!("scan node {scan} vanished")))?;
    let (collection, out) = match &node.op {
        PlanOp::EnumerateCollection { collection, out } => (collection.clone(), *out),
        _ => {
            return Err(SpindleError::internal(format!(
                "node {scan} is not a collection scan"
            )))
        }
    };
    let indexes: Vec<&str> = disjuncts.iter().map(|d| d.index.as_str()).collect();
    debug!(
        node = %scan,
        collection = collection.as_str(),
        indexes = ?indexes,
        "optimizer.use_indexes.rewrite"
    );
    node.op = PlanOp::EnumerateIndex {
        collection,
        disjuncts,
        out,
    };

    plan.set_predecessor(successor, Some(scan))?;
    plan.remove_node(calculation)?;
    plan.remove_node(filter)?;
    plan.refresh_producers();
    plan.validate().map_err(|err| {
        SpindleError::internal(format!("use-indexes broke the plan at node {scan}: {err}"))
    })
}
