//! Inspectable rendering of a plan.
//!
//! Explain output lists the nodes of the main scope from `SingletonNode` to
//! `ReturnNode`; each `SubqueryNode` embeds the node list of its body. The
//! plan hash is an xxh64 fingerprint over node types and attributes (node ids
//! are excluded), so two plans with the same shape hash equally.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};
use xxhash_rust::xxh64::Xxh64;

use crate::error::Result;
use crate::query::expr::{BinaryOp, Expr, Function, UnaryOp};
use crate::query::plan::{Plan, PlanOp, VariableTable};
use crate::types::{NodeId, VarId};

/// One node of the explain output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExplainNode {
    /// Plan node id.
    pub id: u32,
    /// Node type name, e.g. `EnumerateListNode`.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Upstream node id.
    pub predecessor: Option<u32>,
    /// Type-specific attributes.
    pub attributes: Map<String, Json>,
}

/// Explain document for a plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplainOutput {
    /// Main-scope nodes in execution order.
    pub nodes: Vec<ExplainNode>,
    /// Optimizer rules that changed the plan, in application order.
    pub rules: Vec<String>,
    /// Hex xxh64 fingerprint of the plan shape.
    pub plan_hash: String,
}

impl ExplainOutput {
    /// Type names of the main-scope nodes.
    pub fn node_types(&self) -> Vec<&str> {
        self.nodes.iter().map(|node| node.node_type.as_str()).collect()
    }

    /// Finds the first main-scope node of the given type.
    pub fn find(&self, node_type: &str) -> Option<&ExplainNode> {
        self.nodes.iter().find(|node| node.node_type == node_type)
    }
}

/// Renders `plan` together with the rules that produced it.
pub fn explain(plan: &Plan, rules: &[&str]) -> Result<ExplainOutput> {
    let nodes = explain_scope(plan, plan.root())?;
    let hash = plan_hash(&nodes);
    Ok(ExplainOutput {
        nodes,
        rules: rules.iter().map(|rule| (*rule).to_owned()).collect(),
        plan_hash: format!("{hash:016x}"),
    })
}

/// Fingerprint of `plan`'s shape.
pub fn plan_fingerprint(plan: &Plan) -> Result<u64> {
    Ok(plan_hash(&explain_scope(plan, plan.root())?))
}

fn plan_hash(nodes: &[ExplainNode]) -> u64 {
    let mut hasher = Xxh64::new(0);
    hash_nodes(nodes, &mut hasher);
    hasher.digest()
}

fn hash_nodes(nodes: &[ExplainNode], hasher: &mut Xxh64) {
    hasher.update(&(nodes.len() as u64).to_le_bytes());
    for node in nodes {
        hasher.update(node.node_type.as_bytes());
        for (key, value) in &node.attributes {
            hasher.update(key.as_bytes());
            if key == "subquery" {
                // Nested nodes carry ids too; hash them structurally.
                let nested: Vec<ExplainNode> = value
                    .get("nodes")
                    .cloned()
                    .and_then(|nodes| serde_json::from_value(nodes).ok())
                    .unwrap_or_default();
                hash_nodes(&nested, hasher);
            } else {
                hasher.update(value.to_string().as_bytes());
            }
        }
    }
}

fn explain_scope(plan: &Plan, terminal: NodeId) -> Result<Vec<ExplainNode>> {
    let vars = plan.vars();
    let mut nodes = Vec::new();
    for id in plan.chain(terminal)? {
        let node = plan.expect_node(id)?;
        let mut attributes = Map::new();
        match &node.op {
            PlanOp::Singleton => {}
            PlanOp::EnumerateCollection { collection, out } => {
                attributes.insert("collection".into(), json!(collection));
                attributes.insert("outVariable".into(), var_json(vars, *out));
            }
            PlanOp::EnumerateIndex {
                collection,
                disjuncts,
                out,
            } => {
                attributes.insert("collection".into(), json!(collection));
                let indexes: Vec<Json> = disjuncts
                    .iter()
                    .map(|d| json!({ "name": d.index, "fields": [d.field] }))
                    .collect();
                attributes.insert("indexes".into(), Json::Array(indexes));
                let condition = disjuncts
                    .iter()
                    .map(|d| {
                        format!(
                            "{}.{} == {}",
                            vars.name(*out),
                            d.field,
                            render_expr(&d.lookup, vars)
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(" || ");
                attributes.insert("condition".into(), json!(condition));
                attributes.insert("outVariable".into(), var_json(vars, *out));
            }
            PlanOp::EnumerateView {
                view,
                condition,
                out,
            } => {
                attributes.insert("view".into(), json!(view));
                if let Some(condition) = condition {
                    attributes.insert("condition".into(), json!(render_expr(condition, vars)));
                }
                attributes.insert("outVariable".into(), var_json(vars, *out));
            }
            PlanOp::EnumerateList { input, out } => {
                attributes.insert("inVariable".into(), var_json(vars, *input));
                attributes.insert("outVariable".into(), var_json(vars, *out));
            }
            PlanOp::Filter { input } | PlanOp::Return { input } => {
                attributes.insert("inVariable".into(), var_json(vars, *input));
            }
            PlanOp::Calculation { expr, out } => {
                attributes.insert("expression".into(), json!(render_expr(expr, vars)));
                attributes.insert("outVariable".into(), var_json(vars, *out));
            }
            PlanOp::Limit { offset, limit } => {
                attributes.insert("offset".into(), json!(offset));
                attributes.insert("limit".into(), json!(limit));
            }
            PlanOp::Sort { keys } => {
                let elements: Vec<Json> = keys
                    .iter()
                    .map(|key| json!({ "inVariable": var_json(vars, key.var), "ascending": key.ascending }))
                    .collect();
                attributes.insert("elements".into(), Json::Array(elements));
            }
            PlanOp::Collect {
                groups,
                into,
                count,
                method,
            } => {
                let groups: Vec<Json> = groups
                    .iter()
                    .map(|g| json!({ "outVariable": var_json(vars, g.out), "inVariable": var_json(vars, g.input) }))
                    .collect();
                attributes.insert("groups".into(), Json::Array(groups));
                if let Some(into) = into {
                    let keep: Vec<Json> = into.keep.iter().map(|v| var_json(vars, *v)).collect();
                    attributes.insert(
                        "into".into(),
                        json!({ "outVariable": var_json(vars, into.out), "keepVariables": keep }),
                    );
                }
                if let Some(count) = count {
                    attributes.insert("count".into(), var_json(vars, *count));
                }
                attributes.insert("method".into(), json!(method.as_str()));
            }
            PlanOp::Subquery { body, out } => {
                let nested = explain_scope(plan, *body)?;
                attributes.insert("subquery".into(), json!({ "nodes": nested }));
                attributes.insert("outVariable".into(), var_json(vars, *out));
            }
        }
        nodes.push(ExplainNode {
            id: id.0,
            node_type: node.op.kind().type_name().to_owned(),
            predecessor: node.predecessor.map(|p| p.0),
            attributes,
        });
    }
    Ok(nodes)
}

fn var_json(vars: &VariableTable, var: VarId) -> Json {
    json!({ "id": var.0, "name": vars.name(var) })
}

/// Renders an expression in query syntax using variable names.
pub fn render_expr(expr: &Expr, vars: &VariableTable) -> String {
    match expr {
        Expr::Literal(value) => value.to_string(),
        Expr::Var(var) => vars.name(*var).to_owned(),
        Expr::BindParam(name) => format!("@{name}"),
        Expr::Attribute(base, name) => format!("{}.{name}", render_expr(base, vars)),
        Expr::Array(items) => {
            let items: Vec<String> = items.iter().map(|item| render_expr(item, vars)).collect();
            format!("[ {} ]", items.join(", "))
        }
        Expr::Range(low, high) => {
            format!("{} .. {}", render_expr(low, vars), render_expr(high, vars))
        }
        Expr::Unary(UnaryOp::Not, inner) => format!("!({})", render_expr(inner, vars)),
        Expr::Unary(UnaryOp::Neg, inner) => format!("-({})", render_expr(inner, vars)),
        Expr::Binary(op, left, right) => {
            let (left, right) = (render_expr(left, vars), render_expr(right, vars));
            match op {
                BinaryOp::And | BinaryOp::Or => format!("({left} {} {right})", op.symbol()),
                _ => format!("{left} {} {right}", op.symbol()),
            }
        }
        Expr::Call(Function::Length, args) => {
            let args: Vec<String> = args.iter().map(|arg| render_expr(arg, vars)).collect();
            format!("LENGTH({})", args.join(", "))
        }
    }
}
