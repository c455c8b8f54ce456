//! Plan node model.
//!
//! A plan is an arena of nodes addressed by [`NodeId`]. Every node stores the
//! id of its single predecessor, so a scope is a singly linked chain running
//! from a `Singleton` up to a `Return`. Subquery nodes own a nested scope by
//! recording the id of that scope's terminal `Return`. Variables live in a
//! separate table and are referenced by [`VarId`]; rewrites rebind integers and
//! re-point predecessor ids, never structures.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpindleError};
use crate::query::expr::Expr;
use crate::query::value::Value;
use crate::types::{NodeId, VarId};

/// Operator kind of a plan node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Produces exactly one (possibly inherited) row.
    Singleton,
    /// Full collection scan.
    EnumerateCollection,
    /// Index scan over one or more disjuncts.
    EnumerateIndex,
    /// Scan over the collections linked to a view.
    EnumerateView,
    /// Iteration over an array value.
    EnumerateList,
    /// Drops rows whose input variable is falsy.
    Filter,
    /// Binds the result of an expression.
    Calculation,
    /// Offset/limit window.
    Limit,
    /// Stable multi-key sort.
    Sort,
    /// Grouping and distinct.
    Collect,
    /// Nested scope evaluated per input row.
    Subquery,
    /// Terminal node of a scope.
    Return,
}

impl NodeKind {
    /// Name used in explain output.
    pub fn type_name(self) -> &'static str {
        match self {
            NodeKind::Singleton => "SingletonNode",
            NodeKind::EnumerateCollection => "EnumerateCollectionNode",
            NodeKind::EnumerateIndex => "IndexNode",
            NodeKind::EnumerateView => "EnumerateViewNode",
            NodeKind::EnumerateList => "EnumerateListNode",
            NodeKind::Filter => "FilterNode",
            NodeKind::Calculation => "CalculationNode",
            NodeKind::Limit => "LimitNode",
            NodeKind::Sort => "SortNode",
            NodeKind::Collect => "CollectNode",
            NodeKind::Subquery => "SubqueryNode",
            NodeKind::Return => "ReturnNode",
        }
    }

    /// Whether the node may emit more than one row per input row.
    pub fn is_enumeration(self) -> bool {
        matches!(
            self,
            NodeKind::EnumerateCollection
                | NodeKind::EnumerateIndex
                | NodeKind::EnumerateView
                | NodeKind::EnumerateList
        )
    }

    /// Whether the node windows, reorders or aggregates the rows of its scope.
    pub fn is_windowing(self) -> bool {
        matches!(self, NodeKind::Limit | NodeKind::Sort | NodeKind::Collect)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// One OR-branch of an index scan: `out.field == lookup`, served by `index`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexDisjunct {
    /// Index name as known to the storage collaborator.
    pub index: String,
    /// Indexed attribute.
    pub field: String,
    /// Lookup value; may reference variables of enclosing loops.
    pub lookup: Expr,
}

/// Sort criterion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    /// Variable whose value is compared.
    pub var: VarId,
    /// Ascending when true.
    pub ascending: bool,
}

/// Grouping strategy of a collect node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectMethod {
    /// Groups emitted in key order.
    Sorted,
    /// Hash grouping; groups are still emitted in key order.
    Hash,
    /// Duplicate elimination preserving first-seen order.
    Distinct,
}

impl CollectMethod {
    /// Name used in explain output.
    pub fn as_str(self) -> &'static str {
        match self {
            CollectMethod::Sorted => "sorted",
            CollectMethod::Hash => "hash",
            CollectMethod::Distinct => "distinct",
        }
    }
}

/// `out = input` grouping criterion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectGroup {
    /// Variable bound to the group key after the collect.
    pub out: VarId,
    /// Variable the key is read from.
    pub input: VarId,
}

/// `INTO out` clause. `keep` lists the variables captured per grouped row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectInto {
    /// Variable bound to the array of captured rows.
    pub out: VarId,
    /// Captured variables, in output attribute order.
    pub keep: Vec<VarId>,
}

/// Operator payload of a plan node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanOp {
    /// Scope entry.
    Singleton,
    /// `FOR out IN collection`
    EnumerateCollection {
        /// Collection name, or `@param` before bind parameters are applied.
        collection: String,
        /// Document variable.
        out: VarId,
    },
    /// `FOR out IN collection FILTER out.f1 == v1 || out.f2 == v2 ...` served by indexes.
    EnumerateIndex {
        /// Collection name.
        collection: String,
        /// Disjuncts in their original expression order.
        disjuncts: Vec<IndexDisjunct>,
        /// Document variable.
        out: VarId,
    },
    /// `FOR out IN view SEARCH condition`
    EnumerateView {
        /// View name.
        view: String,
        /// Optional search condition; may reference `out` and outer variables.
        condition: Option<Expr>,
        /// Document variable.
        out: VarId,
    },
    /// `FOR out IN input`
    EnumerateList {
        /// Variable holding the array.
        input: VarId,
        /// Element variable.
        out: VarId,
    },
    /// `FILTER input`
    Filter {
        /// Variable holding the condition result.
        input: VarId,
    },
    /// `LET out = expr`
    Calculation {
        /// Expression to evaluate.
        expr: Expr,
        /// Result variable.
        out: VarId,
    },
    /// `LIMIT offset, limit`
    Limit {
        /// Rows to skip.
        offset: u64,
        /// Rows to return after the offset.
        limit: u64,
    },
    /// `SORT keys`
    Sort {
        /// Criteria in priority order.
        keys: Vec<SortKey>,
    },
    /// `COLLECT groups INTO into WITH COUNT INTO count`
    Collect {
        /// Group criteria.
        groups: Vec<CollectGroup>,
        /// Optional capture of grouped rows.
        into: Option<CollectInto>,
        /// Optional group size variable.
        count: Option<VarId>,
        /// Grouping strategy.
        method: CollectMethod,
    },
    /// `LET out = ( body )`
    Subquery {
        /// Terminal `Return` of the nested scope.
        body: NodeId,
        /// Variable bound to the array of body results.
        out: VarId,
    },
    /// `RETURN input`
    Return {
        /// Returned variable.
        input: VarId,
    },
}

impl PlanOp {
    /// Kind of the operator.
    pub fn kind(&self) -> NodeKind {
        match self {
            PlanOp::Singleton => NodeKind::Singleton,
            PlanOp::EnumerateCollection { .. } => NodeKind::EnumerateCollection,
            PlanOp::EnumerateIndex { .. } => NodeKind::EnumerateIndex,
            PlanOp::EnumerateView { .. } => NodeKind::EnumerateView,
            PlanOp::EnumerateList { .. } => NodeKind::EnumerateList,
            PlanOp::Filter { .. } => NodeKind::Filter,
            PlanOp::Calculation { .. } => NodeKind::Calculation,
            PlanOp::Limit { .. } => NodeKind::Limit,
            PlanOp::Sort { .. } => NodeKind::Sort,
            PlanOp::Collect { .. } => NodeKind::Collect,
            PlanOp::Subquery { .. } => NodeKind::Subquery,
            PlanOp::Return { .. } => NodeKind::Return,
        }
    }

    /// Variables read by this node (not counting nested scopes).
    pub fn vars_used(&self) -> Vec<VarId> {
        let mut used = Vec::new();
        match self {
            PlanOp::Singleton
            | PlanOp::EnumerateCollection { .. }
            | PlanOp::Limit { .. }
            | PlanOp::Subquery { .. } => {}
            PlanOp::EnumerateIndex { disjuncts, .. } => {
                for disjunct in disjuncts {
                    disjunct.lookup.collect_vars(&mut used);
                }
            }
            PlanOp::EnumerateView { condition, out, .. } => {
                if let Some(condition) = condition {
                    condition.collect_vars(&mut used);
                }
                // The view variable is bound by the node itself.
                used.retain(|var| var != out);
            }
            PlanOp::EnumerateList { input, .. }
            | PlanOp::Filter { input }
            | PlanOp::Return { input } => used.push(*input),
            PlanOp::Calculation { expr, .. } => expr.collect_vars(&mut used),
            PlanOp::Sort { keys } => used.extend(keys.iter().map(|key| key.var)),
            PlanOp::Collect { groups, into, .. } => {
                used.extend(groups.iter().map(|group| group.input));
                if let Some(into) = into {
                    used.extend(into.keep.iter().copied());
                }
            }
        }
        used
    }

    /// Variables produced by this node.
    pub fn vars_set(&self) -> Vec<VarId> {
        match self {
            PlanOp::Singleton
            | PlanOp::Filter { .. }
            | PlanOp::Limit { .. }
            | PlanOp::Sort { .. }
            | PlanOp::Return { .. } => Vec::new(),
            PlanOp::EnumerateCollection { out, .. }
            | PlanOp::EnumerateIndex { out, .. }
            | PlanOp::EnumerateView { out, .. }
            | PlanOp::EnumerateList { out, .. }
            | PlanOp::Calculation { out, .. }
            | PlanOp::Subquery { out, .. } => vec![*out],
            PlanOp::Collect {
                groups,
                into,
                count,
                ..
            } => {
                let mut set: Vec<VarId> = groups.iter().map(|group| group.out).collect();
                if let Some(into) = into {
                    set.push(into.out);
                }
                set.extend(count.iter().copied());
                set
            }
        }
    }

    /// Rebinds every read or write of `from` to `to`.
    pub fn replace_var(&mut self, from: VarId, to: VarId) {
        let swap = |var: &mut VarId| {
            if *var == from {
                *var = to;
            }
        };
        match self {
            PlanOp::Singleton | PlanOp::Limit { .. } => {}
            PlanOp::EnumerateCollection { out, .. } => swap(out),
            PlanOp::EnumerateIndex { disjuncts, out, .. } => {
                for disjunct in disjuncts {
                    disjunct.lookup.replace_var(from, to);
                }
                swap(out);
            }
            PlanOp::EnumerateView { condition, out, .. } => {
                if let Some(condition) = condition {
                    condition.replace_var(from, to);
                }
                swap(out);
            }
            PlanOp::EnumerateList { input, out } => {
                swap(input);
                swap(out);
            }
            PlanOp::Filter { input } | PlanOp::Return { input } => swap(input),
            PlanOp::Calculation { expr, out } => {
                expr.replace_var(from, to);
                swap(out);
            }
            PlanOp::Sort { keys } => {
                for key in keys {
                    swap(&mut key.var);
                }
            }
            PlanOp::Collect {
                groups,
                into,
                count,
                ..
            } => {
                for group in groups {
                    swap(&mut group.out);
                    swap(&mut group.input);
                }
                if let Some(into) = into {
                    swap(&mut into.out);
                    for var in &mut into.keep {
                        swap(var);
                    }
                }
                if let Some(count) = count {
                    swap(count);
                }
            }
            PlanOp::Subquery { out, .. } => swap(out),
        }
    }

    fn bind_parameters(&mut self, params: &BTreeMap<String, Value>) -> Result<()> {
        match self {
            PlanOp::EnumerateCollection { collection, .. }
            | PlanOp::EnumerateIndex { collection, .. } => {
                bind_collection(collection, params)?;
                if let PlanOp::EnumerateIndex { disjuncts, .. } = self {
                    for disjunct in disjuncts {
                        disjunct.lookup.bind_parameters(params)?;
                    }
                }
                Ok(())
            }
            PlanOp::EnumerateView { view, condition, .. } => {
                bind_collection(view, params)?;
                match condition {
                    Some(condition) => condition.bind_parameters(params),
                    None => Ok(()),
                }
            }
            PlanOp::Calculation { expr, .. } => expr.bind_parameters(params),
            _ => Ok(()),
        }
    }
}

fn bind_collection(name: &mut String, params: &BTreeMap<String, Value>) -> Result<()> {
    if !name.starts_with('@') {
        return Ok(());
    }
    let value = params
        .get(name.as_str())
        .ok_or_else(|| SpindleError::BindParameterMissing(name.clone()))?;
    let Some(resolved) = value.as_str() else {
        return Err(SpindleError::InvalidOwned(format!(
            "bind parameter '{name}' must be a collection name string, got {}",
            value.type_name()
        )));
    };
    *name = resolved.to_owned();
    Ok(())
}

/// Node within the plan arena.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    /// Arena id.
    pub id: NodeId,
    /// Operator payload.
    pub op: PlanOp,
    /// Upstream node within the same scope; `None` only for a `Singleton`.
    pub predecessor: Option<NodeId>,
}

/// Variable metadata. `producer` is a lookup aid, never ownership.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    /// Table id.
    pub id: VarId,
    /// Display name; temporaries are named `#<n>`.
    pub name: String,
    /// False for planner-generated temporaries.
    pub user_defined: bool,
    /// Node that currently binds the variable, if any.
    pub producer: Option<NodeId>,
}

/// Table of all variables of a plan, indexed by [`VarId`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableTable {
    vars: Vec<Variable>,
    next_temporary: u32,
}

impl VariableTable {
    /// Creates a named variable.
    pub fn create(&mut self, name: impl Into<String>, user_defined: bool) -> VarId {
        let id = VarId(self.vars.len() as u32);
        self.vars.push(Variable {
            id,
            name: name.into(),
            user_defined,
            producer: None,
        });
        id
    }

    /// Creates a planner temporary.
    pub fn create_temporary(&mut self) -> VarId {
        self.next_temporary += 1;
        let name = format!("#{}", self.next_temporary);
        self.create(name, false)
    }

    /// Looks up a variable.
    pub fn get(&self, id: VarId) -> Option<&Variable> {
        self.vars.get(id.0 as usize)
    }

    /// Display name of a variable, `?` when unknown.
    pub fn name(&self, id: VarId) -> &str {
        self.get(id).map(|var| var.name.as_str()).unwrap_or("?")
    }

    /// Finds the first variable with the given name.
    pub fn by_name(&self, name: &str) -> Option<VarId> {
        self.vars.iter().find(|var| var.name == name).map(|var| var.id)
    }

    /// Number of variables ever created.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether no variable was ever created.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    fn set_producer(&mut self, id: VarId, producer: Option<NodeId>) {
        if let Some(var) = self.vars.get_mut(id.0 as usize) {
            var.producer = producer;
        }
    }
}

/// A linear scope: the main query or the body of one subquery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scope {
    /// Terminal `Return` node.
    pub terminal: NodeId,
    /// Nodes from `Singleton` to `Return`.
    pub nodes: Vec<NodeId>,
    /// Subquery node owning this scope; `None` for the main scope.
    pub owner: Option<NodeId>,
    /// Nesting depth; 0 for the main scope.
    pub depth: usize,
}

impl Scope {
    /// Position of `id` within the chain.
    pub fn position(&self, id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|node| *node == id)
    }

    /// Node directly downstream of `id`.
    pub fn successor(&self, id: NodeId) -> Option<NodeId> {
        let pos = self.position(id)?;
        self.nodes.get(pos + 1).copied()
    }
}

/// Which rows feed `fullCount`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountingLimit {
    /// Not pinned yet; derived from the current main chain on demand.
    #[default]
    Undecided,
    /// Rows reaching this top-level `Limit`, before its offset and count apply.
    Node(NodeId),
    /// The main chain had no `Limit`; every returned row counts.
    Returned,
}

impl CountingLimit {
    fn is_undecided(&self) -> bool {
        matches!(self, CountingLimit::Undecided)
    }
}

/// Arena-backed query plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    nodes: Vec<Option<PlanNode>>,
    root: NodeId,
    vars: VariableTable,
    #[serde(default, skip_serializing_if = "CountingLimit::is_undecided")]
    counting_limit: CountingLimit,
}

impl Plan {
    pub(crate) fn from_parts(nodes: Vec<Option<PlanNode>>, root: NodeId, vars: VariableTable) -> Self {
        let mut plan = Self {
            nodes,
            root,
            vars,
            counting_limit: CountingLimit::Undecided,
        };
        plan.refresh_producers();
        plan
    }

    /// Parses a serialized plan and validates it.
    pub fn from_json(text: &str) -> Result<Self> {
        let mut plan: Plan = serde_json::from_str(text)?;
        plan.refresh_producers();
        plan.validate()?;
        Ok(plan)
    }

    /// Terminal `Return` of the main scope.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Variable table.
    pub fn vars(&self) -> &VariableTable {
        &self.vars
    }

    /// Looks up a live node.
    pub fn node(&self, id: NodeId) -> Option<&PlanNode> {
        self.nodes.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut PlanNode> {
        self.nodes.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    /// Looks up a live node or reports an internal error.
    pub fn expect_node(&self, id: NodeId) -> Result<&PlanNode> {
        self.node(id)
            .ok_or_else(|| SpindleError::internal(format!("plan node {id} does not exist")))
    }

    pub(crate) fn remove_node(&mut self, id: NodeId) -> Result<PlanNode> {
        self.nodes
            .get_mut(id.0 as usize)
            .and_then(Option::take)
            .ok_or_else(|| SpindleError::internal(format!("cannot remove missing node {id}")))
    }

    pub(crate) fn set_predecessor(&mut self, id: NodeId, predecessor: Option<NodeId>) -> Result<()> {
        let node = self
            .node_mut(id)
            .ok_or_else(|| SpindleError::internal(format!("cannot relink missing node {id}")))?;
        node.predecessor = predecessor;
        Ok(())
    }

    /// Ids of all live nodes in arena order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().flatten().map(|node| node.id)
    }

    /// Number of live nodes across all scopes.
    pub fn len(&self) -> usize {
        self.nodes.iter().flatten().count()
    }

    /// Whether the plan has no live nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nodes from the scope's `Singleton` up to `terminal`.
    pub fn chain(&self, terminal: NodeId) -> Result<Vec<NodeId>> {
        let mut chain = Vec::new();
        let mut current = Some(terminal);
        while let Some(id) = current {
            if chain.len() > self.nodes.len() {
                return Err(SpindleError::internal(format!(
                    "predecessor cycle through node {id}"
                )));
            }
            let node = self.expect_node(id)?;
            chain.push(id);
            current = node.predecessor;
        }
        chain.reverse();
        Ok(chain)
    }

    /// All scopes, main scope first, then subquery bodies in depth-first order.
    pub fn scopes(&self) -> Result<Vec<Scope>> {
        let mut scopes = Vec::new();
        self.collect_scopes(self.root, None, 0, &mut scopes)?;
        Ok(scopes)
    }

    fn collect_scopes(
        &self,
        terminal: NodeId,
        owner: Option<NodeId>,
        depth: usize,
        out: &mut Vec<Scope>,
    ) -> Result<()> {
        if depth > self.nodes.len() {
            return Err(SpindleError::internal("subquery nesting cycle"));
        }
        let nodes = self.chain(terminal)?;
        let bodies: Vec<(NodeId, NodeId)> = nodes
            .iter()
            .filter_map(|id| match self.node(*id).map(|node| &node.op) {
                Some(PlanOp::Subquery { body, .. }) => Some((*id, *body)),
                _ => None,
            })
            .collect();
        out.push(Scope {
            terminal,
            nodes,
            owner,
            depth,
        });
        for (subquery, body) in bodies {
            self.collect_scopes(body, Some(subquery), depth + 1, out)?;
        }
        Ok(())
    }

    /// Nodes (in any scope) that read `var`.
    pub fn use_sites(&self, var: VarId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .flatten()
            .filter(|node| node.op.vars_used().contains(&var))
            .map(|node| node.id)
            .collect()
    }

    /// Rebinds `from` to `to` in every node of every scope.
    pub fn replace_var(&mut self, from: VarId, to: VarId) {
        for node in self.nodes.iter_mut().flatten() {
            node.op.replace_var(from, to);
        }
    }

    /// Recomputes every variable's producer back-reference.
    pub fn refresh_producers(&mut self) {
        let produced: Vec<(VarId, NodeId)> = self
            .nodes
            .iter()
            .flatten()
            .flat_map(|node| node.op.vars_set().into_iter().map(move |var| (var, node.id)))
            .collect();
        for idx in 0..self.vars.len() {
            self.vars.set_producer(VarId(idx as u32), None);
        }
        for (var, node) in produced {
            self.vars.set_producer(var, Some(node));
        }
    }

    /// The `Limit` whose input is counted for `fullCount`: the last `Limit` of
    /// the main chain at the time the plan was pinned, or of the current main
    /// chain if it never was.
    pub fn counting_limit(&self) -> Result<CountingLimit> {
        if !self.counting_limit.is_undecided() {
            return Ok(self.counting_limit);
        }
        let main = self.chain(self.root)?;
        let last = main.into_iter().rev().find(|id| {
            matches!(
                self.node(*id).map(|node| &node.op),
                Some(PlanOp::Limit { .. })
            )
        });
        Ok(last.map_or(CountingLimit::Returned, CountingLimit::Node))
    }

    /// Fixes the counting `Limit` so later rewrites that move limits into the
    /// main chain do not change which rows `fullCount` reports.
    pub fn pin_counting_limit(&mut self) -> Result<()> {
        self.counting_limit = self.counting_limit()?;
        Ok(())
    }

    /// Substitutes bind parameters in expressions and `@`-prefixed collection names.
    pub fn bind_parameters(&mut self, params: &BTreeMap<String, Value>) -> Result<()> {
        for node in self.nodes.iter_mut().flatten() {
            node.op.bind_parameters(params)?;
        }
        Ok(())
    }

    /// Checks structural and variable invariants.
    ///
    /// * every scope runs from a `Singleton` to a `Return`, every subquery body
    ///   ends in a `Return`, and no node is shared between scopes or orphaned;
    /// * every variable read resolves to a producer earlier in the same scope or
    ///   in an enclosing scope;
    /// * every variable is produced by exactly one node, and its producer
    ///   back-reference points at that node.
    pub fn validate(&self) -> Result<()> {
        let scopes = self.scopes()?;
        let mut owned: HashSet<NodeId> = HashSet::new();
        for scope in &scopes {
            let first = self.expect_node(scope.nodes[0])?;
            if first.op.kind() != NodeKind::Singleton {
                return Err(SpindleError::InvalidOwned(format!(
                    "scope ending at node {} does not start with a singleton",
                    scope.terminal
                )));
            }
            if self.expect_node(scope.terminal)?.op.kind() != NodeKind::Return {
                return Err(SpindleError::InvalidOwned(format!(
                    "scope terminal {} is not a return node",
                    scope.terminal
                )));
            }
            for id in &scope.nodes {
                if !owned.insert(*id) {
                    return Err(SpindleError::InvalidOwned(format!(
                        "node {id} belongs to more than one scope"
                    )));
                }
            }
        }
        if let Some(orphan) = self.node_ids().find(|id| !owned.contains(id)) {
            return Err(SpindleError::InvalidOwned(format!(
                "node {orphan} is not reachable from any scope"
            )));
        }

        if let CountingLimit::Node(id) = self.counting_limit {
            let is_limit = matches!(self.expect_node(id)?.op, PlanOp::Limit { .. });
            if !is_limit || scopes[0].position(id).is_none() {
                return Err(SpindleError::InvalidOwned(format!(
                    "counting limit {id} is not a limit of the main scope"
                )));
            }
        }

        let by_terminal: HashMap<NodeId, &Scope> =
            scopes.iter().map(|scope| (scope.terminal, scope)).collect();
        let mut produced = HashSet::new();
        self.validate_scope(&scopes[0], &by_terminal, &mut Vec::new(), &mut produced)
    }

    fn validate_scope(
        &self,
        scope: &Scope,
        by_terminal: &HashMap<NodeId, &Scope>,
        visible: &mut Vec<VarId>,
        produced: &mut HashSet<VarId>,
    ) -> Result<()> {
        let mark = visible.len();
        for id in &scope.nodes {
            let node = self.expect_node(*id)?;
            for var in node.op.vars_used() {
                if !visible.contains(&var) {
                    return Err(SpindleError::InvalidOwned(format!(
                        "{} {} reads variable '{}' ({var}) that is not visible there",
                        node.op.kind(),
                        node.id,
                        self.vars.name(var)
                    )));
                }
            }
            if let PlanOp::Subquery { body, .. } = &node.op {
                let body_scope = by_terminal.get(body).ok_or_else(|| {
                    SpindleError::InvalidOwned(format!("subquery {id} has no body scope"))
                })?;
                self.validate_scope(body_scope, by_terminal, visible, produced)?;
            }
            for var in node.op.vars_set() {
                if !produced.insert(var) {
                    return Err(SpindleError::InvalidOwned(format!(
                        "variable '{}' ({var}) is produced more than once",
                        self.vars.name(var)
                    )));
                }
                let recorded = self.vars.get(var).and_then(|v| v.producer);
                if recorded != Some(*id) {
                    return Err(SpindleError::InvalidOwned(format!(
                        "variable '{}' ({var}) records producer {recorded:?}, expected {id}",
                        self.vars.name(var)
                    )));
                }
                visible.push(var);
            }
        }
        visible.truncate(mark);
        Ok(())
    }
}
