//! Fluent plan builder.
//!
//! Mirrors the clause order of a query: each call appends one node (plus a
//! temporary `Calculation` where an expression has to be materialized) to the
//! scope currently being built. Subquery bodies are built by a closure that
//! runs against the same builder with a fresh scope pushed.

use crate::error::{Result, SpindleError};
use crate::query::expr::Expr;
use crate::query::plan::{
    CollectGroup, CollectInto, CollectMethod, Plan, PlanNode, PlanOp, SortKey, VariableTable,
};
use crate::types::{NodeId, VarId};

struct ScopeState {
    tail: NodeId,
    names: Vec<(String, VarId)>,
    returned: Option<NodeId>,
}

/// Variables bound by [`PlanBuilder::collect`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectVars {
    /// Group key variables, in criterion order.
    pub groups: Vec<VarId>,
    /// `INTO` variable, when requested.
    pub into: Option<VarId>,
    /// `WITH COUNT INTO` variable, when requested.
    pub count: Option<VarId>,
}

/// Builds a [`Plan`] clause by clause.
pub struct PlanBuilder {
    nodes: Vec<Option<PlanNode>>,
    vars: VariableTable,
    scopes: Vec<ScopeState>,
}

impl Default for PlanBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanBuilder {
    /// Creates a builder positioned in an empty main scope.
    pub fn new() -> Self {
        let mut builder = Self {
            nodes: Vec::new(),
            vars: VariableTable::default(),
            scopes: Vec::new(),
        };
        builder.push_scope();
        builder
    }

    fn push_scope(&mut self) {
        let singleton = self.alloc(PlanOp::Singleton, None);
        self.scopes.push(ScopeState {
            tail: singleton,
            names: Vec::new(),
            returned: None,
        });
    }

    fn alloc(&mut self, op: PlanOp, predecessor: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Some(PlanNode {
            id,
            op,
            predecessor,
        }));
        id
    }

    fn current(&mut self) -> Result<&mut ScopeState> {
        let scope = self
            .scopes
            .last_mut()
            .ok_or(SpindleError::Invalid("builder has no open scope"))?;
        if scope.returned.is_some() {
            return Err(SpindleError::Invalid("scope already ended with RETURN"));
        }
        Ok(scope)
    }

    fn append(&mut self, op: PlanOp) -> Result<NodeId> {
        let tail = self.current()?.tail;
        let id = self.alloc(op, Some(tail));
        self.current()?.tail = id;
        Ok(id)
    }

    fn declare(&mut self, name: &str) -> Result<VarId> {
        if self.lookup(name).is_some() {
            return Err(SpindleError::InvalidOwned(format!(
                "variable '{name}' is already declared"
            )));
        }
        let var = self.vars.create(name, true);
        self.current()?.names.push((name.to_owned(), var));
        Ok(var)
    }

    fn lookup(&self, name: &str) -> Option<VarId> {
        self.scopes.iter().rev().find_map(|scope| {
            scope
                .names
                .iter()
                .rev()
                .find(|(declared, _)| declared == name)
                .map(|(_, var)| *var)
        })
    }

    /// Resolves a declared variable by name, searching enclosing scopes.
    pub fn var(&self, name: &str) -> Result<VarId> {
        self.lookup(name)
            .ok_or_else(|| SpindleError::InvalidOwned(format!("variable '{name}' is not declared")))
    }

    /// Returns `expr`'s variable, or binds it to a fresh temporary.
    fn materialize(&mut self, expr: Expr) -> Result<VarId> {
        if let Some(var) = expr.as_var() {
            return Ok(var);
        }
        let out = self.vars.create_temporary();
        self.append(PlanOp::Calculation { expr, out })?;
        Ok(out)
    }

    /// `FOR name IN collection`
    pub fn for_collection(&mut self, name: &str, collection: &str) -> Result<VarId> {
        let out = self.declare(name)?;
        self.append(PlanOp::EnumerateCollection {
            collection: collection.to_owned(),
            out,
        })?;
        Ok(out)
    }

    /// `FOR name IN expr` over an array value.
    pub fn for_in(&mut self, name: &str, expr: Expr) -> Result<VarId> {
        let input = self.materialize(expr)?;
        let out = self.declare(name)?;
        self.append(PlanOp::EnumerateList { input, out })?;
        Ok(out)
    }

    /// `FOR name IN view SEARCH condition`; `condition` receives the view variable.
    pub fn for_view<F>(&mut self, name: &str, view: &str, condition: F) -> Result<VarId>
    where
        F: FnOnce(VarId) -> Option<Expr>,
    {
        let out = self.declare(name)?;
        let condition = condition(out);
        self.append(PlanOp::EnumerateView {
            view: view.to_owned(),
            condition,
            out,
        })?;
        Ok(out)
    }

    /// `LET name = expr`
    pub fn let_(&mut self, name: &str, expr: Expr) -> Result<VarId> {
        let out = self.declare(name)?;
        self.append(PlanOp::Calculation { expr, out })?;
        Ok(out)
    }

    /// `FILTER expr`
    pub fn filter(&mut self, expr: Expr) -> Result<()> {
        let input = self.materialize(expr)?;
        self.append(PlanOp::Filter { input })?;
        Ok(())
    }

    /// `SORT expr [ASC|DESC], ...`; `true` means ascending.
    pub fn sort<I>(&mut self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = (Expr, bool)>,
    {
        let mut sort_keys = Vec::new();
        for (expr, ascending) in keys {
            let var = self.materialize(expr)?;
            sort_keys.push(SortKey { var, ascending });
        }
        if sort_keys.is_empty() {
            return Err(SpindleError::Invalid("SORT requires at least one key"));
        }
        self.append(PlanOp::Sort { keys: sort_keys })?;
        Ok(())
    }

    /// `LIMIT offset, limit`
    pub fn limit(&mut self, offset: u64, limit: u64) -> Result<()> {
        self.append(PlanOp::Limit { offset, limit })?;
        Ok(())
    }

    /// `COLLECT name = expr, ... [INTO into] [WITH COUNT INTO count]`.
    ///
    /// `INTO` captures every user variable visible in the current scope. After
    /// the collect only the new variables (and those of enclosing scopes) can be
    /// referenced by name.
    pub fn collect(
        &mut self,
        groups: Vec<(&str, Expr)>,
        into: Option<&str>,
        count: Option<&str>,
    ) -> Result<CollectVars> {
        let mut inputs = Vec::with_capacity(groups.len());
        for (name, expr) in &groups {
            inputs.push((*name, self.materialize(expr.clone())?));
        }
        let keep: Vec<VarId> = self.current()?.names.iter().map(|(_, var)| *var).collect();
        self.current()?.names.clear();

        let mut plan_groups = Vec::with_capacity(inputs.len());
        for (name, input) in inputs {
            let out = self.declare(name)?;
            plan_groups.push(CollectGroup { out, input });
        }
        let into = match into {
            Some(name) => Some(CollectInto {
                out: self.declare(name)?,
                keep,
            }),
            None => None,
        };
        let count = count.map(|name| self.declare(name)).transpose()?;
        let vars = CollectVars {
            groups: plan_groups.iter().map(|group| group.out).collect(),
            into: into.as_ref().map(|into| into.out),
            count,
        };
        self.append(PlanOp::Collect {
            groups: plan_groups,
            into,
            count,
            method: CollectMethod::Hash,
        })?;
        Ok(vars)
    }

    /// `LET name = ( body )`
    pub fn subquery<F>(&mut self, name: &str, body: F) -> Result<VarId>
    where
        F: FnOnce(&mut PlanBuilder) -> Result<()>,
    {
        self.current()?;
        self.push_scope();
        body(self)?;
        let scope = self
            .scopes
            .pop()
            .ok_or(SpindleError::Invalid("subquery scope vanished"))?;
        let terminal = scope
            .returned
            .ok_or(SpindleError::Invalid("subquery body must end with RETURN"))?;
        let out = self.declare(name)?;
        self.append(PlanOp::Subquery {
            body: terminal,
            out,
        })?;
        Ok(out)
    }

    /// `RETURN expr`; ends the current scope.
    pub fn return_(&mut self, expr: Expr) -> Result<()> {
        let input = self.materialize(expr)?;
        let id = self.append(PlanOp::Return { input })?;
        self.current()?.returned = Some(id);
        Ok(())
    }

    /// `RETURN DISTINCT expr`; ends the current scope.
    pub fn return_distinct(&mut self, expr: Expr) -> Result<()> {
        let input = self.materialize(expr)?;
        let out = self.vars.create_temporary();
        self.append(PlanOp::Collect {
            groups: vec![CollectGroup { out, input }],
            into: None,
            count: None,
            method: CollectMethod::Distinct,
        })?;
        self.return_(Expr::var(out))
    }

    /// Finishes the plan and validates it.
    pub fn build(mut self) -> Result<Plan> {
        if self.scopes.len() != 1 {
            return Err(SpindleError::Invalid("unterminated subquery"));
        }
        let root = self
            .scopes
            .pop()
            .and_then(|scope| scope.returned)
            .ok_or(SpindleError::Invalid("query must end with RETURN"))?;
        let plan = Plan::from_parts(self.nodes, root, self.vars);
        plan.validate()?;
        Ok(plan)
    }
}
