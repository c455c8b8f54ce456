//! Query facade tying options, optimizer, explain and executor together.

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::query::exec::{Executor, QueryCursor, QueryResult};
use crate::query::explain::{explain, ExplainOutput};
use crate::query::optimizer::{Optimizer, OptimizerRules};
use crate::query::options::QueryOptions;
use crate::query::plan::Plan;
use crate::storage::StorageEngine;

/// Entry point for running plans against a storage collaborator.
///
/// ```
/// use std::sync::Arc;
/// use spindle::query::{Expr, PlanBuilder, QueryOptions, Value};
/// use spindle::storage::MemoryStore;
/// use spindle::QueryEngine;
///
/// # fn main() -> spindle::Result<()> {
/// let mut store = MemoryStore::new();
/// store.create_collection("users")?;
/// store.insert("users", Value::from_json(serde_json::json!({"name": "ada"})))?;
///
/// let mut b = PlanBuilder::new();
/// let user = b.for_collection("u", "users")?;
/// b.return_(Expr::var(user).attr("name"))?;
/// let plan = b.build()?;
///
/// let engine = QueryEngine::new(Arc::new(store));
/// let result = engine.execute(&plan, &QueryOptions::default())?;
/// assert_eq!(result.rows, vec![Value::from("ada")]);
/// # Ok(())
/// # }
/// ```
pub struct QueryEngine {
    storage: Arc<dyn StorageEngine>,
}

impl QueryEngine {
    /// Creates an engine over `storage`.
    pub fn new(storage: Arc<dyn StorageEngine>) -> Self {
        Self { storage }
    }

    /// Storage collaborator.
    pub fn storage(&self) -> &Arc<dyn StorageEngine> {
        &self.storage
    }

    /// Binds parameters and applies the enabled rules to a copy of `plan`.
    /// Returns the rewritten plan and the rules that changed it.
    pub fn prepare(&self, plan: &Plan, options: &QueryOptions) -> Result<(Plan, Vec<&'static str>)> {
        let rules = OptimizerRules::from_toggles(&options.optimizer.rules);
        let mut plan = plan.clone();
        plan.bind_parameters(&options.bind_vars)?;
        let applied = Optimizer::new(rules).optimize(&mut plan, self.storage.as_ref())?;
        debug!(rules = ?applied, nodes = plan.len(), "engine.prepare");
        Ok((plan, applied))
    }

    /// Explain output of the optimized plan.
    pub fn explain(&self, plan: &Plan, options: &QueryOptions) -> Result<ExplainOutput> {
        let (plan, applied) = self.prepare(plan, options)?;
        explain(&plan, &applied)
    }

    /// Explain output of `plan` as given, without rewrites.
    pub fn explain_raw(&self, plan: &Plan) -> Result<ExplainOutput> {
        explain(plan, &[])
    }

    /// Optimizes and runs `plan` to completion.
    pub fn execute(&self, plan: &Plan, options: &QueryOptions) -> Result<QueryResult> {
        self.cursor(plan, options)?.collect()
    }

    /// Optimizes `plan` and returns a lazily pulled cursor over its results.
    pub fn cursor(&self, plan: &Plan, options: &QueryOptions) -> Result<QueryCursor> {
        let (plan, _) = self.prepare(plan, options)?;
        Executor::new(Arc::clone(&self.storage)).cursor(&plan, options)
    }
}
