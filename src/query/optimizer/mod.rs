//! Plan rewrite rules and their toggles.

use std::collections::BTreeSet;

use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::query::plan::Plan;
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::storage::StorageEngine;

/// Subquery inlining rewrite.
pub mod inline;
/// Inlining eligibility analysis.
pub mod safety;
/// Index selection for equality filters.
pub mod use_indexes;

/// Name of the subquery inlining rule.
pub const INLINE_SUBQUERIES: &str = "inline-subqueries";
/// Name of the index selection rule.
pub const USE_INDEXES: &str = "use-indexes";

/// All rules, in application order.
pub const RULES: [&str; 2] = [INLINE_SUBQUERIES, USE_INDEXES];

/// Set of enabled rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OptimizerRules {
    enabled: BTreeSet<&'static str>,
}

impl Default for OptimizerRules {
    fn default() -> Self {
        Self::all()
    }
}

impl OptimizerRules {
    /// Every rule enabled.
    pub fn all() -> Self {
        Self {
            enabled: RULES.into_iter().collect(),
        }
    }

    /// Every rule disabled.
    pub fn none() -> Self {
        Self {
            enabled: BTreeSet::new(),
        }
    }

    /// Applies toggles (`-all`, `+all`, `-<rule>`, `+<rule>`) on top of the
    /// default set; later toggles win. Names of rules this optimizer does not
    /// have are ignored.
    pub fn from_toggles<S: AsRef<str>>(toggles: &[S]) -> Self {
        let mut rules = Self::all();
        for toggle in toggles {
            rules.apply_toggle(toggle.as_ref());
        }
        rules
    }

    fn apply_toggle(&mut self, toggle: &str) {
        let (enable, name) = if let Some(name) = toggle.strip_prefix('+') {
            (true, name)
        } else if let Some(name) = toggle.strip_prefix('-') {
            (false, name)
        } else {
            (true, toggle)
        };
        if name == "all" {
            *self = if enable { Self::all() } else { Self::none() };
            return;
        }
        let Some(rule) = RULES.into_iter().find(|rule| *rule == name) else {
            warn!(rule = name, "optimizer.rule.unknown");
            return;
        };
        if enable {
            self.enabled.insert(rule);
        } else {
            self.enabled.remove(rule);
        }
    }

    /// Whether `rule` is enabled.
    pub fn is_enabled(&self, rule: &str) -> bool {
        self.enabled.contains(rule)
    }
}

/// Applies the enabled rules to a plan.
#[derive(Clone, Debug, Default)]
pub struct Optimizer {
    rules: OptimizerRules,
}

impl Optimizer {
    /// Creates an optimizer over the given rule set.
    pub fn new(rules: OptimizerRules) -> Self {
        Self { rules }
    }

    /// Enabled rules.
    pub fn rules(&self) -> &OptimizerRules {
        &self.rules
    }

    /// Rewrites `plan` in place and returns the rules that changed it, in
    /// application order.
    pub fn optimize(&self, plan: &mut Plan, storage: &dyn StorageEngine) -> Result<Vec<&'static str>> {
        let timer = profile_timer();
        plan.pin_counting_limit()?;
        let mut applied = Vec::new();
        for rule in RULES {
            if !self.rules.is_enabled(rule) {
                trace!(rule, "optimizer.rule.disabled");
                continue;
            }
            let changes = match rule {
                INLINE_SUBQUERIES => inline::inline_subqueries(plan)?,
                USE_INDEXES => use_indexes::use_indexes(plan, storage)?,
                _ => 0,
            };
            debug!(rule, changes, "optimizer.rule.applied");
            if changes > 0 {
                applied.push(rule);
            }
        }
        record_profile_timer(QueryProfileKind::Optimize, timer);
        Ok(applied)
    }
}
