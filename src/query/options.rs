//! Caller-supplied query options.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpindleError};
use crate::query::value::Value;

/// Rows served by one top-level pull unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Optimizer section of [`QueryOptions`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerOptions {
    /// Ordered rule toggles: `"-all"`, `"+all"`, `"-<rule>"`, `"+<rule>"`.
    pub rules: Vec<String>,
}

/// Options controlling one query.
///
/// ```toml
/// full_count = true
/// batch_size = 500
///
/// [optimizer]
/// rules = ["-all", "+inline-subqueries"]
///
/// [bind_vars]
/// "@cn" = "users"
/// min = 3
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    /// Compute the total number of matches ignoring the outermost limit.
    pub full_count: bool,
    /// Optimizer rule toggles.
    pub optimizer: OptimizerOptions,
    /// Row budget of one top-level pull.
    pub batch_size: usize,
    /// Bind parameters substituted before optimization.
    pub bind_vars: BTreeMap<String, Value>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            full_count: false,
            optimizer: OptimizerOptions::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            bind_vars: BTreeMap::new(),
        }
    }
}

impl QueryOptions {
    /// Parses options from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: QueryOptions =
            toml::from_str(text).map_err(|err| SpindleError::Config(err.to_string()))?;
        options.check()?;
        Ok(options)
    }

    /// Reads options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|err| SpindleError::Config(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Requests a total count.
    pub fn with_full_count(mut self, full_count: bool) -> Self {
        self.full_count = full_count;
        self
    }

    /// Appends optimizer rule toggles.
    pub fn with_rules<I, S>(mut self, rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optimizer.rules.extend(rules.into_iter().map(Into::into));
        self
    }

    /// Sets a bind parameter.
    pub fn with_bind_var(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bind_vars.insert(name.into(), value.into());
        self
    }

    /// Sets the row budget of one top-level pull.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    fn check(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(SpindleError::Config("batch_size must be positive".into()));
        }
        Ok(())
    }
}
