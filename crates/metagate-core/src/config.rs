//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default number of compiled plans kept in the plan cache.
pub const DEFAULT_PLAN_CACHE_CAPACITY: usize = 1024;

/// Default per-record time budget for formula predicates, in milliseconds.
pub const DEFAULT_FORMULA_BUDGET_MS: u64 = 50;

/// Default name of the field that identifies a record's owner.
pub const DEFAULT_OWNER_FIELD: &str = "owner_id";

/// Default maximum nesting depth accepted for a filter tree.
pub const DEFAULT_MAX_FILTER_DEPTH: usize = 32;

/// Engine configuration.
///
/// Every field has a default, so a loader can deserialize a partial JSON
/// document:
///
/// ```
/// use metagate_core::EngineConfig;
///
/// let config = EngineConfig::from_json(r#"{"plan_cache_capacity": 16}"#).unwrap();
/// assert_eq!(config.plan_cache_capacity, 16);
/// assert_eq!(config.default_owner_field, "owner_id");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of compiled plans kept (0 disables plan caching).
    pub plan_cache_capacity: usize,

    /// Per-record time budget for formula predicates, in milliseconds.
    pub formula_budget_ms: u64,

    /// Owner field used when an object does not declare one.
    pub default_owner_field: String,

    /// Maximum filter tree depth accepted from callers.
    pub max_filter_depth: usize,

    /// Reject filter, sort and grouping references to hidden fields.
    pub deny_hidden_field_references: bool,
}

impl EngineConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self {
            plan_cache_capacity: DEFAULT_PLAN_CACHE_CAPACITY,
            formula_budget_ms: DEFAULT_FORMULA_BUDGET_MS,
            default_owner_field: DEFAULT_OWNER_FIELD.to_string(),
            max_filter_depth: DEFAULT_MAX_FILTER_DEPTH,
            deny_hidden_field_references: true,
        }
    }

    /// Parse a configuration from JSON, filling in defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidDefinition(format!("engine config: {}", e)))
    }

    /// Set the plan cache capacity.
    pub fn with_plan_cache_capacity(mut self, capacity: usize) -> Self {
        self.plan_cache_capacity = capacity;
        self
    }

    /// Set the formula time budget.
    pub fn with_formula_budget(mut self, budget: Duration) -> Self {
        self.formula_budget_ms = budget.as_millis() as u64;
        self
    }

    /// Set the default owner field.
    pub fn with_default_owner_field(mut self, field: impl Into<String>) -> Self {
        self.default_owner_field = field.into();
        self
    }

    /// Set the maximum filter depth.
    pub fn with_max_filter_depth(mut self, depth: usize) -> Self {
        self.max_filter_depth = depth.max(1);
        self
    }

    /// Allow filters on hidden fields.
    pub fn allow_hidden_field_references(mut self) -> Self {
        self.deny_hidden_field_references = false;
        self
    }

    /// Formula budget as a duration.
    pub fn formula_budget(&self) -> Duration {
        Duration::from_millis(self.formula_budget_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}
