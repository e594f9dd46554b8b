//! Formula evaluation seam.
//!
//! Formula predicates are opaque to the engine. An external evaluator decides
//! them per record; every failure excludes the record.

use std::time::Duration;

use metagate_proto::Record;
use thiserror::Error;

use super::context::CallerContext;

/// Formula failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormulaError {
    /// No evaluator is configured.
    #[error("no formula evaluator configured")]
    Unavailable,

    /// The expression does not parse.
    #[error("malformed formula: {0}")]
    Malformed(String),

    /// The expression failed at runtime.
    #[error("formula failed: {0}")]
    Failed(String),

    /// The per-record time budget was exceeded.
    #[error("formula budget of {0:?} exceeded")]
    BudgetExceeded(Duration),

    /// A placeholder has no value in the caller context.
    #[error("missing context value: {0}")]
    MissingContext(String),

    /// The expression did not produce a boolean.
    #[error("formula returned a non-boolean value")]
    NotBoolean,
}

/// Evaluation limits for a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormulaBudget {
    /// Wall-clock limit.
    pub max_duration: Duration,
}

impl FormulaBudget {
    /// Budget with the given time limit.
    pub fn new(max_duration: Duration) -> Self {
        Self { max_duration }
    }
}

/// Evaluates formula predicates.
pub trait FormulaEvaluator: Send + Sync {
    /// Evaluate `expression` against `record`.
    fn evaluate(
        &self,
        expression: &str,
        record: &Record,
        caller: &CallerContext,
        budget: &FormulaBudget,
    ) -> Result<bool, FormulaError>;

    /// Check that `expression` parses. Called when permission decisions are
    /// built; a failure turns the decision into deny-all.
    fn validate(&self, _expression: &str) -> Result<(), FormulaError> {
        Ok(())
    }
}

/// Evaluator used when none is configured: every formula fails, so every
/// record guarded by one is excluded.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFormulaEvaluator;

impl FormulaEvaluator for NoFormulaEvaluator {
    fn evaluate(
        &self,
        _expression: &str,
        _record: &Record,
        _caller: &CallerContext,
        _budget: &FormulaBudget,
    ) -> Result<bool, FormulaError> {
        Err(FormulaError::Unavailable)
    }

    fn validate(&self, _expression: &str) -> Result<(), FormulaError> {
        Err(FormulaError::Unavailable)
    }
}
