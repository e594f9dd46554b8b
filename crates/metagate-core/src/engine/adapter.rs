//! Storage adapter seam.

use async_trait::async_trait;
use metagate_proto::Record;
use thiserror::Error;

use super::runtime::Operation;
use crate::query::{CompiledPlan, RowMatcher};
use crate::security::{CallerContext, FieldVisibility};

/// Kind of backend failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// A uniqueness, not-null or foreign-key constraint failed.
    Constraint {
        /// Field the constraint is on, when known.
        field: Option<String>,
    },
    /// The backend could not be reached.
    Unavailable,
    /// Anything else.
    Other,
}

/// Error reported by a storage adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BackendError {
    /// Failure kind.
    pub kind: BackendErrorKind,
    /// Human-readable message.
    pub message: String,
}

impl BackendError {
    /// Constraint violation.
    pub fn constraint(field: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Constraint {
                field: field.map(str::to_string),
            },
            message: message.into(),
        }
    }

    /// Backend unreachable.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Unavailable,
            message: message.into(),
        }
    }

    /// Other failure.
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Other,
            message: message.into(),
        }
    }

    /// Strip references to fields the caller cannot see.
    ///
    /// A constraint violation on a hidden field, or a message naming one,
    /// would confirm the hidden value; such errors become a generic
    /// constraint violation.
    pub fn genericize(self, visibility: &FieldVisibility) -> Self {
        let BackendErrorKind::Constraint { field } = &self.kind else {
            return self;
        };
        let hidden_field = field.as_deref().is_some_and(|f| !visibility.is_visible(f));
        let names_hidden = visibility
            .hidden
            .keys()
            .any(|name| self.message.contains(name.as_str()));

        if hidden_field || names_hidden {
            Self::constraint(None, "constraint violation")
        } else {
            self
        }
    }
}

/// Per-request data handed to the adapter along with the plan.
pub struct AdapterRequest<'a> {
    /// Operation, including the write payload.
    pub operation: &'a Operation,
    /// Caller.
    pub caller: &'a CallerContext,
    /// Fail-closed matcher for filters the adapter evaluates itself,
    /// including formula leaves.
    pub matcher: RowMatcher<'a>,
}

/// What the adapter produced.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterOutput {
    /// Matching rows, or one row per group for aggregates.
    Rows(Vec<Record>),
    /// Row count.
    Count(u64),
    /// The stored record after a create.
    Created(Record),
    /// Number of rows updated or deleted.
    Affected {
        /// Row count.
        count: u64,
    },
}

/// Executes compiled plans against a backend.
///
/// The plan's filter already contains the caller's row filters; an adapter
/// must apply it in full. Formula leaves it cannot push down are evaluated
/// with [`AdapterRequest::matcher`].
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Execute a plan.
    async fn execute(
        &self,
        plan: &CompiledPlan,
        request: &AdapterRequest<'_>,
    ) -> Result<AdapterOutput, BackendError>;
}
