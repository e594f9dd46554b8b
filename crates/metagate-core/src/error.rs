//! Engine error taxonomy.

use thiserror::Error;

use crate::catalog::ItemKind;
use crate::engine::BackendError;
use crate::security::FormulaError;

/// Errors raised by the registry, the compilers, the hook pipeline and the
/// engine.
///
/// `Clone` so that a single-flight build can hand the same failure to every
/// waiter.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// An item with the same kind and name is already registered.
    #[error("duplicate {kind} definition: {name}")]
    DuplicateDefinition {
        /// Kind of the conflicting item.
        kind: ItemKind,
        /// Name of the conflicting item.
        name: String,
    },

    /// No item with the given kind and name exists.
    #[error("{kind} not found: {name}")]
    NotFound {
        /// Kind that was looked up.
        kind: ItemKind,
        /// Name that was looked up.
        name: String,
    },

    /// The caller's role may not perform the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A formula or placeholder in a row-level rule could not be evaluated.
    #[error("formula evaluation failed: {0}")]
    FormulaEvaluation(#[from] FormulaError),

    /// A before-hook rejected the operation.
    #[error("operation aborted: {0}")]
    OperationAborted(String),

    /// The storage adapter failed.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// The caller cancelled before the plan was dispatched.
    #[error("operation cancelled")]
    OperationCancelled,

    /// A definition handed to the registry is malformed.
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    /// A query references unknown fields or is otherwise malformed.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Filter syntax error.
    #[error("protocol error: {0}")]
    Protocol(#[from] metagate_proto::Error),
}

/// Error as reported to an untrusted caller.
///
/// Denials, formula faults and missing objects all surface as `NotFound` so
/// that the response does not reveal whether a record or object exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExternalError {
    /// Not found or not permitted.
    #[error("not found")]
    NotFound,

    /// Conflicting definition.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed request or definition.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Rejected by application logic.
    #[error("aborted: {0}")]
    Aborted(String),

    /// Cancelled by the caller.
    #[error("cancelled")]
    Cancelled,

    /// Storage failure.
    #[error("backend unavailable: {0}")]
    Backend(String),
}

impl Error {
    /// Shorthand for an object lookup miss.
    pub fn object_not_found(name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: ItemKind::Object,
            name: name.into(),
        }
    }

    /// Whether this error is a security refusal (denial or formula fault).
    pub fn is_denial(&self) -> bool {
        matches!(self, Error::PermissionDenied(_) | Error::FormulaEvaluation(_))
    }

    /// Collapse into the caller-facing form.
    pub fn external(&self) -> ExternalError {
        match self {
            Error::NotFound { .. } | Error::PermissionDenied(_) | Error::FormulaEvaluation(_) => {
                ExternalError::NotFound
            }
            Error::DuplicateDefinition { kind, name } => {
                ExternalError::Conflict(format!("{} {}", kind, name))
            }
            Error::OperationAborted(reason) => ExternalError::Aborted(reason.clone()),
            Error::OperationCancelled => ExternalError::Cancelled,
            Error::Backend(err) => ExternalError::Backend(err.to_string()),
            Error::InvalidDefinition(msg) | Error::InvalidQuery(msg) => {
                ExternalError::Invalid(msg.clone())
            }
            Error::Protocol(err) => ExternalError::Invalid(err.to_string()),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_collapses_refusals() {
        let denied = Error::PermissionDenied("viewer may not delete invoice".into());
        let missing = Error::object_not_found("invoice");
        let formula = Error::FormulaEvaluation(FormulaError::MissingContext("org_id".into()));

        assert_eq!(denied.external(), ExternalError::NotFound);
        assert_eq!(missing.external(), ExternalError::NotFound);
        assert_eq!(formula.external(), ExternalError::NotFound);
        assert_eq!(denied.external().to_string(), missing.external().to_string());
    }

    #[test]
    fn test_external_keeps_other_kinds() {
        assert_eq!(Error::OperationCancelled.external(), ExternalError::Cancelled);
        assert_eq!(
            Error::OperationAborted("closed period".into()).external(),
            ExternalError::Aborted("closed period".into())
        );
    }

    #[test]
    fn test_is_denial() {
        assert!(Error::PermissionDenied("x".into()).is_denial());
        assert!(!Error::OperationCancelled.is_denial());
    }
}
