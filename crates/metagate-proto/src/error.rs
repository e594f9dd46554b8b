//! Query description errors.

use thiserror::Error;

/// Errors raised while building or parsing a query description.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Unknown comparison operator.
    #[error("unknown operator: {0}")]
    UnknownOperator(String),

    /// Malformed filter description.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// A JSON value that has no runtime value equivalent.
    #[error("unsupported value: {0}")]
    UnsupportedValue(String),
}

/// Result alias for query description operations.
pub type Result<T> = std::result::Result<T, Error>;
