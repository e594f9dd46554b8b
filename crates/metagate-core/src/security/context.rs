//! Caller context that flows through every operation.
//!
//! The context carries the caller's identity, the attributes row filters may
//! reference, and a cancellation handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use metagate_proto::Value;

use super::formula::FormulaError;
use crate::catalog::{CURRENT_ROLE, CURRENT_USER};
use crate::error::{Error, Result};

/// Shared cancellation flag.
///
/// Clones observe the same flag, so a front-end can keep one clone and cancel
/// a request that is executing with another.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create an uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Per-request caller context.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    /// Authenticated user id, if any.
    pub user_id: Option<String>,
    /// Role the request runs under; set by the engine.
    pub role: Option<String>,
    /// Attributes available to row filters (`$org_id` and so on).
    pub attributes: HashMap<String, Value>,
    /// Request identifier for logs and audit records.
    pub request_id: Option<String>,
    cancel: CancelToken,
}

impl CallerContext {
    /// Context for an authenticated user.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    /// Context without a user.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Set an attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Set the role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Set the request id.
    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Share a cancellation token.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// The cancellation token.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Fail with `OperationCancelled` if cancellation was requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::OperationCancelled)
        } else {
            Ok(())
        }
    }

    /// Get an attribute.
    pub fn get_attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Resolve a placeholder name (without the leading `$`).
    ///
    /// A placeholder with no value is an error: the row filter that uses it
    /// cannot be evaluated and the request is refused.
    pub fn resolve(&self, placeholder: &str) -> std::result::Result<Value, FormulaError> {
        let value = match placeholder {
            CURRENT_USER => self.user_id.clone().map(Value::String),
            CURRENT_ROLE => self.role.clone().map(Value::String),
            name => self.attributes.get(name).cloned(),
        };
        match value {
            Some(Value::Null) | None => Err(FormulaError::MissingContext(placeholder.to_string())),
            Some(v) => Ok(v),
        }
    }
}
