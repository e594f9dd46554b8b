//! Hook handlers and their registrations.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use metagate_proto::{QueryAst, Record};
use thiserror::Error;

use super::event::{EventPattern, HookEvent, ObjectPattern};
use crate::engine::Outcome;
use crate::error::{Error, Result};
use crate::security::CallerContext;

/// What the pipeline does after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookFlow {
    /// Run the remaining handlers.
    Continue,
    /// Skip handlers that have not started yet.
    Stop,
}

/// Handler failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    /// The handler refused the operation.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The handler failed.
    #[error("failed: {0}")]
    Failed(String),

    /// The handler panicked.
    #[error("panicked: {0}")]
    Panicked(String),
}

/// Data visible to a handler.
#[derive(Debug, Clone)]
pub struct HookContext {
    /// Event being dispatched.
    pub event: HookEvent,
    /// Target object.
    pub object: String,
    /// Caller.
    pub caller: CallerContext,
    /// Query after row filters were merged.
    pub ast: QueryAst,
    /// Write payload for create and update.
    pub input: Option<Record>,
    /// Result, for after-hooks.
    pub outcome: Option<Outcome>,
}

impl HookContext {
    /// Context for a before-hook.
    pub fn new(event: HookEvent, object: impl Into<String>, caller: CallerContext, ast: QueryAst) -> Self {
        Self {
            event,
            object: object.into(),
            caller,
            ast,
            input: None,
            outcome: None,
        }
    }

    /// Attach a write payload.
    pub fn with_input(mut self, input: Option<Record>) -> Self {
        self.input = input;
        self
    }
}

/// A lifecycle callback.
#[async_trait]
pub trait HookHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, ctx: &HookContext) -> std::result::Result<HookFlow, HookError>;
}

/// Handler backed by a synchronous closure.
pub struct FnHook<F>(F);

#[async_trait]
impl<F> HookHandler for FnHook<F>
where
    F: Fn(&HookContext) -> std::result::Result<HookFlow, HookError> + Send + Sync,
{
    async fn handle(&self, ctx: &HookContext) -> std::result::Result<HookFlow, HookError> {
        (self.0)(ctx)
    }
}

/// Wrap a closure as a handler.
pub fn hook_fn<F>(f: F) -> Arc<dyn HookHandler>
where
    F: Fn(&HookContext) -> std::result::Result<HookFlow, HookError> + Send + Sync + 'static,
{
    Arc::new(FnHook(f))
}

/// A hook as stored in the registry.
#[derive(Clone)]
pub struct HookRegistration {
    /// Hook name, unique in the registry.
    pub name: String,
    /// Owning module.
    pub module: String,
    /// Events it subscribes to.
    pub event: EventPattern,
    /// Objects it subscribes to.
    pub object: ObjectPattern,
    /// Lower runs first.
    pub priority: i32,
    /// Callback.
    pub handler: Arc<dyn HookHandler>,
}

impl HookRegistration {
    /// Create a registration with priority 0.
    pub fn new(
        name: impl Into<String>,
        module: impl Into<String>,
        event: impl Into<EventPattern>,
        object: ObjectPattern,
        handler: Arc<dyn HookHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
            event: event.into(),
            object,
            priority: 0,
            handler,
        }
    }

    /// Create a registration from textual patterns (`before:*`, `sales_*`).
    pub fn parse(
        name: impl Into<String>,
        module: impl Into<String>,
        event: &str,
        object: &str,
        handler: Arc<dyn HookHandler>,
    ) -> Result<Self> {
        Ok(Self::new(name, module, event.parse::<EventPattern>()?, ObjectPattern::parse(object)?, handler))
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Whether the hook fires for `event` on `object`.
    pub fn matches(&self, event: HookEvent, object: &str) -> bool {
        self.event.matches(event) && self.object.matches(object)
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.module.is_empty() {
            return Err(Error::InvalidDefinition(format!(
                "hook '{}' needs a name and a module",
                self.name
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for HookRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistration")
            .field("name", &self.name)
            .field("module", &self.module)
            .field("event", &self.event.to_string())
            .field("object", &self.object.to_string())
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}
