//! Lifecycle hooks.
//!
//! Hooks are registered through the [`Registry`](crate::catalog::Registry)
//! like any other catalog item and dispatched by the [`HookPipeline`].

pub mod event;
pub mod handler;
pub mod pipeline;

pub use event::{EventPattern, HookAction, HookEvent, HookPhase, ObjectPattern};
pub use handler::{hook_fn, FnHook, HookContext, HookError, HookFlow, HookHandler, HookRegistration};
pub use pipeline::{HookFailure, HookPipeline, HookReport};
