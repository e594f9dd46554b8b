//! metagate core engine.
//!
//! Turns declarative object, field and permission metadata into
//! access-controlled, cached query plans.
//!
//! # Modules
//!
//! - [`catalog`] - Metadata registry: objects, permission rules, hooks
//! - [`security`] - Permission decisions, row filters, field masking, audit
//! - [`query`] - Normalization, plan keys, plan cache, filter evaluation
//! - [`hooks`] - Lifecycle hook dispatch
//! - [`engine`] - Security-aware execution over a storage adapter
//! - [`config`] - Engine configuration
//! - [`error`] - Error taxonomy
//!
//! # Example
//!
//! ```
//! use metagate_core::catalog::{FieldDef, FieldType, ObjectDef, PermissionRule, Registry, Verb, VerbSet};
//! use metagate_core::security::{NoFormulaEvaluator, PermissionCompiler};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(Registry::new());
//! registry
//!     .register(ObjectDef::new("invoice", "billing").with_field(FieldDef::new("id", FieldType::Uuid)))
//!     .unwrap();
//! registry
//!     .register(PermissionRule::allow("read", "billing", "viewer", "invoice", VerbSet::from(Verb::Read)))
//!     .unwrap();
//!
//! let permissions = PermissionCompiler::new(registry.clone(), Arc::new(NoFormulaEvaluator));
//! let decision = permissions.get_decision("viewer", "invoice").unwrap();
//! assert!(decision.allows(Verb::Read));
//! assert!(!decision.allows(Verb::Delete));
//! ```

pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod query;
pub mod security;
mod singleflight;

pub use catalog::{ObjectDef, PermissionRule, Registry};
pub use config::EngineConfig;
pub use engine::{AdapterOutput, AdapterRequest, BackendError, Engine, Operation, Outcome, StorageAdapter};
pub use error::{Error, ExternalError, Result};
pub use query::{CompiledPlan, PlanKey, QueryCompiler};
pub use security::{CallerContext, PermissionCompiler, PermissionDecision};
