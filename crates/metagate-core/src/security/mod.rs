//! Access control: permission decisions, row-level and field-level security.
//!
//! # Components
//!
//! - [`CallerContext`] - who is asking, and the values row filters bind to
//! - [`PermissionCompiler`] - compiles rules into cached [`PermissionDecision`]s
//! - [`row_predicates`] - binds a decision's row filters to a caller
//! - [`FieldMasker`] - applies masking strategies to result rows
//! - [`FormulaEvaluator`] - seam for opaque formula predicates
//! - [`AuditLogger`] - security event sink

pub mod audit;
pub mod compiler;
pub mod context;
pub mod decision;
pub mod field_security;
pub mod formula;
pub mod rls;

pub use audit::{AuditEvent, AuditEventType, AuditLogger, MemoryAuditLogger, TracingAuditLogger};
pub use compiler::PermissionCompiler;
pub use context::{CallerContext, CancelToken};
pub use decision::{Access, PermissionDecision, RowPredicate};
pub use field_security::{FieldMasker, FieldVisibility};
pub use formula::{FormulaBudget, FormulaError, FormulaEvaluator, NoFormulaEvaluator};
pub use rls::row_predicates;
