//! metagate query description types.
//!
//! This crate defines the backend-agnostic query AST that protocol front-ends
//! build and the metagate engine secures, compiles and caches.
//!
//! # Modules
//!
//! - [`value`] - Runtime value type for filter operands and result rows
//! - [`query`] - Filter tree, sort, pagination, aggregation and projection
//! - [`json`] - Array/object JSON filter syntax
//! - [`error`] - Parse and construction errors
//!
//! # Example
//!
//! ```
//! use metagate_proto::{FilterNode, Pagination, QueryAst, SortKey};
//!
//! let ast = QueryAst::new()
//!     .with_filter(FilterNode::eq("status", "open"))
//!     .with_sort(SortKey::desc("created_at"))
//!     .with_pagination(Pagination::limit(20));
//!
//! assert_eq!(ast.referenced_fields().len(), 2);
//! ```

pub mod error;
pub mod json;
pub mod query;
pub mod value;

pub use error::{Error, Result};
pub use query::{
    AggregateFunction, Aggregation, Condition, FilterNode, Measure, Operator, Pagination,
    QueryAst, SortDirection, SortKey,
};
pub use value::{Record, Value};
