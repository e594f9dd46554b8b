//! Security-aware execution engine and the storage adapter seam.

mod adapter;
mod runtime;

pub use adapter::{AdapterOutput, AdapterRequest, BackendError, BackendErrorKind, StorageAdapter};
pub use runtime::{Engine, EngineBuilder, Operation, Outcome};
