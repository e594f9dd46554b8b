//! Query compilation, plan caching and filter evaluation.

pub mod cache;
pub mod compiler;
pub mod filter;
pub mod fingerprint;
pub mod index_hint;
pub mod normalize;

pub use cache::{CacheStats, PlanCache};
pub use compiler::{CompiledPlan, QueryCompiler};
pub use filter::{FilterEvaluator, FormulaScope, RowMatcher};
pub use fingerprint::PlanKey;
pub use index_hint::{select_index_hints, IndexHint, IndexUsage};
pub use normalize::{normalize, normalize_filter};
