//! Query compilation.
//!
//! Compiles a query against an object definition into a shareable plan:
//! references are checked against the registry, the AST is normalized and
//! hashed, and index hints are attached. Plans are cached by structural key;
//! concurrent misses on the same key share one build.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use metagate_proto::{AggregateFunction, FilterNode, QueryAst};
use tracing::debug;

use super::cache::{CacheStats, PlanCache};
use super::fingerprint::PlanKey;
use super::index_hint::{select_index_hints, IndexHint};
use super::normalize::normalize;
use crate::catalog::{CatalogChange, ObjectDef, Registry, RegistryObserver};
use crate::config::DEFAULT_MAX_FILTER_DEPTH;
use crate::error::{Error, Result};
use crate::singleflight::SingleFlight;

/// An immutable, driver-agnostic execution plan.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPlan {
    /// Structural hash of `object` and `ast`.
    pub key: PlanKey,
    /// Root object.
    pub object: String,
    /// Normalized query, row filters already merged.
    pub ast: QueryAst,
    /// Usable indexes, most selective first.
    pub index_hints: Vec<IndexHint>,
}

impl CompiledPlan {
    /// Normalized filter, if any.
    pub fn filter(&self) -> Option<&FilterNode> {
        self.ast.filter.as_ref()
    }

    /// Best index hint.
    pub fn preferred_index(&self) -> Option<&IndexHint> {
        self.index_hints.first()
    }

    /// Whether the filter can never match.
    pub fn is_empty_result(&self) -> bool {
        matches!(self.ast.filter, Some(FilterNode::Const(false)))
    }
}

/// Compiles and caches query plans.
pub struct QueryCompiler {
    registry: Arc<Registry>,
    cache: PlanCache,
    inflight: SingleFlight<PlanKey, Arc<CompiledPlan>>,
    max_filter_depth: usize,
    builds: AtomicU64,
}

impl QueryCompiler {
    /// Create a compiler with a plan cache of `capacity` entries.
    pub fn new(registry: Arc<Registry>, capacity: usize) -> Self {
        Self {
            registry,
            cache: PlanCache::new(capacity),
            inflight: SingleFlight::new(),
            max_filter_depth: DEFAULT_MAX_FILTER_DEPTH,
            builds: AtomicU64::new(0),
        }
    }

    /// Set the maximum accepted filter depth.
    pub fn with_max_filter_depth(mut self, depth: usize) -> Self {
        self.max_filter_depth = depth.max(1);
        self
    }

    /// Compile `ast` against `object`.
    ///
    /// Semantically identical queries (for example `AND(a, b)` and
    /// `AND(b, a)`) yield the same plan.
    pub fn compile(&self, object: &str, ast: &QueryAst) -> Result<Arc<CompiledPlan>> {
        let def = self.registry.object(object)?;
        self.validate(&def, ast)?;

        let normalized = normalize(ast);
        let key = PlanKey::compute(object, &normalized);

        if let Some(plan) = self.cache.get(&key) {
            debug!(object, key = ?key, "plan cache hit");
            return Ok(plan);
        }
        debug!(object, key = ?key, "plan cache miss");

        self.inflight.run(&key, || {
            if let Some(plan) = self.cache.lookup(&key) {
                return Ok(plan);
            }

            // the epoch is read before the definition so that a concurrent
            // invalidation keeps this build out of the cache
            let epoch = self.cache.epoch();
            let def = self.registry.object(object)?;
            let index_hints = select_index_hints(&def, &normalized);

            let plan = Arc::new(CompiledPlan {
                key,
                object: object.to_string(),
                ast: normalized.clone(),
                index_hints,
            });
            self.builds.fetch_add(1, Ordering::Relaxed);

            if !self.cache.insert(plan.clone(), epoch) {
                debug!(object, key = ?key, "plan built from stale metadata, not cached");
            }
            Ok(plan)
        })
    }

    fn validate(&self, def: &ObjectDef, ast: &QueryAst) -> Result<()> {
        if let Some(filter) = &ast.filter {
            let depth = filter.depth();
            if depth > self.max_filter_depth {
                return Err(Error::InvalidQuery(format!(
                    "filter depth {} exceeds limit {}",
                    depth, self.max_filter_depth
                )));
            }
        }

        for field in ast.referenced_fields() {
            def.resolve_path(&field)?;
        }

        if let Some(aggregation) = &ast.aggregation {
            for measure in &aggregation.measures {
                if measure.field.is_none() && measure.function != AggregateFunction::Count {
                    return Err(Error::InvalidQuery(format!(
                        "measure '{}' needs a field",
                        measure.alias
                    )));
                }
            }

            // having is evaluated over groups, not rows
            if let Some(having) = &aggregation.having {
                for field in having.fields() {
                    let known = aggregation.group_by.contains(&field)
                        || aggregation.measures.iter().any(|m| m.alias == field);
                    if !known {
                        return Err(Error::InvalidQuery(format!(
                            "having references '{}', which is neither a group key nor a measure",
                            field
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Drop cached plans for `object`.
    pub fn invalidate(&self, object: &str) -> usize {
        let dropped = self.cache.invalidate(object);
        self.inflight.forget_all();
        debug!(object, dropped, "invalidated plans");
        dropped
    }

    /// Drop every cached plan.
    pub fn clear(&self) {
        self.cache.clear();
        self.inflight.forget_all();
    }

    /// The plan cache.
    pub fn cache(&self) -> &PlanCache {
        &self.cache
    }

    /// Plan cache statistics.
    pub fn stats(&self) -> &CacheStats {
        self.cache.stats()
    }

    /// Number of plans built (cache misses that ran a build).
    pub fn build_count(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }
}

impl RegistryObserver for QueryCompiler {
    fn on_change(&self, _registry: &Registry, change: &CatalogChange) {
        match change {
            CatalogChange::ObjectChanged(name) | CatalogChange::ObjectRemoved(name) => {
                self.invalidate(name);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FieldDef, FieldType, IndexDef};
    use metagate_proto::{Aggregation, Measure, SortKey};
    use std::sync::Barrier;
    use std::thread;

    fn setup() -> (Arc<Registry>, Arc<QueryCompiler>) {
        let registry = Arc::new(Registry::new());
        registry
            .register(
                ObjectDef::new("invoice", "billing")
                    .with_field(FieldDef::new("id", FieldType::Uuid))
                    .with_field(FieldDef::new("owner_id", FieldType::Text))
                    .with_field(FieldDef::new("status", FieldType::Text))
                    .with_field(FieldDef::new("total", FieldType::Float))
                    .with_field(FieldDef::new("customer", FieldType::lookup("customer")))
                    .with_index(IndexDef::new("by_owner", vec!["owner_id".into()]))
                    .extensible(),
            )
            .unwrap();

        let compiler = Arc::new(QueryCompiler::new(registry.clone(), 16));
        registry.subscribe(compiler.clone());
        (registry, compiler)
    }

    fn a() -> FilterNode {
        FilterNode::eq("status", "open")
    }

    fn b() -> FilterNode {
        FilterNode::gt("total", 10)
    }

    #[test]
    fn test_reordered_branches_share_plan() {
        let (_, compiler) = setup();
        let first = compiler
            .compile("invoice", &QueryAst::new().with_filter(FilterNode::and(vec![a(), b()])))
            .unwrap();
        let second = compiler
            .compile("invoice", &QueryAst::new().with_filter(FilterNode::and(vec![b(), a()])))
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(compiler.build_count(), 1);
        assert_eq!(compiler.stats().hits(), 1);
    }

    #[test]
    fn test_index_hints_attached() {
        let (_, compiler) = setup();
        let plan = compiler
            .compile(
                "invoice",
                &QueryAst::new().with_filter(FilterNode::eq("owner_id", "U1")),
            )
            .unwrap();
        assert_eq!(plan.preferred_index().map(|h| h.index.as_str()), Some("by_owner"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let (_, compiler) = setup();
        let err = compiler
            .compile("invoice", &QueryAst::new().with_sort(SortKey::asc("nope")))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)));

        let err = compiler
            .compile("invoice", &QueryAst::new().with_filter(FilterNode::eq("status.x", 1)))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)));

        // lookups allow dotted paths
        compiler
            .compile("invoice", &QueryAst::new().with_filter(FilterNode::eq("customer.name", "Acme")))
            .unwrap();
    }

    #[test]
    fn test_unknown_object() {
        let (_, compiler) = setup();
        let err = compiler.compile("ledger", &QueryAst::new()).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_having_must_reference_groups() {
        let (_, compiler) = setup();
        let good = Aggregation::new()
            .group_by("status")
            .measure(Measure::over(AggregateFunction::Sum, "total", "sum_total"))
            .having(FilterNode::gt("sum_total", 100));
        compiler
            .compile("invoice", &QueryAst::new().with_aggregation(good))
            .unwrap();

        let bad = Aggregation::new()
            .group_by("status")
            .measure(Measure::count("n"))
            .having(FilterNode::gt("total", 100));
        let err = compiler
            .compile("invoice", &QueryAst::new().with_aggregation(bad))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)));
    }

    #[test]
    fn test_depth_limit() {
        let (registry, _) = setup();
        let compiler = QueryCompiler::new(registry, 4).with_max_filter_depth(2);
        let deep = FilterNode::not(FilterNode::not(FilterNode::not(a())));
        let err = compiler
            .compile("invoice", &QueryAst::new().with_filter(deep))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)));
    }

    #[test]
    fn test_schema_change_invalidates() {
        let (registry, compiler) = setup();
        let ast = QueryAst::new().with_filter(a());
        compiler.compile("invoice", &ast).unwrap();
        assert_eq!(compiler.cache().len(), 1);

        registry
            .register(
                ObjectDef::new("invoice", "crm")
                    .with_field(FieldDef::optional("region", FieldType::Text)),
            )
            .unwrap();
        assert!(compiler.cache().is_empty());

        compiler.compile("invoice", &ast).unwrap();
        assert_eq!(compiler.build_count(), 2);
    }

    #[test]
    fn test_concurrent_misses_coalesce() {
        let (_, compiler) = setup();
        let barrier = Arc::new(Barrier::new(8));
        let ast = QueryAst::new().with_filter(FilterNode::and(vec![a(), b()]));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let compiler = compiler.clone();
                let barrier = barrier.clone();
                let ast = ast.clone();
                thread::spawn(move || {
                    barrier.wait();
                    compiler.compile("invoice", &ast).unwrap()
                })
            })
            .collect();

        let plans: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(plans.iter().all(|p| p.key == plans[0].key));
        // a thread that arrives after the build finished hits the cache
        assert_eq!(compiler.build_count(), 1);
    }
}
