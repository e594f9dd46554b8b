//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use metagate_core::catalog::{
    FieldDef, FieldType, IndexDef, MaskingStrategy, ObjectDef, PermissionRule, Registry,
    RowCondition, Verb, VerbSet,
};
use metagate_core::engine::{AdapterOutput, AdapterRequest, BackendError, Operation, StorageAdapter};
use metagate_core::query::FilterEvaluator;
use metagate_core::security::{FormulaEvaluator, MemoryAuditLogger, NoFormulaEvaluator};
use metagate_core::{CompiledPlan, Engine, EngineConfig};
use metagate_proto::{AggregateFunction, Pagination, Record, SortDirection, Value};
use parking_lot::Mutex;

/// Surface engine logs with `RUST_LOG=metagate_core=debug`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Build a record from name/value pairs.
pub fn record(fields: Vec<(&str, Value)>) -> Record {
    fields.into_iter().map(|(n, v)| (n.to_string(), v)).collect()
}

/// In-memory storage adapter that evaluates plans with the request's row
/// matcher.
#[derive(Default)]
pub struct MemoryAdapter {
    tables: Mutex<HashMap<String, Vec<Record>>>,
    plans: Mutex<Vec<Arc<CompiledPlan>>>,
    failure: Mutex<Option<BackendError>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, object: &str, row: Record) {
        self.tables.lock().entry(object.to_string()).or_default().push(row);
    }

    pub fn rows(&self, object: &str) -> Vec<Record> {
        self.tables.lock().get(object).cloned().unwrap_or_default()
    }

    /// Plans dispatched so far.
    pub fn plans(&self) -> Vec<Arc<CompiledPlan>> {
        self.plans.lock().clone()
    }

    pub fn dispatched(&self) -> usize {
        self.plans.lock().len()
    }

    /// Fail the next dispatch with `err`.
    pub fn fail_next(&self, err: BackendError) {
        *self.failure.lock() = Some(err);
    }
}

fn sort_rows(rows: &mut [Record], plan: &CompiledPlan) {
    rows.sort_by(|a, b| {
        for key in &plan.ast.sort {
            let ordering = match (a.get(&key.field), b.get(&key.field)) {
                (Some(x), Some(y)) => x.compare(y).unwrap_or(std::cmp::Ordering::Equal),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            };
            let ordering = match key.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            if ordering.is_ne() {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });
}

fn paginate(rows: Vec<Record>, plan: &CompiledPlan) -> Vec<Record> {
    match &plan.ast.pagination {
        Some(Pagination::Offset { offset, limit }) => rows
            .into_iter()
            .skip(*offset as usize)
            .take(limit.map_or(usize::MAX, |l| l as usize))
            .collect(),
        Some(Pagination::Cursor { limit, .. }) => rows.into_iter().take(*limit as usize).collect(),
        None => rows,
    }
}

fn aggregate(rows: &[Record], plan: &CompiledPlan) -> Vec<Record> {
    let Some(aggregation) = &plan.ast.aggregation else {
        return Vec::new();
    };

    let mut groups: BTreeMap<String, (Record, Vec<&Record>)> = BTreeMap::new();
    for row in rows {
        let key_values: Record = aggregation
            .group_by
            .iter()
            .map(|k| (k.clone(), row.get(k).cloned().unwrap_or(Value::Null)))
            .collect();
        let key = format!("{:?}", key_values);
        groups.entry(key).or_insert_with(|| (key_values, Vec::new())).1.push(row);
    }

    groups
        .into_values()
        .map(|(mut out, members)| {
            for measure in &aggregation.measures {
                let values: Vec<f64> = measure
                    .field
                    .as_ref()
                    .map(|f| members.iter().filter_map(|r| r.get(f).and_then(Value::as_f64)).collect())
                    .unwrap_or_default();
                let value = match measure.function {
                    AggregateFunction::Count => Value::Int64(members.len() as i64),
                    AggregateFunction::Sum => Value::Float64(values.iter().sum()),
                    AggregateFunction::Avg if values.is_empty() => Value::Null,
                    AggregateFunction::Avg => Value::Float64(values.iter().sum::<f64>() / values.len() as f64),
                    AggregateFunction::Min => values.iter().copied().reduce(f64::min).map_or(Value::Null, Value::Float64),
                    AggregateFunction::Max => values.iter().copied().reduce(f64::max).map_or(Value::Null, Value::Float64),
                };
                out.insert(measure.alias.clone(), value);
            }
            out
        })
        .filter(|row| {
            aggregation
                .having
                .as_ref()
                .map_or(true, |h| FilterEvaluator::evaluate(h, row, None).unwrap_or(false))
        })
        .collect()
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn execute(
        &self,
        plan: &CompiledPlan,
        request: &AdapterRequest<'_>,
    ) -> Result<AdapterOutput, BackendError> {
        self.plans.lock().push(Arc::new(plan.clone()));
        if let Some(err) = self.failure.lock().take() {
            return Err(err);
        }

        let mut tables = self.tables.lock();
        let table = tables.entry(plan.object.clone()).or_default();
        let filter = plan.filter();

        Ok(match request.operation {
            Operation::Find => {
                let mut rows: Vec<Record> = table
                    .iter()
                    .filter(|r| request.matcher.matches(filter, r))
                    .cloned()
                    .collect();
                sort_rows(&mut rows, plan);
                let mut rows = paginate(rows, plan);
                if let Some(projection) = &plan.ast.projection {
                    for row in &mut rows {
                        row.retain(|k, _| projection.contains(k));
                    }
                }
                AdapterOutput::Rows(rows)
            }
            Operation::Count => AdapterOutput::Count(
                table.iter().filter(|r| request.matcher.matches(filter, r)).count() as u64,
            ),
            Operation::Aggregate => {
                let rows: Vec<Record> = table
                    .iter()
                    .filter(|r| request.matcher.matches(filter, r))
                    .cloned()
                    .collect();
                AdapterOutput::Rows(aggregate(&rows, plan))
            }
            Operation::Create(data) => {
                table.push(data.clone());
                AdapterOutput::Created(data.clone())
            }
            Operation::Update(changes) => {
                let mut count = 0;
                for row in table.iter_mut().filter(|r| request.matcher.matches(filter, r)) {
                    row.extend(changes.clone());
                    count += 1;
                }
                AdapterOutput::Affected { count }
            }
            Operation::Delete => {
                let before = table.len();
                table.retain(|r| !request.matcher.matches(filter, r));
                AdapterOutput::Affected {
                    count: (before - table.len()) as u64,
                }
            }
        })
    }
}

/// Engine over the invoice schema used across the integration tests.
///
/// - `viewer` may read invoices, only its own, and never sees `total`
/// - `clerk` may read every invoice and create its own
/// - `admin` may do anything
pub struct TestContext {
    pub registry: Arc<Registry>,
    pub adapter: Arc<MemoryAdapter>,
    pub audit: Arc<MemoryAuditLogger>,
    pub engine: Engine,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::build(config, Arc::new(NoFormulaEvaluator))
    }

    pub fn with_formulas(formulas: Arc<dyn FormulaEvaluator>) -> Self {
        Self::build(EngineConfig::default(), formulas)
    }

    fn build(config: EngineConfig, formulas: Arc<dyn FormulaEvaluator>) -> Self {
        init_tracing();
        let registry = Arc::new(Registry::new());
        install_billing(&registry);

        let adapter = Arc::new(MemoryAdapter::new());
        for (id, owner, status, total) in [
            ("i-1", "U1", "open", 120.0),
            ("i-2", "U1", "paid", 80.0),
            ("i-3", "U2", "open", 300.0),
            ("i-4", "U3", "void", 10.0),
        ] {
            adapter.insert(
                "invoice",
                record(vec![
                    ("id", id.into()),
                    ("owner_id", owner.into()),
                    ("status", status.into()),
                    ("total", total.into()),
                ]),
            );
        }

        let audit = Arc::new(MemoryAuditLogger::new());
        let engine = Engine::builder(registry.clone(), adapter.clone())
            .config(config)
            .formula_evaluator(formulas)
            .audit_logger(audit.clone())
            .build();

        Self {
            registry,
            adapter,
            audit,
            engine,
        }
    }
}

pub fn invoice_def() -> ObjectDef {
    ObjectDef::new("invoice", "billing")
        .with_field(FieldDef::new("id", FieldType::Uuid))
        .with_field(FieldDef::new("owner_id", FieldType::Text))
        .with_field(FieldDef::new("status", FieldType::Text))
        .with_field(FieldDef::new("total", FieldType::Float))
        .with_index(IndexDef::unique("pk", vec!["id".into()]))
        .with_index(IndexDef::new("by_owner", vec!["owner_id".into()]))
        .extensible()
}

pub fn install_billing(registry: &Registry) {
    registry.register(invoice_def()).unwrap();
    for rule in [
        PermissionRule::allow("viewer-read", "billing", "viewer", "invoice", VerbSet::from(Verb::Read)),
        PermissionRule::row_filter(
            "viewer-own",
            "billing",
            "viewer",
            "invoice",
            RowCondition::owned_by_caller("owner_id"),
        ),
        PermissionRule::hide_field(
            "viewer-no-total",
            "billing",
            "viewer",
            "invoice",
            "total",
            MaskingStrategy::Omit,
        ),
        PermissionRule::allow(
            "clerk-read-create",
            "billing",
            "clerk",
            "invoice",
            VerbSet::of(&[Verb::Read, Verb::Create]),
        ),
        PermissionRule::row_filter(
            "clerk-creates-own",
            "billing",
            "clerk",
            "invoice",
            RowCondition::owned_by_caller("owner_id"),
        )
        .for_verbs(VerbSet::from(Verb::Create)),
        PermissionRule::allow("admin-all", "billing", "admin", "*", VerbSet::all()),
    ] {
        registry.register(rule).unwrap();
    }
}
