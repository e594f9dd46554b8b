//! Security-aware execution.
//!
//! Every request goes through the same steps: permission decision, fast
//! denial, row-filter merge, plan compilation, before-hooks, adapter
//! dispatch, field masking, after-hooks.

use std::sync::Arc;

use metagate_proto::{FilterNode, QueryAst, Record};
use tracing::{debug, error, instrument, warn};

use super::adapter::{AdapterOutput, AdapterRequest, BackendError, StorageAdapter};
use crate::catalog::{DenialMode, Handle, ObjectDef, Registry, Verb};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::hooks::{HookAction, HookContext, HookEvent, HookPipeline, HookRegistration};
use crate::query::{CompiledPlan, QueryCompiler, RowMatcher};
use crate::security::{
    row_predicates, Access, AuditEvent, AuditLogger, CallerContext, FieldMasker, FormulaBudget,
    FormulaEvaluator, NoFormulaEvaluator, PermissionCompiler, PermissionDecision,
    TracingAuditLogger,
};

/// Requested operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Return matching rows.
    Find,
    /// Count matching rows.
    Count,
    /// Group and aggregate matching rows.
    Aggregate,
    /// Insert a record.
    Create(Record),
    /// Apply changes to matching rows.
    Update(Record),
    /// Delete matching rows.
    Delete,
}

impl Operation {
    /// Verb checked against the caller's permissions.
    pub fn verb(&self) -> Verb {
        match self {
            Operation::Find | Operation::Count | Operation::Aggregate => Verb::Read,
            Operation::Create(_) => Verb::Create,
            Operation::Update(_) => Verb::Update,
            Operation::Delete => Verb::Delete,
        }
    }

    /// Hook action.
    pub fn action(&self) -> HookAction {
        match self {
            Operation::Find => HookAction::Find,
            Operation::Count => HookAction::Count,
            Operation::Aggregate => HookAction::Aggregate,
            Operation::Create(_) => HookAction::Create,
            Operation::Update(_) => HookAction::Update,
            Operation::Delete => HookAction::Delete,
        }
    }

    /// Write payload.
    pub fn payload(&self) -> Option<&Record> {
        match self {
            Operation::Create(data) | Operation::Update(data) => Some(data),
            _ => None,
        }
    }

    fn empty_outcome(&self) -> Outcome {
        match self {
            Operation::Count => Outcome::Count(0),
            Operation::Update(_) | Operation::Delete => Outcome::Affected(0),
            _ => Outcome::Rows(Vec::new()),
        }
    }
}

/// Result of an operation, masked for the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Rows from a find, or group rows from an aggregate.
    Rows(Vec<Record>),
    /// Row count.
    Count(u64),
    /// The created record.
    Created(Record),
    /// Rows updated or deleted.
    Affected(u64),
}

impl Outcome {
    /// Rows, if this outcome carries any.
    pub fn rows(&self) -> Option<&[Record]> {
        match self {
            Outcome::Rows(rows) => Some(rows),
            _ => None,
        }
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    registry: Arc<Registry>,
    adapter: Arc<dyn StorageAdapter>,
    formulas: Arc<dyn FormulaEvaluator>,
    audit: Arc<dyn AuditLogger>,
    config: EngineConfig,
}

impl EngineBuilder {
    /// Set the configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the formula evaluator (the default fails every formula).
    pub fn formula_evaluator(mut self, formulas: Arc<dyn FormulaEvaluator>) -> Self {
        self.formulas = formulas;
        self
    }

    /// Set the audit sink (the default logs through tracing).
    pub fn audit_logger(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Build the engine and subscribe its caches to the registry.
    pub fn build(self) -> Engine {
        let permissions = Arc::new(
            PermissionCompiler::new(self.registry.clone(), self.formulas.clone())
                .with_default_owner_field(self.config.default_owner_field.clone()),
        );
        let queries = Arc::new(
            QueryCompiler::new(self.registry.clone(), self.config.plan_cache_capacity)
                .with_max_filter_depth(self.config.max_filter_depth),
        );
        let hooks = Arc::new(HookPipeline::with_audit(self.audit.clone()));
        hooks.load(&self.registry);

        self.registry.subscribe(permissions.clone());
        self.registry.subscribe(queries.clone());
        self.registry.subscribe(hooks.clone());

        Engine {
            registry: self.registry,
            permissions,
            queries,
            hooks,
            adapter: self.adapter,
            formulas: self.formulas,
            audit: self.audit,
            config: self.config,
        }
    }
}

/// The data-access engine.
pub struct Engine {
    registry: Arc<Registry>,
    permissions: Arc<PermissionCompiler>,
    queries: Arc<QueryCompiler>,
    hooks: Arc<HookPipeline>,
    adapter: Arc<dyn StorageAdapter>,
    formulas: Arc<dyn FormulaEvaluator>,
    audit: Arc<dyn AuditLogger>,
    config: EngineConfig,
}

impl Engine {
    /// Start building an engine over `registry` and `adapter`.
    pub fn builder(registry: Arc<Registry>, adapter: Arc<dyn StorageAdapter>) -> EngineBuilder {
        EngineBuilder {
            registry,
            adapter,
            formulas: Arc::new(NoFormulaEvaluator),
            audit: Arc::new(TracingAuditLogger),
            config: EngineConfig::default(),
        }
    }

    /// Register a hook.
    pub fn register_hook(&self, hook: HookRegistration) -> Result<Handle> {
        self.registry.register(hook)
    }

    /// Execute `operation` on `object` as `role`.
    ///
    /// Denials, formula faults and unknown objects are returned as distinct
    /// errors; use [`Error::external`] before reporting them to an untrusted
    /// caller.
    #[instrument(skip(self, operation, ast, caller), fields(action = ?operation.action()))]
    pub async fn execute(
        &self,
        role: &str,
        object: &str,
        operation: Operation,
        ast: QueryAst,
        caller: &CallerContext,
    ) -> Result<Outcome> {
        caller.check_cancelled()?;

        let def = self.registry.object(object)?;
        let verb = operation.verb();
        let decision = self.permissions.get_decision(role, object)?;

        if let Some(fault) = &decision.fault {
            self.audit
                .log(AuditEvent::formula_fault(caller, object, fault.clone()));
        }

        if decision.access(verb) == Access::Denied {
            let reason = format!("{} may not {} {}", role, verb, object);
            warn!(role, object, %verb, "access denied");
            self.audit
                .log(AuditEvent::access_denied(caller, object, verb, reason.clone()));
            if verb == Verb::Read && decision.denial_mode == DenialMode::Hide {
                return Ok(operation.empty_outcome());
            }
            return Err(Error::PermissionDenied(reason));
        }

        self.check_references(&operation, &ast, &decision, caller)?;

        let ast = match &operation {
            Operation::Create(data) => {
                self.check_write_scope(&def, data, &decision, verb, caller)?;
                ast
            }
            Operation::Update(data) => {
                self.check_write_scope(&def, data, &decision, verb, caller)?;
                self.secure(ast, &decision, verb, caller)?
            }
            _ => self.secure(ast, &decision, verb, caller)?,
        };

        let plan = self.queries.compile(object, &ast)?;
        debug!(object, key = ?plan.key, hints = plan.index_hints.len(), "plan ready");

        let mut ctx = HookContext::new(
            HookEvent::before(operation.action()),
            object,
            caller.clone(),
            plan.ast.clone(),
        )
        .with_input(operation.payload().cloned());
        self.hooks.run_hooks(&ctx).await?;

        caller.check_cancelled()?;

        let output = self.dispatch(&plan, &operation, caller).await;
        let output = output.map_err(|e| Error::Backend(e.genericize(&decision.fields)))?;
        let outcome = self.finish(&operation, output, &decision, caller)?;

        ctx.event = HookEvent::after(operation.action());
        ctx.outcome = Some(outcome.clone());
        if let Err(err) = self.hooks.run_hooks(&ctx).await {
            error!(object, error = %err, "after-hooks failed");
        }

        Ok(outcome)
    }

    fn check_references(
        &self,
        operation: &Operation,
        ast: &QueryAst,
        decision: &PermissionDecision,
        caller: &CallerContext,
    ) -> Result<()> {
        // aggregates always check, group rows cannot be masked afterwards
        let check_ast = self.config.deny_hidden_field_references
            || matches!(operation, Operation::Aggregate);

        let mut result = if check_ast {
            self.permissions.check_field_references(ast, decision)
        } else {
            Ok(())
        };
        if result.is_ok() {
            if let Some(data) = operation.payload() {
                result = self.permissions.check_write_fields(data, decision);
            }
        }

        if let Err(err) = &result {
            warn!(role = %decision.role, object = %decision.object, error = %err, "hidden field reference refused");
            self.audit.log(AuditEvent::access_denied(
                caller,
                decision.object.clone(),
                operation.verb(),
                err.to_string(),
            ));
        }
        result
    }

    fn secure(
        &self,
        ast: QueryAst,
        decision: &PermissionDecision,
        verb: Verb,
        caller: &CallerContext,
    ) -> Result<QueryAst> {
        match self.permissions.apply_row_filter(ast, decision, verb, caller) {
            Ok(ast) => {
                let predicates = decision.row_filter_count(verb);
                if predicates > 0 {
                    self.audit.log(AuditEvent::rls_applied(
                        caller,
                        decision.object.clone(),
                        predicates,
                    ));
                }
                Ok(ast)
            }
            Err(err) => {
                if let Error::FormulaEvaluation(fault) = &err {
                    warn!(object = %decision.object, error = %fault, "row filter could not be bound");
                    self.audit.log(AuditEvent::formula_fault(
                        caller,
                        decision.object.clone(),
                        fault.to_string(),
                    ));
                }
                Err(err)
            }
        }
    }

    /// Written values must fall inside the caller's own row filter.
    ///
    /// A created record is checked against every predicate. An update is
    /// checked only against predicates over fields it assigns, and must assign
    /// every field such a predicate reads; untouched fields keep values that
    /// already passed the bound update filter.
    fn check_write_scope(
        &self,
        def: &ObjectDef,
        data: &Record,
        decision: &PermissionDecision,
        verb: Verb,
        caller: &CallerContext,
    ) -> Result<()> {
        let mut predicates = row_predicates(decision, verb, caller).map_err(|fault| {
            self.audit
                .log(AuditEvent::formula_fault(caller, def.name.clone(), fault.to_string()));
            Error::FormulaEvaluation(fault)
        })?;
        if verb == Verb::Update {
            predicates.retain(|p| p.fields().iter().any(|f| data.contains_key(f)));
        }
        if predicates.is_empty() {
            return Ok(());
        }

        let filter = FilterNode::and(predicates);
        let partial = verb == Verb::Update && filter.fields().iter().any(|f| !data.contains_key(f));
        let inside = if partial {
            Ok(false)
        } else {
            self.matcher(caller).try_matches(&filter, data)
        };
        match inside {
            Ok(true) => Ok(()),
            Ok(false) => {
                let reason = format!(
                    "{} may not {} {} outside its row filter",
                    decision.role, verb, def.name
                );
                self.audit.log(AuditEvent::access_denied(
                    caller,
                    def.name.clone(),
                    verb,
                    reason.clone(),
                ));
                Err(Error::PermissionDenied(reason))
            }
            Err(fault) => {
                self.audit
                    .log(AuditEvent::formula_fault(caller, def.name.clone(), fault.to_string()));
                Err(Error::FormulaEvaluation(fault))
            }
        }
    }

    fn matcher<'a>(&'a self, caller: &'a CallerContext) -> RowMatcher<'a> {
        RowMatcher::new(
            self.formulas.as_ref(),
            caller,
            FormulaBudget::new(self.config.formula_budget()),
        )
    }

    async fn dispatch(
        &self,
        plan: &CompiledPlan,
        operation: &Operation,
        caller: &CallerContext,
    ) -> std::result::Result<AdapterOutput, BackendError> {
        let request = AdapterRequest {
            operation,
            caller,
            matcher: self.matcher(caller),
        };
        self.adapter.execute(plan, &request).await
    }

    fn finish(
        &self,
        operation: &Operation,
        output: AdapterOutput,
        decision: &PermissionDecision,
        caller: &CallerContext,
    ) -> Result<Outcome> {
        let outcome = match (operation, output) {
            (Operation::Find, AdapterOutput::Rows(rows)) => {
                Outcome::Rows(self.mask(rows, decision, caller))
            }
            (Operation::Aggregate, AdapterOutput::Rows(rows)) => Outcome::Rows(rows),
            (Operation::Count, AdapterOutput::Count(count)) => Outcome::Count(count),
            (Operation::Create(_), AdapterOutput::Created(record)) => {
                let mut rows = self.mask(vec![record], decision, caller);
                Outcome::Created(rows.pop().unwrap_or_default())
            }
            (Operation::Update(_) | Operation::Delete, AdapterOutput::Affected { count }) => {
                Outcome::Affected(count)
            }
            (operation, output) => {
                return Err(Error::Backend(BackendError::other(format!(
                    "adapter returned {} for {:?}",
                    output_kind(&output),
                    operation.action()
                ))))
            }
        };
        Ok(outcome)
    }

    fn mask(&self, rows: Vec<Record>, decision: &PermissionDecision, caller: &CallerContext) -> Vec<Record> {
        let mut masked: Vec<String> = rows
            .iter()
            .flat_map(|r| FieldMasker::masked_fields(r, &decision.fields))
            .collect();
        if !masked.is_empty() {
            masked.sort();
            masked.dedup();
            self.audit.log(AuditEvent::fields_masked(
                caller,
                decision.object.clone(),
                masked,
            ));
        }
        self.permissions.mask_fields(rows, decision)
    }

    /// The registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The permission compiler.
    pub fn permissions(&self) -> &PermissionCompiler {
        &self.permissions
    }

    /// The query compiler.
    pub fn queries(&self) -> &QueryCompiler {
        &self.queries
    }

    /// The hook pipeline.
    pub fn hooks(&self) -> &HookPipeline {
        &self.hooks
    }

    /// The configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

fn output_kind(output: &AdapterOutput) -> &'static str {
    match output {
        AdapterOutput::Rows(_) => "rows",
        AdapterOutput::Count(_) => "count",
        AdapterOutput::Created(_) => "created",
        AdapterOutput::Affected { .. } => "affected",
    }
}
