//! Permission compilation.
//!
//! Rules are compiled per (role, object) into a [`PermissionDecision`] the
//! first time the pair is seen and then served from a concurrent cache until
//! a rule or schema change invalidates it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use metagate_proto::{QueryAst, Record};
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::context::CallerContext;
use super::decision::{Access, PermissionDecision, RowPredicate};
use super::field_security::FieldMasker;
use super::formula::{FormulaError, FormulaEvaluator};
use super::rls::row_predicates;
use crate::catalog::{
    CatalogChange, Effect, MaskingStrategy, ObjectDef, PermissionRule, Registry,
    RegistryObserver, RoleSelector, RowCondition, RuleKind, Verb, VerbSet,
};
use crate::config::DEFAULT_OWNER_FIELD;
use crate::error::{Error, Result};
use crate::query::CacheStats;
use crate::singleflight::SingleFlight;

type DecisionKey = (String, String);

/// Compiles permission rules into cached decisions.
pub struct PermissionCompiler {
    registry: Arc<Registry>,
    cache: DashMap<DecisionKey, Arc<PermissionDecision>>,
    inflight: SingleFlight<DecisionKey, Arc<PermissionDecision>>,
    epoch: RwLock<u64>,
    stats: CacheStats,
    builds: AtomicU64,
    formulas: Arc<dyn FormulaEvaluator>,
    default_owner_field: String,
}

impl PermissionCompiler {
    /// Create a compiler. Formula rules are validated with `formulas`.
    pub fn new(registry: Arc<Registry>, formulas: Arc<dyn FormulaEvaluator>) -> Self {
        Self {
            registry,
            cache: DashMap::new(),
            inflight: SingleFlight::new(),
            epoch: RwLock::new(0),
            stats: CacheStats::default(),
            builds: AtomicU64::new(0),
            formulas,
            default_owner_field: DEFAULT_OWNER_FIELD.to_string(),
        }
    }

    /// Set the owner field used by objects that do not declare one.
    pub fn with_default_owner_field(mut self, field: impl Into<String>) -> Self {
        self.default_owner_field = field.into();
        self
    }

    /// Decision for `role` on `object`.
    ///
    /// Public objects get an unrestricted decision that is neither built from
    /// rules nor cached.
    pub fn get_decision(&self, role: &str, object: &str) -> Result<Arc<PermissionDecision>> {
        let key: DecisionKey = (role.to_string(), object.to_string());

        if let Some(decision) = self.cache.get(&key) {
            self.stats.record_hit();
            debug!(role, object, "decision cache hit");
            return Ok(decision.clone());
        }

        let def = self.registry.object(object)?;
        if def.public {
            let owner_field = self.owner_field(&def);
            return Ok(Arc::new(PermissionDecision::unrestricted(role, &def, owner_field)));
        }

        self.stats.record_miss();
        debug!(role, object, "decision cache miss");

        self.inflight.run(&key, || {
            if let Some(decision) = self.cache.get(&key) {
                return Ok(decision.clone());
            }

            let epoch = *self.epoch.read();
            let def = self.registry.object(object)?;
            let rules = self.registry.rules_for_object(object);
            let decision = Arc::new(self.build(role, &def, &rules));
            self.builds.fetch_add(1, Ordering::Relaxed);

            // invalidate holds the write side while clearing, so a decision
            // built from stale rules is never visible to later readers
            let current = self.epoch.read();
            if *current == epoch {
                self.cache.insert(key.clone(), decision.clone());
            } else {
                debug!(role, object, "decision built from stale rules, not cached");
            }
            drop(current);
            Ok(decision)
        })
    }

    fn owner_field(&self, def: &ObjectDef) -> String {
        def.owner_field
            .clone()
            .unwrap_or_else(|| self.default_owner_field.clone())
    }

    fn build(&self, role: &str, def: &ObjectDef, rules: &[Arc<PermissionRule>]) -> PermissionDecision {
        let owner_field = self.owner_field(def);
        let mut decision = PermissionDecision::deny_all(role, def.name.clone(), owner_field);
        decision.denial_mode = def.denial_mode;

        let mut allow = VerbSet::empty();
        let mut deny = VerbSet::empty();
        let mut owner_allow = VerbSet::empty();
        let mut owner_deny = VerbSet::empty();
        let mut shown: BTreeSet<String> = BTreeSet::new();
        let mut allowlist = false;
        let mut hidden: BTreeMap<String, MaskingStrategy> = BTreeMap::new();

        for rule in rules.iter().filter(|r| r.role.applies_to(role)) {
            decision.rules.push(rule.name.clone());

            match &rule.kind {
                RuleKind::Crud { effect, verbs } => match (&rule.role, effect) {
                    (RoleSelector::Owner, Effect::Allow) => owner_allow = owner_allow.union(*verbs),
                    (RoleSelector::Owner, Effect::Deny) => owner_deny = owner_deny.union(*verbs),
                    (_, Effect::Allow) => allow = allow.union(*verbs),
                    (_, Effect::Deny) => deny = deny.union(*verbs),
                },
                RuleKind::FieldAccess { effect, masking } => {
                    let Some(field) = rule.field.as_deref() else {
                        continue;
                    };
                    if !def.has_field(field) {
                        debug!(rule = %rule.name, field, object = %def.name, "field rule names unknown field");
                        continue;
                    }
                    match effect {
                        Effect::Allow => {
                            allowlist = true;
                            shown.insert(field.to_string());
                        }
                        Effect::Deny => {
                            let stronger = hidden
                                .get(field)
                                .map_or(true, |current| masking.strength() > current.strength());
                            if stronger {
                                hidden.insert(field.to_string(), masking.clone());
                            }
                        }
                    }
                }
                RuleKind::RowFilter {
                    condition,
                    verbs,
                    mode,
                } => {
                    if let Err(reason) = self.check_row_condition(def, condition) {
                        warn!(
                            rule = %rule.name,
                            role,
                            object = %def.name,
                            %reason,
                            "row filter cannot be compiled, denying all access"
                        );
                        let mut denied =
                            PermissionDecision::deny_all(role, def.name.clone(), decision.owner_field);
                        denied.denial_mode = def.denial_mode;
                        denied.rules = vec![rule.name.clone()];
                        denied.fault = Some(format!("rule '{}': {}", rule.name, reason));
                        return denied;
                    }
                    decision.row_filters.push(RowPredicate {
                        rule: rule.name.clone(),
                        condition: condition.clone(),
                        verbs: *verbs,
                        mode: *mode,
                    });
                }
            }
        }

        // deny wins over allow
        decision.verbs = allow.difference(deny);
        decision.owner_verbs = owner_allow
            .difference(deny)
            .difference(owner_deny)
            .difference(decision.verbs);

        for name in def.field_names() {
            let explicitly_hidden = hidden.remove(name);
            let excluded = allowlist && !shown.contains(name);
            match explicitly_hidden {
                Some(masking) => {
                    decision.fields.hidden.insert(name.to_string(), masking);
                }
                None if excluded => {
                    decision
                        .fields
                        .hidden
                        .insert(name.to_string(), MaskingStrategy::Omit);
                }
                None => {
                    decision.fields.visible.insert(name.to_string());
                }
            }
        }

        decision
    }

    fn check_row_condition(&self, def: &ObjectDef, condition: &RowCondition) -> std::result::Result<(), String> {
        condition.validate().map_err(|e| e.to_string())?;
        check_condition_fields(def, condition)?;
        for expression in condition.formulas() {
            self.formulas
                .validate(expression)
                .map_err(|e: FormulaError| e.to_string())?;
        }
        Ok(())
    }

    /// AND the caller's row predicates for `verb` into the root of `ast`.
    ///
    /// Placeholders are substituted from `caller`; a placeholder without a
    /// value refuses the request.
    pub fn apply_row_filter(
        &self,
        ast: QueryAst,
        decision: &PermissionDecision,
        verb: Verb,
        caller: &CallerContext,
    ) -> Result<QueryAst> {
        if decision.access(verb) == Access::Denied {
            return Err(denied(decision, verb));
        }

        let predicates = row_predicates(decision, verb, caller)?;
        Ok(predicates
            .into_iter()
            .fold(ast, |ast, predicate| ast.and_filter(predicate)))
    }

    /// Mask every row according to the decision's field visibility.
    pub fn mask_fields(&self, rows: Vec<Record>, decision: &PermissionDecision) -> Vec<Record> {
        rows.into_iter()
            .map(|row| FieldMasker::mask_record(row, &decision.fields))
            .collect()
    }

    /// Refuse queries that filter, sort, group or project on hidden fields.
    ///
    /// A formula leaf may read any field, so caller formulas are refused
    /// whenever the role has hidden fields on the object.
    pub fn check_field_references(&self, ast: &QueryAst, decision: &PermissionDecision) -> Result<()> {
        if ast.has_formula() && !decision.fields.hidden.is_empty() {
            return Err(Error::PermissionDenied(format!(
                "{} may not filter {} with formulas while fields are hidden",
                decision.role, decision.object
            )));
        }

        let fields = ast.referenced_fields();
        let hidden = decision.fields.hidden_among(fields.iter().map(String::as_str));
        if hidden.is_empty() {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "{} may not reference hidden fields {:?} on {}",
                decision.role, hidden, decision.object
            )))
        }
    }

    /// Refuse write payloads that touch hidden fields.
    pub fn check_write_fields(&self, data: &Record, decision: &PermissionDecision) -> Result<()> {
        let hidden = decision.fields.hidden_among(data.keys().map(String::as_str));
        if hidden.is_empty() {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "{} may not write hidden fields {:?} on {}",
                decision.role, hidden, decision.object
            )))
        }
    }

    /// Drop cached decisions for `object`; `*` drops every decision.
    pub fn invalidate(&self, object: &str) {
        let mut epoch = self.epoch.write();
        *epoch += 1;
        let before = self.cache.len();
        if object == "*" {
            self.cache.clear();
        } else {
            self.cache.retain(|(_, o), _| o != object);
        }
        self.inflight.forget_all();
        drop(epoch);
        let dropped = before.saturating_sub(self.cache.len());
        self.stats.record_invalidations(dropped);
        debug!(object, dropped, "invalidated decisions");
    }

    /// Number of decisions built from rules.
    pub fn build_count(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    /// Decision cache statistics.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Number of cached decisions.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

impl RegistryObserver for PermissionCompiler {
    fn on_change(&self, _registry: &Registry, change: &CatalogChange) {
        match change {
            CatalogChange::RuleChanged { object } => self.invalidate(object),
            CatalogChange::ObjectAdded(name)
            | CatalogChange::ObjectChanged(name)
            | CatalogChange::ObjectRemoved(name) => self.invalidate(name),
            CatalogChange::HookAdded(_) | CatalogChange::HookRemoved(_) => {}
        }
    }
}

fn check_condition_fields(def: &ObjectDef, condition: &RowCondition) -> std::result::Result<(), String> {
    match condition {
        RowCondition::Compare { field, .. } if !def.has_field(field) => {
            Err(format!("unknown field '{}' on '{}'", field, def.name))
        }
        RowCondition::All(children) | RowCondition::Any(children) => children
            .iter()
            .try_for_each(|c| check_condition_fields(def, c)),
        RowCondition::Not(child) => check_condition_fields(def, child),
        _ => Ok(()),
    }
}

fn denied(decision: &PermissionDecision, verb: Verb) -> Error {
    Error::PermissionDenied(format!(
        "{} may not {} {}",
        decision.role, verb, decision.object
    ))
}
