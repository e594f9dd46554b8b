//! Hook dispatch.
//!
//! Registrations are expanded into one dispatch list per concrete (event,
//! object) pair when they are added, so running hooks is a single map lookup.
//! Registrations are kept so that wildcard patterns can be expanded again
//! whenever an object is added.
//!
//! A dispatch list is grouped into priority tiers, lowest first. Handlers in a
//! tier run concurrently; a `Stop` from any handler skips every handler that
//! has not started yet.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use super::event::{HookEvent, HookPhase};
use super::handler::{HookContext, HookError, HookFlow, HookRegistration};
use crate::catalog::{CatalogChange, Registry, RegistryObserver};
use crate::error::{Error, Result};
use crate::security::{AuditEvent, AuditLogger, TracingAuditLogger};

#[derive(Debug, Clone)]
struct Tier {
    priority: i32,
    hooks: Vec<Arc<HookRegistration>>,
}

/// Handlers for one (event, object) pair, grouped by priority.
#[derive(Debug, Clone, Default)]
struct DispatchList {
    tiers: Vec<Tier>,
}

impl DispatchList {
    fn insert(&mut self, hook: Arc<HookRegistration>) -> bool {
        if self.tiers.iter().any(|t| t.hooks.iter().any(|h| h.name == hook.name)) {
            return false;
        }
        let pos = self.tiers.partition_point(|t| t.priority < hook.priority);
        match self.tiers.get_mut(pos) {
            Some(tier) if tier.priority == hook.priority => {
                let at = tier.hooks.partition_point(|h| h.name < hook.name);
                tier.hooks.insert(at, hook);
            }
            _ => self.tiers.insert(
                pos,
                Tier {
                    priority: hook.priority,
                    hooks: vec![hook],
                },
            ),
        }
        true
    }

    fn remove(&mut self, name: &str) {
        for tier in &mut self.tiers {
            tier.hooks.retain(|h| h.name != name);
        }
        self.tiers.retain(|t| !t.hooks.is_empty());
    }

    fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

type ListKey = (HookEvent, String);

#[derive(Default)]
struct Dispatch {
    lists: HashMap<ListKey, Arc<DispatchList>>,
    hooks: Vec<Arc<HookRegistration>>,
    objects: BTreeSet<String>,
    placements: HashMap<String, Vec<ListKey>>,
}

impl Dispatch {
    fn place(&mut self, hook: &Arc<HookRegistration>, object: &str) {
        for event in hook.event.expand() {
            let key = (event, object.to_string());
            let list = self.lists.entry(key.clone()).or_default();
            if Arc::make_mut(list).insert(hook.clone()) {
                self.placements.entry(hook.name.clone()).or_default().push(key);
            }
        }
    }

    fn add(&mut self, hook: Arc<HookRegistration>) {
        if hook.object.is_wildcard() {
            let targets: Vec<String> = self
                .objects
                .iter()
                .filter(|o| hook.object.matches(o))
                .cloned()
                .collect();
            for object in targets {
                self.place(&hook, &object);
            }
        } else {
            // exact hooks are placed even before their object exists
            let object = hook.object.to_string();
            self.place(&hook, &object);
        }
        self.hooks.push(hook);
    }

    fn remove(&mut self, name: &str) {
        self.hooks.retain(|h| h.name != name);
        for key in self.placements.remove(name).unwrap_or_default() {
            if let Some(list) = self.lists.get_mut(&key) {
                Arc::make_mut(list).remove(name);
                if list.is_empty() {
                    self.lists.remove(&key);
                }
            }
        }
    }

    fn object_added(&mut self, object: &str) {
        if !self.objects.insert(object.to_string()) {
            return;
        }
        let matching: Vec<Arc<HookRegistration>> = self
            .hooks
            .iter()
            .filter(|h| h.object.matches(object))
            .cloned()
            .collect();
        for hook in matching {
            self.place(&hook, object);
        }
    }

    fn object_removed(&mut self, object: &str) {
        self.objects.remove(object);
        self.lists.retain(|(_, o), _| o != object);
        for keys in self.placements.values_mut() {
            keys.retain(|(_, o)| o != object);
        }
        self.placements.retain(|_, keys| !keys.is_empty());
    }
}

/// A handler that did not complete successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookFailure {
    /// Hook name.
    pub hook: String,
    /// What went wrong.
    pub error: HookError,
}

/// What happened during one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookReport {
    /// Hooks that ran, in start order.
    pub ran: Vec<String>,
    /// Hooks skipped because an earlier handler stopped the pipeline.
    pub skipped: Vec<String>,
    /// Failed hooks.
    pub failures: Vec<HookFailure>,
    /// Whether a handler returned `Stop`.
    pub stopped: bool,
}

enum Run {
    Done(std::result::Result<HookFlow, HookError>),
    Skipped,
}

/// Runs lifecycle hooks.
pub struct HookPipeline {
    dispatch: RwLock<Dispatch>,
    audit: Arc<dyn AuditLogger>,
}

impl HookPipeline {
    /// Create an empty pipeline that reports failures through tracing.
    pub fn new() -> Self {
        Self::with_audit(Arc::new(TracingAuditLogger))
    }

    /// Create an empty pipeline with an audit sink.
    pub fn with_audit(audit: Arc<dyn AuditLogger>) -> Self {
        Self {
            dispatch: RwLock::new(Dispatch::default()),
            audit,
        }
    }

    /// Load the objects and hooks already in `registry`.
    pub fn load(&self, registry: &Registry) {
        let mut dispatch = self.dispatch.write();
        for object in registry.object_names() {
            dispatch.object_added(&object);
        }
        for hook in registry.hooks() {
            dispatch.remove(&hook.name);
            dispatch.add(hook);
        }
    }

    /// Add a hook to every matching dispatch list.
    pub fn add(&self, hook: Arc<HookRegistration>) {
        debug!(hook = %hook.name, event = %hook.event, object = %hook.object, "hook added");
        self.dispatch.write().add(hook);
    }

    /// Remove a hook by name.
    pub fn remove(&self, name: &str) {
        self.dispatch.write().remove(name);
    }

    /// Expand stored wildcard registrations for a new object.
    pub fn object_added(&self, object: &str) {
        self.dispatch.write().object_added(object);
    }

    /// Drop the dispatch lists of a removed object.
    pub fn object_removed(&self, object: &str) {
        self.dispatch.write().object_removed(object);
    }

    /// Names of the hooks that fire for `event` on `object`, in tier order.
    pub fn hooks_for(&self, event: HookEvent, object: &str) -> Vec<(i32, String)> {
        self.list(event, object)
            .map(|list| {
                list.tiers
                    .iter()
                    .flat_map(|t| t.hooks.iter().map(move |h| (t.priority, h.name.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn list(&self, event: HookEvent, object: &str) -> Option<Arc<DispatchList>> {
        self.dispatch
            .read()
            .lists
            .get(&(event, object.to_string()))
            .cloned()
    }

    /// Run the hooks for `ctx.event` on `ctx.object`.
    ///
    /// A failing or panicking before-hook aborts with `OperationAborted`
    /// once its tier has finished. After-hook failures are logged and
    /// reported but never returned as errors.
    pub async fn run_hooks(&self, ctx: &HookContext) -> Result<HookReport> {
        let mut report = HookReport::default();
        let Some(list) = self.list(ctx.event, &ctx.object) else {
            return Ok(report);
        };

        let stop = AtomicBool::new(false);
        for tier in &list.tiers {
            if stop.load(Ordering::SeqCst) {
                report
                    .skipped
                    .extend(tier.hooks.iter().map(|h| h.name.clone()));
                continue;
            }

            let runs = tier.hooks.iter().map(|hook| {
                let stop = &stop;
                async move {
                    if stop.load(Ordering::SeqCst) {
                        return Run::Skipped;
                    }
                    let result = AssertUnwindSafe(hook.handler.handle(ctx))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| Err(HookError::Panicked(panic_message(&*panic))));
                    if result == Ok(HookFlow::Stop) {
                        stop.store(true, Ordering::SeqCst);
                    }
                    Run::Done(result)
                }
            });
            let outcomes = join_all(runs).await;

            for (hook, outcome) in tier.hooks.iter().zip(outcomes) {
                match outcome {
                    Run::Skipped => report.skipped.push(hook.name.clone()),
                    Run::Done(result) => {
                        report.ran.push(hook.name.clone());
                        match result {
                            Ok(HookFlow::Stop) => report.stopped = true,
                            Ok(HookFlow::Continue) => {}
                            Err(err) => {
                                self.record_failure(ctx, hook, &err);
                                report.failures.push(HookFailure {
                                    hook: hook.name.clone(),
                                    error: err,
                                });
                            }
                        }
                    }
                }
            }

            if ctx.event.phase == HookPhase::Before {
                if let Some(failure) = report.failures.first() {
                    return Err(Error::OperationAborted(format!(
                        "hook '{}' {}",
                        failure.hook, failure.error
                    )));
                }
            }
        }

        Ok(report)
    }

    fn record_failure(&self, ctx: &HookContext, hook: &HookRegistration, err: &HookError) {
        match ctx.event.phase {
            HookPhase::Before => warn!(
                hook = %hook.name,
                event = %ctx.event,
                object = %ctx.object,
                error = %err,
                "before-hook failed, aborting operation"
            ),
            HookPhase::After => error!(
                hook = %hook.name,
                event = %ctx.event,
                object = %ctx.object,
                error = %err,
                "after-hook failed"
            ),
        }
        self.audit.log(AuditEvent::hook_failed(
            &ctx.caller,
            hook.name.clone(),
            ctx.event.to_string(),
            err.to_string(),
        ));
    }
}

impl Default for HookPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryObserver for HookPipeline {
    fn on_change(&self, _registry: &Registry, change: &CatalogChange) {
        match change {
            CatalogChange::ObjectAdded(name) => self.object_added(name),
            CatalogChange::ObjectRemoved(name) => self.object_removed(name),
            CatalogChange::HookAdded(hook) => self.add(hook.clone()),
            CatalogChange::HookRemoved(hook) => self.remove(&hook.name),
            CatalogChange::ObjectChanged(_) | CatalogChange::RuleChanged { .. } => {}
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
