//! In-memory metadata registry.
//!
//! Objects, permission rules and hook registrations live in one arena. Side
//! indexes by kind/name, by owning module and by object keep lookups O(1) and
//! make uninstalling a module proportional to the module's own size.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::arena::{Arena, Handle};
use super::object::ObjectDef;
use super::rule::PermissionRule;
use crate::error::{Error, Result};
use crate::hooks::HookRegistration;

/// Kind of a registry item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemKind {
    /// Object definition.
    Object,
    /// Permission rule.
    Rule,
    /// Hook registration.
    Hook,
    /// Field of an object.
    Field,
    /// Module (package) tag.
    Module,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ItemKind::Object => "object",
            ItemKind::Rule => "rule",
            ItemKind::Hook => "hook",
            ItemKind::Field => "field",
            ItemKind::Module => "module",
        })
    }
}

/// An item owned by the registry.
#[derive(Debug, Clone)]
pub enum CatalogItem {
    /// Object definition.
    Object(Arc<ObjectDef>),
    /// Permission rule.
    Rule(Arc<PermissionRule>),
    /// Hook registration.
    Hook(Arc<HookRegistration>),
}

impl CatalogItem {
    /// Item kind.
    pub fn kind(&self) -> ItemKind {
        match self {
            CatalogItem::Object(_) => ItemKind::Object,
            CatalogItem::Rule(_) => ItemKind::Rule,
            CatalogItem::Hook(_) => ItemKind::Hook,
        }
    }

    /// Item name.
    pub fn name(&self) -> &str {
        match self {
            CatalogItem::Object(def) => &def.name,
            CatalogItem::Rule(rule) => &rule.name,
            CatalogItem::Hook(hook) => &hook.name,
        }
    }

    /// Owning module.
    pub fn module(&self) -> &str {
        match self {
            CatalogItem::Object(def) => &def.module,
            CatalogItem::Rule(rule) => &rule.module,
            CatalogItem::Hook(hook) => &hook.module,
        }
    }

    /// The object definition, if this is one.
    pub fn as_object(&self) -> Option<&Arc<ObjectDef>> {
        match self {
            CatalogItem::Object(def) => Some(def),
            _ => None,
        }
    }

    /// The rule, if this is one.
    pub fn as_rule(&self) -> Option<&Arc<PermissionRule>> {
        match self {
            CatalogItem::Rule(rule) => Some(rule),
            _ => None,
        }
    }

    /// The hook registration, if this is one.
    pub fn as_hook(&self) -> Option<&Arc<HookRegistration>> {
        match self {
            CatalogItem::Hook(hook) => Some(hook),
            _ => None,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            CatalogItem::Object(def) => def.validate(),
            CatalogItem::Rule(rule) => rule.validate(),
            CatalogItem::Hook(hook) => hook.validate(),
        }
    }
}

impl From<ObjectDef> for CatalogItem {
    fn from(def: ObjectDef) -> Self {
        CatalogItem::Object(Arc::new(def))
    }
}

impl From<PermissionRule> for CatalogItem {
    fn from(rule: PermissionRule) -> Self {
        CatalogItem::Rule(Arc::new(rule))
    }
}

impl From<HookRegistration> for CatalogItem {
    fn from(hook: HookRegistration) -> Self {
        CatalogItem::Hook(Arc::new(hook))
    }
}

/// A change applied to the registry.
#[derive(Debug, Clone)]
pub enum CatalogChange {
    /// A new object was registered.
    ObjectAdded(String),
    /// An object's fields changed (extension added or removed).
    ObjectChanged(String),
    /// An object was removed.
    ObjectRemoved(String),
    /// A rule targeting `object` (possibly `*`) was added or removed.
    RuleChanged {
        /// Target object selector.
        object: String,
    },
    /// A hook was registered.
    HookAdded(Arc<HookRegistration>),
    /// A hook was removed.
    HookRemoved(Arc<HookRegistration>),
}

/// Receives registry changes.
///
/// Observers run synchronously, before `register` / `unregister_package`
/// return, while the registry's admin lock is held. They may read the
/// registry but must not mutate it.
pub trait RegistryObserver: Send + Sync {
    /// Called once per change.
    fn on_change(&self, registry: &Registry, change: &CatalogChange);
}

/// Summary of an uninstalled module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageRemoval {
    /// Module name.
    pub module: String,
    /// Removed objects.
    pub objects: Vec<String>,
    /// Removed rules.
    pub rules: Vec<String>,
    /// Removed hooks.
    pub hooks: Vec<String>,
    /// Extension fields removed from other modules' objects, as `object.field`.
    pub fields: Vec<String>,
}

impl PackageRemoval {
    /// Number of removed items, extension fields included.
    pub fn total(&self) -> usize {
        self.objects.len() + self.rules.len() + self.hooks.len() + self.fields.len()
    }
}

#[derive(Debug)]
struct Extension {
    object: String,
    fields: Vec<String>,
}

struct Inner {
    items: Arena<CatalogItem>,
    by_name: HashMap<(ItemKind, String), Handle>,
    by_module: HashMap<String, HashSet<Handle>>,
    rules_by_object: HashMap<String, HashSet<Handle>>,
    extensions: HashMap<String, Vec<Extension>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            items: Arena::new(),
            by_name: HashMap::new(),
            by_module: HashMap::new(),
            rules_by_object: HashMap::new(),
            extensions: HashMap::new(),
        }
    }

    fn insert(&mut self, item: CatalogItem) -> Result<(Handle, CatalogChange)> {
        let key = (item.kind(), item.name().to_string());

        if let Some(&existing) = self.by_name.get(&key) {
            return match &item {
                CatalogItem::Object(def) => {
                    let change = self.merge_extension(existing, def)?;
                    Ok((existing, change))
                }
                _ => Err(Error::DuplicateDefinition {
                    kind: key.0,
                    name: key.1,
                }),
            };
        }

        let module = item.module().to_string();
        let change = match &item {
            CatalogItem::Object(def) => CatalogChange::ObjectAdded(def.name.clone()),
            CatalogItem::Rule(rule) => CatalogChange::RuleChanged {
                object: rule.object.clone(),
            },
            CatalogItem::Hook(hook) => CatalogChange::HookAdded(hook.clone()),
        };
        let rule_object = item.as_rule().map(|r| r.object.clone());

        let handle = self.items.insert(item);
        self.by_name.insert(key, handle);
        self.by_module.entry(module).or_default().insert(handle);
        if let Some(object) = rule_object {
            self.rules_by_object.entry(object).or_default().insert(handle);
        }

        Ok((handle, change))
    }

    fn merge_extension(&mut self, handle: Handle, extension: &ObjectDef) -> Result<CatalogChange> {
        let duplicate = || Error::DuplicateDefinition {
            kind: ItemKind::Object,
            name: extension.name.clone(),
        };

        let Some(CatalogItem::Object(current)) = self.items.get_mut(handle) else {
            return Err(duplicate());
        };
        if !current.extensible || current.module == extension.module {
            return Err(duplicate());
        }
        if !extension.indexes.is_empty() {
            return Err(Error::InvalidDefinition(format!(
                "extension of '{}' by '{}' cannot declare indexes",
                extension.name, extension.module
            )));
        }
        if let Some(clash) = extension.fields.iter().find(|f| current.has_field(&f.name)) {
            return Err(Error::DuplicateDefinition {
                kind: ItemKind::Field,
                name: format!("{}.{}", extension.name, clash.name),
            });
        }

        let def = Arc::make_mut(current);
        for field in &extension.fields {
            let mut field = field.clone();
            field.contributed_by = Some(extension.module.clone());
            def.fields.push(field);
        }

        self.extensions
            .entry(extension.module.clone())
            .or_default()
            .push(Extension {
                object: extension.name.clone(),
                fields: extension.fields.iter().map(|f| f.name.clone()).collect(),
            });

        Ok(CatalogChange::ObjectChanged(extension.name.clone()))
    }

    fn remove_module(&mut self, module: &str) -> Result<(PackageRemoval, Vec<CatalogChange>)> {
        let handles = self.by_module.remove(module).unwrap_or_default();
        let extensions = self.extensions.remove(module).unwrap_or_default();
        if handles.is_empty() && extensions.is_empty() {
            return Err(Error::NotFound {
                kind: ItemKind::Module,
                name: module.to_string(),
            });
        }

        let mut removal = PackageRemoval {
            module: module.to_string(),
            ..Default::default()
        };
        let mut changes = Vec::with_capacity(handles.len() + extensions.len());

        for extension in extensions {
            let key = (ItemKind::Object, extension.object.clone());
            let Some(&handle) = self.by_name.get(&key) else {
                continue;
            };
            if let Some(CatalogItem::Object(def)) = self.items.get_mut(handle) {
                Arc::make_mut(def)
                    .fields
                    .retain(|f| f.contributed_by.as_deref() != Some(module));
                removal.fields.extend(
                    extension
                        .fields
                        .iter()
                        .map(|f| format!("{}.{}", extension.object, f)),
                );
                changes.push(CatalogChange::ObjectChanged(extension.object));
            }
        }

        let mut handles: Vec<Handle> = handles.into_iter().collect();
        handles.sort();

        for handle in handles {
            let Some(item) = self.items.remove(handle) else {
                continue;
            };
            self.by_name.remove(&(item.kind(), item.name().to_string()));

            match item {
                CatalogItem::Object(def) => {
                    removal.objects.push(def.name.clone());
                    changes.push(CatalogChange::ObjectRemoved(def.name.clone()));
                }
                CatalogItem::Rule(rule) => {
                    if let Some(set) = self.rules_by_object.get_mut(&rule.object) {
                        set.remove(&handle);
                        if set.is_empty() {
                            self.rules_by_object.remove(&rule.object);
                        }
                    }
                    removal.rules.push(rule.name.clone());
                    changes.push(CatalogChange::RuleChanged {
                        object: rule.object.clone(),
                    });
                }
                CatalogItem::Hook(hook) => {
                    removal.hooks.push(hook.name.clone());
                    changes.push(CatalogChange::HookRemoved(hook));
                }
            }
        }

        Ok((removal, changes))
    }

    fn rule_handles<'a>(&'a self, object: &str) -> impl Iterator<Item = Handle> + 'a {
        let direct = self.rules_by_object.get(object).into_iter().flatten();
        let wildcard = if object == "*" {
            None
        } else {
            self.rules_by_object.get("*")
        };
        direct.chain(wildcard.into_iter().flatten()).copied()
    }
}

/// The metadata registry.
///
/// Readers take a shared lock and never block each other. Writers serialize
/// on an admin mutex and take the exclusive lock only while mutating the
/// indexes; observers are notified after the exclusive lock is released.
pub struct Registry {
    inner: RwLock<Inner>,
    admin: Mutex<()>,
    observers: RwLock<Vec<Weak<dyn RegistryObserver>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::new()),
            admin: Mutex::new(()),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribe to changes.
    ///
    /// The registry keeps a weak reference; an observer that is dropped
    /// elsewhere stops receiving changes.
    pub fn subscribe(&self, observer: Arc<dyn RegistryObserver>) {
        self.observers.write().push(Arc::downgrade(&observer));
    }

    /// Register an item.
    ///
    /// Registering an object whose name exists merges its fields into the
    /// existing definition when that definition is extensible and owned by a
    /// different module; otherwise the call fails with `DuplicateDefinition`.
    pub fn register(&self, item: impl Into<CatalogItem>) -> Result<Handle> {
        let item = item.into();
        item.validate()?;

        let _admin = self.admin.lock();
        let kind = item.kind();
        let name = item.name().to_string();
        let module = item.module().to_string();

        let (handle, change) = self.inner.write().insert(item)?;
        debug!(%kind, %name, %module, "registered catalog item");

        self.notify(std::slice::from_ref(&change));
        Ok(handle)
    }

    /// Remove every item tagged with `module`, and every field the module
    /// contributed to other modules' objects.
    ///
    /// Cost is proportional to the module's own item count. Dependent caches
    /// are invalidated before this returns.
    pub fn unregister_package(&self, module: &str) -> Result<PackageRemoval> {
        let _admin = self.admin.lock();
        let (removal, changes) = self.inner.write().remove_module(module)?;

        info!(
            module,
            objects = removal.objects.len(),
            rules = removal.rules.len(),
            hooks = removal.hooks.len(),
            fields = removal.fields.len(),
            "unregistered package"
        );

        self.notify(&changes);
        Ok(removal)
    }

    /// Look up an item by kind and name.
    pub fn get(&self, kind: ItemKind, name: &str) -> Result<CatalogItem> {
        let inner = self.inner.read();
        inner
            .by_name
            .get(&(kind, name.to_string()))
            .and_then(|h| inner.items.get(*h))
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind,
                name: name.to_string(),
            })
    }

    /// Look up an item by handle.
    pub fn get_by_handle(&self, handle: Handle) -> Option<CatalogItem> {
        self.inner.read().items.get(handle).cloned()
    }

    /// Look up an object definition.
    pub fn object(&self, name: &str) -> Result<Arc<ObjectDef>> {
        match self.get(ItemKind::Object, name)? {
            CatalogItem::Object(def) => Ok(def),
            _ => Err(Error::object_not_found(name)),
        }
    }

    /// Whether an item exists.
    pub fn contains(&self, kind: ItemKind, name: &str) -> bool {
        self.inner.read().by_name.contains_key(&(kind, name.to_string()))
    }

    /// All items of a kind, sorted by name.
    pub fn list(&self, kind: ItemKind) -> Vec<CatalogItem> {
        let inner = self.inner.read();
        let mut items: Vec<CatalogItem> = inner
            .items
            .iter()
            .filter(|(_, item)| item.kind() == kind)
            .map(|(_, item)| item.clone())
            .collect();
        items.sort_by(|a, b| a.name().cmp(b.name()));
        items
    }

    /// Names of all registered objects, sorted.
    pub fn object_names(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut names: Vec<String> = inner
            .by_name
            .keys()
            .filter(|(kind, _)| *kind == ItemKind::Object)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Rules targeting `object` directly or through the `*` selector, sorted
    /// by name.
    pub fn rules_for_object(&self, object: &str) -> Vec<Arc<PermissionRule>> {
        let inner = self.inner.read();
        let mut rules: Vec<Arc<PermissionRule>> = inner
            .rule_handles(object)
            .filter_map(|h| inner.items.get(h).and_then(|i| i.as_rule().cloned()))
            .collect();
        rules.sort_by(|a, b| a.name.cmp(&b.name));
        rules
    }

    /// All hook registrations.
    pub fn hooks(&self) -> Vec<Arc<HookRegistration>> {
        self.list(ItemKind::Hook)
            .into_iter()
            .filter_map(|item| item.as_hook().cloned())
            .collect()
    }

    /// Items tagged with `module`, sorted by kind then name.
    pub fn module_items(&self, module: &str) -> Vec<(ItemKind, String)> {
        let inner = self.inner.read();
        let mut items: Vec<(ItemKind, String)> = inner
            .by_module
            .get(module)
            .into_iter()
            .flatten()
            .filter_map(|h| inner.items.get(*h))
            .map(|item| (item.kind(), item.name().to_string()))
            .collect();
        items.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()).then(a.1.cmp(&b.1)));
        items
    }

    /// Names of modules with at least one item or extension.
    pub fn modules(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut modules: Vec<String> = inner
            .by_module
            .keys()
            .chain(inner.extensions.keys())
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        modules.sort();
        modules
    }

    /// Total number of items.
    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self, changes: &[CatalogChange]) {
        let observers: Vec<Arc<dyn RegistryObserver>> = {
            let guard = self.observers.read();
            guard.iter().filter_map(Weak::upgrade).collect()
        };

        for change in changes {
            for observer in &observers {
                observer.on_change(self, change);
            }
        }

        if observers.len() != self.observers.read().len() {
            self.observers.write().retain(|w| w.strong_count() > 0);
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("items", &self.len()).finish()
    }
}
