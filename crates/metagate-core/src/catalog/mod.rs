//! Metadata catalog: object definitions, permission rules and the registry
//! that owns them.

mod arena;
mod object;
mod registry;
mod rule;

pub use arena::Handle;
pub use object::{DenialMode, FieldDef, FieldType, IndexDef, ObjectDef};
pub use registry::{
    CatalogChange, CatalogItem, ItemKind, PackageRemoval, Registry, RegistryObserver,
};
pub use rule::{
    Effect, MaskingStrategy, Operand, PermissionRule, RoleSelector, RowCondition, RowFilterMode,
    RuleKind, Verb, VerbSet, CURRENT_ROLE, CURRENT_USER,
};
