//! Permission rule definitions.
//!
//! Rules are scoped to a role selector, an object selector and optionally a
//! field. Their kinds form a closed set: CRUD grants or denials, field
//! visibility, and row filters.

use std::fmt;

use metagate_proto::{Operator, Value};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Placeholder resolved to the caller's user id.
pub const CURRENT_USER: &str = "currentUser";

/// Placeholder resolved to the caller's role.
pub const CURRENT_ROLE: &str = "currentRole";

/// A CRUD verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    /// Read records (find, count, aggregate).
    Read,
    /// Create records.
    Create,
    /// Update records.
    Update,
    /// Delete records.
    Delete,
}

impl Verb {
    /// All verbs.
    pub const ALL: [Verb; 4] = [Verb::Read, Verb::Create, Verb::Update, Verb::Delete];

    fn bit(self) -> u8 {
        match self {
            Verb::Read => 1,
            Verb::Create => 1 << 1,
            Verb::Update => 1 << 2,
            Verb::Delete => 1 << 3,
        }
    }

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Read => "read",
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Delete => "delete",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bitmask of CRUD verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VerbSet(u8);

impl VerbSet {
    /// No verbs.
    pub const fn empty() -> Self {
        VerbSet(0)
    }

    /// All verbs.
    pub const fn all() -> Self {
        VerbSet(0b1111)
    }

    /// Set of the given verbs.
    pub fn of(verbs: &[Verb]) -> Self {
        verbs.iter().fold(VerbSet::empty(), |set, v| set.with(*v))
    }

    /// Add a verb.
    pub fn with(self, verb: Verb) -> Self {
        VerbSet(self.0 | verb.bit())
    }

    /// Whether the verb is in the set.
    pub fn contains(&self, verb: Verb) -> bool {
        self.0 & verb.bit() != 0
    }

    /// Union of two sets.
    pub fn union(self, other: VerbSet) -> Self {
        VerbSet(self.0 | other.0)
    }

    /// Verbs in `self` but not in `other`.
    pub fn difference(self, other: VerbSet) -> Self {
        VerbSet(self.0 & !other.0)
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate verbs in the set.
    pub fn iter(&self) -> impl Iterator<Item = Verb> + '_ {
        Verb::ALL.into_iter().filter(|v| self.contains(*v))
    }
}

impl From<Verb> for VerbSet {
    fn from(verb: Verb) -> Self {
        VerbSet::empty().with(verb)
    }
}

impl fmt::Display for VerbSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|v| v.as_str()).collect();
        write!(f, "[{}]", names.join(","))
    }
}

/// Allow or deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Effect {
    /// Grant.
    Allow,
    /// Refuse; wins over any grant.
    Deny,
}

/// Which callers a rule applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleSelector {
    /// A concrete role.
    Role(String),
    /// Every role.
    Any,
    /// Any caller, restricted to records the caller owns.
    Owner,
}

impl RoleSelector {
    /// Parse `*`, `$owner` or a concrete role name.
    pub fn parse(selector: &str) -> Self {
        match selector {
            "*" => RoleSelector::Any,
            "$owner" => RoleSelector::Owner,
            role => RoleSelector::Role(role.to_string()),
        }
    }

    /// Whether a rule with this selector is gathered for `role`.
    pub fn applies_to(&self, role: &str) -> bool {
        match self {
            RoleSelector::Role(r) => r == role,
            RoleSelector::Any | RoleSelector::Owner => true,
        }
    }
}

impl From<&str> for RoleSelector {
    fn from(selector: &str) -> Self {
        RoleSelector::parse(selector)
    }
}

impl fmt::Display for RoleSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleSelector::Role(r) => f.write_str(r),
            RoleSelector::Any => f.write_str("*"),
            RoleSelector::Owner => f.write_str("$owner"),
        }
    }
}

/// How a hidden field is presented in results.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MaskingStrategy {
    /// Remove the field from the record.
    #[default]
    Omit,
    /// Replace with null.
    Null,
    /// Replace with a fixed placeholder.
    Redacted(String),
    /// Keep some characters of a string value and mask the rest.
    Partial {
        /// Number of characters left visible.
        visible_chars: u32,
        /// Keep the trailing characters instead of the leading ones.
        from_end: bool,
        /// Replacement character.
        mask_char: char,
    },
}

impl MaskingStrategy {
    /// Relative strength; the strongest wins when several rules hide a field.
    pub fn strength(&self) -> u8 {
        match self {
            MaskingStrategy::Omit => 4,
            MaskingStrategy::Null => 3,
            MaskingStrategy::Redacted(_) => 2,
            MaskingStrategy::Partial { .. } => 1,
        }
    }
}

/// Right-hand side of a row condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    /// A literal value.
    Literal(Value),
    /// A caller-context placeholder (`currentUser`, `currentRole` or an
    /// attribute name).
    Context(String),
}

impl Operand {
    /// Literal operand.
    pub fn literal(value: impl Into<Value>) -> Self {
        Operand::Literal(value.into())
    }

    /// The caller's user id.
    pub fn current_user() -> Self {
        Operand::Context(CURRENT_USER.to_string())
    }

    /// The caller's role.
    pub fn current_role() -> Self {
        Operand::Context(CURRENT_ROLE.to_string())
    }

    /// A named caller attribute.
    pub fn attribute(name: impl Into<String>) -> Self {
        Operand::Context(name.into())
    }

    /// Parse a value, treating strings that start with `$` as placeholders.
    pub fn parse(value: Value) -> Self {
        match value {
            Value::String(s) if s.len() > 1 && s.starts_with('$') => {
                Operand::Context(s[1..].to_string())
            }
            other => Operand::Literal(other),
        }
    }
}

/// Row-level condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowCondition {
    /// Compare a field of the same object against an operand.
    Compare {
        /// Field name.
        field: String,
        /// Comparison operator.
        op: Operator,
        /// Literal or placeholder.
        value: Operand,
    },
    /// Every child must hold.
    All(Vec<RowCondition>),
    /// At least one child must hold.
    Any(Vec<RowCondition>),
    /// Negation.
    Not(Box<RowCondition>),
    /// Formula predicate evaluated per record.
    Formula {
        /// Formula source.
        expression: String,
    },
}

impl RowCondition {
    /// Comparison condition.
    pub fn compare(field: impl Into<String>, op: Operator, value: Operand) -> Self {
        RowCondition::Compare {
            field: field.into(),
            op,
            value,
        }
    }

    /// `field = value`.
    pub fn eq(field: impl Into<String>, value: Operand) -> Self {
        Self::compare(field, Operator::Eq, value)
    }

    /// `field = $currentUser`.
    pub fn owned_by_caller(field: impl Into<String>) -> Self {
        Self::eq(field, Operand::current_user())
    }

    /// Formula condition.
    pub fn formula(expression: impl Into<String>) -> Self {
        RowCondition::Formula {
            expression: expression.into(),
        }
    }

    /// Formula sources referenced by this condition.
    pub fn formulas(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_formulas(&mut out);
        out
    }

    fn collect_formulas<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            RowCondition::Formula { expression } => out.push(expression),
            RowCondition::All(children) | RowCondition::Any(children) => {
                for child in children {
                    child.collect_formulas(out);
                }
            }
            RowCondition::Not(child) => child.collect_formulas(out),
            RowCondition::Compare { .. } => {}
        }
    }

    /// Check that the condition only references fields of its own object.
    pub fn validate(&self) -> Result<()> {
        match self {
            RowCondition::Compare { field, op, value } => {
                if field.is_empty() {
                    return Err(Error::InvalidDefinition("row condition field is empty".into()));
                }
                if field.contains('.') {
                    return Err(Error::InvalidDefinition(format!(
                        "row condition on '{}' crosses objects",
                        field
                    )));
                }
                match (op, value) {
                    (Operator::In | Operator::NotIn, Operand::Literal(v)) if v.as_list().is_none() => {
                        Err(Error::InvalidDefinition(format!(
                            "'{}' on '{}' expects a list",
                            op, field
                        )))
                    }
                    (_, Operand::Context(name)) if name.is_empty() => Err(
                        Error::InvalidDefinition(format!("empty placeholder on '{}'", field)),
                    ),
                    _ => Ok(()),
                }
            }
            RowCondition::All(children) | RowCondition::Any(children) => {
                children.iter().try_for_each(RowCondition::validate)
            }
            RowCondition::Not(child) => child.validate(),
            RowCondition::Formula { expression } => {
                if expression.trim().is_empty() {
                    Err(Error::InvalidDefinition("empty formula".into()))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// How multiple row filters for the same verb combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RowFilterMode {
    /// Always ANDed into the query.
    #[default]
    Restrictive,
    /// ORed with the other permissive filters, then ANDed as one group.
    Permissive,
}

/// Rule kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RuleKind {
    /// Grant or deny CRUD verbs on the object.
    Crud {
        /// Allow or deny.
        effect: Effect,
        /// Verbs covered.
        verbs: VerbSet,
    },
    /// Show or hide a single field.
    FieldAccess {
        /// Allow shows the field, deny hides it.
        effect: Effect,
        /// Presentation of a hidden field.
        masking: MaskingStrategy,
    },
    /// Restrict rows visible or writable by the role.
    RowFilter {
        /// Condition every accessible row satisfies.
        condition: RowCondition,
        /// Verbs the filter applies to.
        verbs: VerbSet,
        /// Combination mode.
        mode: RowFilterMode,
    },
}

/// A permission rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRule {
    /// Rule name, unique in the registry.
    pub name: String,
    /// Module that owns the rule.
    pub module: String,
    /// Roles the rule applies to.
    pub role: RoleSelector,
    /// Object name, or `*` for every object.
    pub object: String,
    /// Field for field-access rules.
    pub field: Option<String>,
    /// What the rule does.
    pub kind: RuleKind,
}

impl PermissionRule {
    fn base(
        name: impl Into<String>,
        module: impl Into<String>,
        role: impl Into<RoleSelector>,
        object: impl Into<String>,
        kind: RuleKind,
    ) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
            role: role.into(),
            object: object.into(),
            field: None,
            kind,
        }
    }

    /// Grant verbs.
    pub fn allow(
        name: impl Into<String>,
        module: impl Into<String>,
        role: impl Into<RoleSelector>,
        object: impl Into<String>,
        verbs: VerbSet,
    ) -> Self {
        let kind = RuleKind::Crud {
            effect: Effect::Allow,
            verbs,
        };
        Self::base(name, module, role, object, kind)
    }

    /// Deny verbs.
    pub fn deny(
        name: impl Into<String>,
        module: impl Into<String>,
        role: impl Into<RoleSelector>,
        object: impl Into<String>,
        verbs: VerbSet,
    ) -> Self {
        let kind = RuleKind::Crud {
            effect: Effect::Deny,
            verbs,
        };
        Self::base(name, module, role, object, kind)
    }

    /// Hide a field.
    pub fn hide_field(
        name: impl Into<String>,
        module: impl Into<String>,
        role: impl Into<RoleSelector>,
        object: impl Into<String>,
        field: impl Into<String>,
        masking: MaskingStrategy,
    ) -> Self {
        let kind = RuleKind::FieldAccess {
            effect: Effect::Deny,
            masking,
        };
        let mut rule = Self::base(name, module, role, object, kind);
        rule.field = Some(field.into());
        rule
    }

    /// Explicitly show a field. Once a role has any such rule on an object,
    /// only explicitly shown fields are visible.
    pub fn show_field(
        name: impl Into<String>,
        module: impl Into<String>,
        role: impl Into<RoleSelector>,
        object: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        let kind = RuleKind::FieldAccess {
            effect: Effect::Allow,
            masking: MaskingStrategy::Omit,
        };
        let mut rule = Self::base(name, module, role, object, kind);
        rule.field = Some(field.into());
        rule
    }

    /// Restrict rows for every verb.
    pub fn row_filter(
        name: impl Into<String>,
        module: impl Into<String>,
        role: impl Into<RoleSelector>,
        object: impl Into<String>,
        condition: RowCondition,
    ) -> Self {
        let kind = RuleKind::RowFilter {
            condition,
            verbs: VerbSet::all(),
            mode: RowFilterMode::Restrictive,
        };
        Self::base(name, module, role, object, kind)
    }

    /// Limit a row filter to some verbs.
    pub fn for_verbs(mut self, only: VerbSet) -> Self {
        if let RuleKind::RowFilter { verbs, .. } = &mut self.kind {
            *verbs = only;
        }
        self
    }

    /// Make a row filter permissive.
    pub fn permissive(mut self) -> Self {
        if let RuleKind::RowFilter { mode, .. } = &mut self.kind {
            *mode = RowFilterMode::Permissive;
        }
        self
    }

    /// Whether the rule applies to every object.
    pub fn is_wildcard_object(&self) -> bool {
        self.object == "*"
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.module.is_empty() || self.object.is_empty() {
            return Err(Error::InvalidDefinition(format!(
                "rule '{}' needs a name, module and object",
                self.name
            )));
        }
        if let RoleSelector::Role(role) = &self.role {
            if role.is_empty() {
                return Err(Error::InvalidDefinition(format!(
                    "rule '{}' has an empty role",
                    self.name
                )));
            }
        }

        match (&self.kind, &self.field) {
            (RuleKind::FieldAccess { .. }, None) => Err(Error::InvalidDefinition(format!(
                "field rule '{}' names no field",
                self.name
            ))),
            (RuleKind::FieldAccess { .. }, Some(_)) if self.role == RoleSelector::Owner => {
                Err(Error::InvalidDefinition(format!(
                    "field rule '{}' cannot target $owner",
                    self.name
                )))
            }
            (RuleKind::FieldAccess { .. }, Some(_)) => Ok(()),
            (_, Some(field)) => Err(Error::InvalidDefinition(format!(
                "rule '{}' is not a field rule but names field '{}'",
                self.name, field
            ))),
            (RuleKind::RowFilter { .. }, None) if self.role == RoleSelector::Owner => {
                Err(Error::InvalidDefinition(format!(
                    "row filter '{}' cannot target $owner",
                    self.name
                )))
            }
            (RuleKind::RowFilter { condition, .. }, None) => condition.validate(),
            (RuleKind::Crud { .. }, None) => Ok(()),
        }
    }
}
