//! Compiled permission decision for a (role, object) pair.

use crate::catalog::{DenialMode, ObjectDef, RowCondition, RowFilterMode, Verb, VerbSet};

use super::field_security::FieldVisibility;

/// How a verb may be exercised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// On every row the row filters admit.
    Full,
    /// Only on rows the caller owns.
    OwnerOnly,
    /// Not at all.
    Denied,
}

/// A compiled row filter.
#[derive(Debug, Clone, PartialEq)]
pub struct RowPredicate {
    /// Rule the predicate came from.
    pub rule: String,
    /// Condition, placeholders unbound.
    pub condition: RowCondition,
    /// Verbs it restricts.
    pub verbs: VerbSet,
    /// Combination mode.
    pub mode: RowFilterMode,
}

/// Everything the engine needs to enforce a role's access to one object.
///
/// Decisions are immutable once built and shared as `Arc`s.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionDecision {
    /// Role the decision was built for.
    pub role: String,
    /// Object the decision applies to.
    pub object: String,
    /// Verbs granted on every row.
    pub verbs: VerbSet,
    /// Verbs granted only on rows the caller owns.
    pub owner_verbs: VerbSet,
    /// Field naming the record owner.
    pub owner_field: String,
    /// Field visibility.
    pub fields: FieldVisibility,
    /// Row filters, in rule-name order.
    pub row_filters: Vec<RowPredicate>,
    /// How denials are reported.
    pub denial_mode: DenialMode,
    /// Names of the rules that contributed.
    pub rules: Vec<String>,
    /// Why the decision was forced to deny-all, if it was.
    pub fault: Option<String>,
}

impl PermissionDecision {
    /// A decision that grants nothing and shows nothing.
    pub fn deny_all(role: impl Into<String>, object: impl Into<String>, owner_field: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            object: object.into(),
            verbs: VerbSet::empty(),
            owner_verbs: VerbSet::empty(),
            owner_field: owner_field.into(),
            fields: FieldVisibility::default(),
            row_filters: Vec::new(),
            denial_mode: DenialMode::Error,
            rules: Vec::new(),
            fault: None,
        }
    }

    /// Full access to every field and row, used for public objects.
    pub fn unrestricted(role: impl Into<String>, def: &ObjectDef, owner_field: impl Into<String>) -> Self {
        let mut decision = Self::deny_all(role, def.name.clone(), owner_field);
        decision.verbs = VerbSet::all();
        decision.fields.visible = def.field_names().map(str::to_string).collect();
        decision.denial_mode = def.denial_mode;
        decision
    }

    /// Access level for a verb.
    pub fn access(&self, verb: Verb) -> Access {
        if self.verbs.contains(verb) {
            Access::Full
        } else if self.owner_verbs.contains(verb) {
            Access::OwnerOnly
        } else {
            Access::Denied
        }
    }

    /// Whether the verb is granted at all.
    pub fn allows(&self, verb: Verb) -> bool {
        self.access(verb) != Access::Denied
    }

    /// Whether a field is visible.
    pub fn is_visible(&self, field: &str) -> bool {
        self.fields.is_visible(field)
    }

    /// Number of row predicates merged for `verb`, the owner predicate
    /// included.
    pub fn row_filter_count(&self, verb: Verb) -> usize {
        let filters = self.row_filters.iter().filter(|p| p.verbs.contains(verb)).count();
        filters + usize::from(self.access(verb) == Access::OwnerOnly)
    }

    /// Whether any row filter applies to `verb`.
    pub fn has_row_filters(&self, verb: Verb) -> bool {
        self.row_filters.iter().any(|p| p.verbs.contains(verb))
            || self.access(verb) == Access::OwnerOnly
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FieldDef, FieldType};

    #[test]
    fn test_access_levels() {
        let mut decision = PermissionDecision::deny_all("member", "task", "owner_id");
        decision.verbs = VerbSet::from(Verb::Read);
        decision.owner_verbs = VerbSet::from(Verb::Update);

        assert_eq!(decision.access(Verb::Read), Access::Full);
        assert_eq!(decision.access(Verb::Update), Access::OwnerOnly);
        assert_eq!(decision.access(Verb::Delete), Access::Denied);
        assert!(decision.has_row_filters(Verb::Update));
        assert!(!decision.has_row_filters(Verb::Read));
    }

    #[test]
    fn test_unrestricted() {
        let def = ObjectDef::new("country", "geo")
            .with_field(FieldDef::new("code", FieldType::Text))
            .public();
        let decision = PermissionDecision::unrestricted("guest", &def, "owner_id");
        assert!(Verb::ALL.iter().all(|v| decision.allows(*v)));
        assert!(decision.is_visible("code"));
    }
}
