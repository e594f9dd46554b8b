//! Row-level security: binding row conditions to a caller and combining them
//! into a single filter.

use metagate_proto::{FilterNode, Operator};

use super::context::CallerContext;
use super::decision::{Access, PermissionDecision};
use super::formula::FormulaError;
use crate::catalog::{Operand, RowCondition, RowFilterMode, Verb};

impl RowCondition {
    /// Substitute caller placeholders and produce a filter tree.
    pub fn bind(&self, caller: &CallerContext) -> Result<FilterNode, FormulaError> {
        Ok(match self {
            RowCondition::Compare { field, op, value } => {
                let value = match value {
                    Operand::Literal(v) => v.clone(),
                    Operand::Context(name) => caller.resolve(name)?,
                };
                match (op, value.as_list()) {
                    (Operator::In | Operator::NotIn, None) => {
                        let op = if *op == Operator::In {
                            Operator::Eq
                        } else {
                            Operator::Ne
                        };
                        FilterNode::condition(field.clone(), op, value)
                    }
                    _ => FilterNode::condition(field.clone(), *op, value),
                }
            }
            RowCondition::All(children) => FilterNode::And(
                children
                    .iter()
                    .map(|c| c.bind(caller))
                    .collect::<Result<_, _>>()?,
            ),
            RowCondition::Any(children) => FilterNode::Or(
                children
                    .iter()
                    .map(|c| c.bind(caller))
                    .collect::<Result<_, _>>()?,
            ),
            RowCondition::Not(child) => FilterNode::not(child.bind(caller)?),
            RowCondition::Formula { expression } => FilterNode::Formula(expression.clone()),
        })
    }
}

/// Build the predicates a caller's rows must satisfy for `verb`.
///
/// Restrictive filters are returned one by one; permissive filters are ORed
/// into a single group. Owner-only access adds `owner_field = $currentUser`.
/// Returns an empty list when the caller is unrestricted.
pub fn row_predicates(
    decision: &PermissionDecision,
    verb: Verb,
    caller: &CallerContext,
) -> Result<Vec<FilterNode>, FormulaError> {
    let mut restrictive = Vec::new();
    let mut permissive = Vec::new();

    for predicate in decision.row_filters.iter().filter(|p| p.verbs.contains(verb)) {
        let node = predicate.condition.bind(caller)?;
        match predicate.mode {
            RowFilterMode::Restrictive => restrictive.push(node),
            RowFilterMode::Permissive => permissive.push(node),
        }
    }

    match permissive.len() {
        0 => {}
        1 => restrictive.extend(permissive),
        _ => restrictive.push(FilterNode::Or(permissive)),
    }

    if decision.access(verb) == Access::OwnerOnly {
        let owner = RowCondition::owned_by_caller(decision.owner_field.clone());
        restrictive.push(owner.bind(caller)?);
    }

    Ok(restrictive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::decision::RowPredicate;
    use crate::catalog::VerbSet;
    use metagate_proto::Value;

    fn predicate(name: &str, condition: RowCondition, mode: RowFilterMode) -> RowPredicate {
        RowPredicate {
            rule: name.to_string(),
            condition,
            verbs: VerbSet::all(),
            mode,
        }
    }

    #[test]
    fn test_bind_placeholders() {
        let caller = CallerContext::new("U1").with_attribute("org_id", "acme");
        let condition = RowCondition::All(vec![
            RowCondition::owned_by_caller("owner_id"),
            RowCondition::eq("org_id", Operand::attribute("org_id")),
            RowCondition::eq("archived", Operand::literal(false)),
        ]);

        assert_eq!(
            condition.bind(&caller).unwrap(),
            FilterNode::And(vec![
                FilterNode::eq("owner_id", "U1"),
                FilterNode::eq("org_id", "acme"),
                FilterNode::eq("archived", false),
            ])
        );
    }

    #[test]
    fn test_bind_missing_attribute_fails() {
        let caller = CallerContext::new("U1");
        let condition = RowCondition::eq("org_id", Operand::attribute("org_id"));
        assert_eq!(
            condition.bind(&caller),
            Err(FormulaError::MissingContext("org_id".into()))
        );
    }

    #[test]
    fn test_in_with_scalar_attribute() {
        let caller = CallerContext::new("U1").with_attribute("teams", Value::List(vec!["a".into(), "b".into()]));
        let condition = RowCondition::compare("team", Operator::In, Operand::attribute("teams"));
        assert_eq!(
            condition.bind(&caller).unwrap(),
            FilterNode::in_values("team", vec!["a".into(), "b".into()])
        );

        let caller = CallerContext::new("U1").with_attribute("teams", "a");
        assert_eq!(condition.bind(&caller).unwrap(), FilterNode::eq("team", "a"));
    }

    #[test]
    fn test_permissive_filters_are_ored() {
        let mut decision = PermissionDecision::deny_all("viewer", "invoice", "owner_id");
        decision.verbs = VerbSet::all();
        decision.row_filters = vec![
            predicate("own", RowCondition::owned_by_caller("owner_id"), RowFilterMode::Permissive),
            predicate("shared", RowCondition::eq("shared", Operand::literal(true)), RowFilterMode::Permissive),
            predicate("live", RowCondition::eq("archived", Operand::literal(false)), RowFilterMode::Restrictive),
        ];

        let caller = CallerContext::new("U1");
        let predicates = row_predicates(&decision, Verb::Read, &caller).unwrap();
        assert_eq!(
            predicates,
            vec![
                FilterNode::eq("archived", false),
                FilterNode::Or(vec![FilterNode::eq("owner_id", "U1"), FilterNode::eq("shared", true)]),
            ]
        );
    }

    #[test]
    fn test_owner_only_adds_owner_predicate() {
        let mut decision = PermissionDecision::deny_all("member", "task", "assignee");
        decision.owner_verbs = VerbSet::from(Verb::Update);

        let caller = CallerContext::new("U7");
        let predicates = row_predicates(&decision, Verb::Update, &caller).unwrap();
        assert_eq!(predicates, vec![FilterNode::eq("assignee", "U7")]);

        let anonymous = CallerContext::anonymous();
        assert!(row_predicates(&decision, Verb::Update, &anonymous).is_err());
    }
}
