//! Filter evaluation against records.
//!
//! Adapters that cannot push a filter down (or that must evaluate formula
//! leaves) use [`RowMatcher`] to test records. A record whose formula fails
//! is excluded, never included.

use std::time::Instant;

use metagate_proto::{Condition, FilterNode, Operator, Record, Value};
use tracing::warn;

use crate::security::{CallerContext, FormulaBudget, FormulaError, FormulaEvaluator};

/// What formula leaves are evaluated with.
#[derive(Clone, Copy)]
pub struct FormulaScope<'a> {
    /// Evaluator.
    pub evaluator: &'a dyn FormulaEvaluator,
    /// Caller the formula runs for.
    pub caller: &'a CallerContext,
    /// Per-record budget.
    pub budget: FormulaBudget,
}

impl FormulaScope<'_> {
    fn evaluate(&self, expression: &str, record: &Record) -> Result<bool, FormulaError> {
        let started = Instant::now();
        let result = self
            .evaluator
            .evaluate(expression, record, self.caller, &self.budget)?;
        if started.elapsed() > self.budget.max_duration {
            return Err(FormulaError::BudgetExceeded(self.budget.max_duration));
        }
        Ok(result)
    }
}

/// Evaluates filter trees against records.
pub struct FilterEvaluator;

impl FilterEvaluator {
    /// Evaluate a filter against a record.
    ///
    /// Formula leaves need a scope; without one they fail with
    /// `FormulaError::Unavailable`.
    pub fn evaluate(
        filter: &FilterNode,
        record: &Record,
        formulas: Option<&FormulaScope<'_>>,
    ) -> Result<bool, FormulaError> {
        match filter {
            FilterNode::Condition(c) => Ok(Self::evaluate_condition(c, record)),
            FilterNode::And(children) => {
                for child in children {
                    if !Self::evaluate(child, record, formulas)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            FilterNode::Or(children) => {
                for child in children {
                    if Self::evaluate(child, record, formulas)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            FilterNode::Not(child) => Ok(!Self::evaluate(child, record, formulas)?),
            FilterNode::Formula(expression) => match formulas {
                Some(scope) => scope.evaluate(expression, record),
                None => Err(FormulaError::Unavailable),
            },
            FilterNode::Const(b) => Ok(*b),
        }
    }

    fn evaluate_condition(c: &Condition, record: &Record) -> bool {
        let field_value = record.get(&c.field);
        let present = field_value.filter(|v| !v.is_null());

        match c.op {
            Operator::IsNull => present.is_none(),
            Operator::IsNotNull => present.is_some(),
            Operator::Eq => present.is_some_and(|fv| fv.loose_eq(&c.value)),
            Operator::Ne => present.is_some_and(|fv| !fv.loose_eq(&c.value)),
            Operator::Lt => Self::ordered(present, &c.value, |o| o.is_lt()),
            Operator::Le => Self::ordered(present, &c.value, |o| o.is_le()),
            Operator::Gt => Self::ordered(present, &c.value, |o| o.is_gt()),
            Operator::Ge => Self::ordered(present, &c.value, |o| o.is_ge()),
            Operator::In => present.is_some_and(|fv| Self::in_list(fv, &c.value)),
            // null is not in any set
            Operator::NotIn => present.map_or(true, |fv| !Self::in_list(fv, &c.value)),
            Operator::Like => match (present, c.value.as_str()) {
                (Some(Value::String(s)), Some(pattern)) => Self::like_match(s, pattern),
                _ => false,
            },
            Operator::NotLike => match (present, c.value.as_str()) {
                (Some(Value::String(s)), Some(pattern)) => !Self::like_match(s, pattern),
                _ => true,
            },
            Operator::Contains => match (present, &c.value) {
                (Some(Value::String(s)), Value::String(needle)) => s.contains(needle.as_str()),
                (Some(Value::List(items)), needle) => items.iter().any(|i| i.loose_eq(needle)),
                _ => false,
            },
            Operator::StartsWith => match (present, c.value.as_str()) {
                (Some(Value::String(s)), Some(prefix)) => s.starts_with(prefix),
                _ => false,
            },
        }
    }

    fn ordered(
        field_value: Option<&Value>,
        value: &Value,
        check: impl FnOnce(std::cmp::Ordering) -> bool,
    ) -> bool {
        field_value
            .and_then(|fv| fv.compare(value))
            .is_some_and(check)
    }

    fn in_list(field_value: &Value, list: &Value) -> bool {
        match list {
            Value::List(items) => items.iter().any(|v| field_value.loose_eq(v)),
            single => field_value.loose_eq(single),
        }
    }

    /// Match a string against a SQL LIKE pattern.
    ///
    /// Supports:
    /// - `%` matches zero or more characters
    /// - `_` matches exactly one character
    /// - `\\%` matches literal `%`
    /// - `\\_` matches literal `_`
    pub fn like_match(value: &str, pattern: &str) -> bool {
        let mut chars = value.chars().peekable();
        let mut pattern_chars = pattern.chars().peekable();

        Self::like_match_recursive(&mut chars, &mut pattern_chars)
    }

    fn like_match_recursive(
        chars: &mut std::iter::Peekable<std::str::Chars>,
        pattern: &mut std::iter::Peekable<std::str::Chars>,
    ) -> bool {
        loop {
            match (pattern.peek().copied(), chars.peek().copied()) {
                (None, None) => return true,
                (None, Some(_)) => return false,
                (Some('%'), _) => {
                    pattern.next();
                    if pattern.peek().is_none() {
                        return true;
                    }

                    // try the rest of the pattern at every remaining position
                    loop {
                        let mut pattern_clone = pattern.clone();
                        let mut chars_clone = chars.clone();
                        if Self::like_match_recursive(&mut chars_clone, &mut pattern_clone) {
                            return true;
                        }
                        if chars.next().is_none() {
                            return false;
                        }
                    }
                }
                (Some('_'), Some(_)) => {
                    pattern.next();
                    chars.next();
                }
                (Some('_'), None) => return false,
                (Some('\\'), _) => {
                    pattern.next();
                    match (pattern.peek().copied(), chars.peek().copied()) {
                        (Some(p), Some(c)) if p == c => {
                            pattern.next();
                            chars.next();
                        }
                        _ => return false,
                    }
                }
                (Some(p), Some(c)) => {
                    if p != c {
                        return false;
                    }
                    pattern.next();
                    chars.next();
                }
                (Some(_), None) => return false,
            }
        }
    }
}

/// Fail-closed record matcher handed to storage adapters.
#[derive(Clone, Copy)]
pub struct RowMatcher<'a> {
    scope: FormulaScope<'a>,
}

impl<'a> RowMatcher<'a> {
    /// Create a matcher.
    pub fn new(
        evaluator: &'a dyn FormulaEvaluator,
        caller: &'a CallerContext,
        budget: FormulaBudget,
    ) -> Self {
        Self {
            scope: FormulaScope {
                evaluator,
                caller,
                budget,
            },
        }
    }

    /// Whether `record` satisfies `filter` (no filter matches everything).
    /// Formula failures exclude the record.
    pub fn matches(&self, filter: Option<&FilterNode>, record: &Record) -> bool {
        let Some(filter) = filter else {
            return true;
        };
        match FilterEvaluator::evaluate(filter, record, Some(&self.scope)) {
            Ok(matched) => matched,
            Err(err) => {
                warn!(error = %err, "formula failed, excluding record");
                false
            }
        }
    }

    /// Like [`matches`](Self::matches), but reports the formula failure.
    pub fn try_matches(&self, filter: &FilterNode, record: &Record) -> Result<bool, FormulaError> {
        FilterEvaluator::evaluate(filter, record, Some(&self.scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::NoFormulaEvaluator;
    use std::time::Duration;

    fn record(fields: Vec<(&str, Value)>) -> Record {
        fields.into_iter().map(|(n, v)| (n.to_string(), v)).collect()
    }

    fn row() -> Record {
        record(vec![
            ("name", Value::from("Alice")),
            ("age", Value::from(30)),
            ("score", Value::from(4.5)),
            ("tags", Value::List(vec!["a".into(), "b".into()])),
            ("deleted_at", Value::Null),
        ])
    }

    fn eval(filter: &FilterNode) -> bool {
        FilterEvaluator::evaluate(filter, &row(), None).unwrap()
    }

    struct Threshold;

    impl FormulaEvaluator for Threshold {
        fn evaluate(
            &self,
            expression: &str,
            record: &Record,
            _caller: &CallerContext,
            _budget: &FormulaBudget,
        ) -> Result<bool, FormulaError> {
            match expression {
                "adult" => Ok(record.get("age").and_then(Value::as_i64).unwrap_or(0) >= 18),
                other => Err(FormulaError::Malformed(other.to_string())),
            }
        }
    }

    #[test]
    fn test_comparisons() {
        assert!(eval(&FilterNode::eq("name", "Alice")));
        assert!(!eval(&FilterNode::ne("name", "Alice")));
        assert!(eval(&FilterNode::gt("age", 18)));
        assert!(eval(&FilterNode::le("score", 4.5)));
        assert!(eval(&FilterNode::ge("age", 29.5)));
        assert!(!eval(&FilterNode::lt("name", 3)));
    }

    #[test]
    fn test_missing_and_null_fields() {
        assert!(!eval(&FilterNode::eq("missing", "x")));
        assert!(!eval(&FilterNode::ne("missing", "x")));
        assert!(eval(&FilterNode::is_null("missing")));
        assert!(eval(&FilterNode::is_null("deleted_at")));
        assert!(eval(&FilterNode::is_not_null("name")));
        assert!(eval(&FilterNode::not_in_values("missing", vec!["x".into()])));
    }

    #[test]
    fn test_in_and_contains() {
        assert!(eval(&FilterNode::in_values("age", vec![29.into(), 30.into()])));
        assert!(!eval(&FilterNode::in_values("age", vec![1.into()])));
        assert!(eval(&FilterNode::condition("tags", Operator::Contains, "b")));
        assert!(eval(&FilterNode::condition("name", Operator::Contains, "lic")));
        assert!(eval(&FilterNode::condition("name", Operator::StartsWith, "Al")));
    }

    #[test]
    fn test_like() {
        assert!(FilterEvaluator::like_match("Alice", "A%"));
        assert!(FilterEvaluator::like_match("Alice", "_lic_"));
        assert!(FilterEvaluator::like_match("100%", "100\\%"));
        assert!(!FilterEvaluator::like_match("Alice", "B%"));
        assert!(eval(&FilterNode::like("name", "%ice")));
    }

    #[test]
    fn test_logical() {
        let both = FilterNode::and(vec![FilterNode::eq("name", "Alice"), FilterNode::gt("age", 40)]);
        let either = FilterNode::or(vec![FilterNode::eq("name", "Bob"), FilterNode::gt("age", 20)]);
        assert!(!eval(&both));
        assert!(eval(&either));
        assert!(eval(&FilterNode::not(both)));
        assert!(eval(&FilterNode::and(vec![])));
        assert!(!eval(&FilterNode::or(vec![])));
    }

    #[test]
    fn test_formula_without_scope_fails() {
        let result = FilterEvaluator::evaluate(&FilterNode::formula("adult"), &row(), None);
        assert_eq!(result, Err(FormulaError::Unavailable));
    }

    #[test]
    fn test_row_matcher_fails_closed() {
        let caller = CallerContext::new("U1");
        let budget = FormulaBudget::new(Duration::from_secs(1));
        let matcher = RowMatcher::new(&Threshold, &caller, budget);

        assert!(matcher.matches(Some(&FilterNode::formula("adult")), &row()));
        assert!(!matcher.matches(Some(&FilterNode::formula("broken(")), &row()));
        // negating a failure must not include the record
        assert!(!matcher.matches(Some(&FilterNode::not(FilterNode::formula("broken("))), &row()));
        assert!(matcher.matches(None, &row()));

        let none = RowMatcher::new(&NoFormulaEvaluator, &caller, budget);
        assert!(!none.matches(Some(&FilterNode::formula("adult")), &row()));
    }
}
