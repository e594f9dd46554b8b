//! Query AST: filter tree, sort keys, pagination, aggregation and projection.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::value::Value;

/// Comparison operator of a filter leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Operator {
    /// Field equals value.
    Eq,
    /// Field not equals value.
    Ne,
    /// Field less than value.
    Lt,
    /// Field less than or equal to value.
    Le,
    /// Field greater than value.
    Gt,
    /// Field greater than or equal to value.
    Ge,
    /// Field is in a list of values.
    In,
    /// Field is not in a list of values.
    NotIn,
    /// Field is null or missing.
    IsNull,
    /// Field is present and not null.
    IsNotNull,
    /// Field matches a LIKE pattern.
    Like,
    /// Field does not match a LIKE pattern.
    NotLike,
    /// String field contains the value.
    Contains,
    /// String field starts with the value.
    StartsWith,
}

impl Operator {
    /// Canonical textual form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::In => "in",
            Operator::NotIn => "not in",
            Operator::IsNull => "is null",
            Operator::IsNotNull => "is not null",
            Operator::Like => "like",
            Operator::NotLike => "not like",
            Operator::Contains => "contains",
            Operator::StartsWith => "startswith",
        }
    }

    /// Whether this operator pins the field to one or a few exact values.
    pub fn is_equality(&self) -> bool {
        matches!(self, Operator::Eq | Operator::In)
    }

    /// Whether this operator bounds the field to a range.
    pub fn is_range(&self) -> bool {
        matches!(
            self,
            Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge | Operator::StartsWith
        )
    }
}

impl FromStr for Operator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s.trim().to_ascii_lowercase().as_str() {
            "=" | "==" | "eq" => Operator::Eq,
            "!=" | "<>" | "ne" => Operator::Ne,
            "<" | "lt" => Operator::Lt,
            "<=" | "lte" => Operator::Le,
            ">" | "gt" => Operator::Gt,
            ">=" | "gte" => Operator::Ge,
            "in" => Operator::In,
            "nin" | "not in" | "notin" => Operator::NotIn,
            "is null" | "isnull" => Operator::IsNull,
            "is not null" | "isnotnull" => Operator::IsNotNull,
            "like" => Operator::Like,
            "not like" | "notlike" => Operator::NotLike,
            "contains" => Operator::Contains,
            "startswith" | "starts with" => Operator::StartsWith,
            other => return Err(Error::UnknownOperator(other.to_string())),
        };
        Ok(op)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A filter leaf: `field <op> value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Field path. Dotted paths traverse lookup fields.
    pub field: String,
    /// Comparison operator.
    pub op: Operator,
    /// Operand. `Null` for the unary null checks, `List` for `In`/`NotIn`.
    pub value: Value,
}

/// Filter tree.
///
/// Leaves are conditions, constant booleans, or opaque formula predicates
/// that are evaluated by an external formula evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterNode {
    /// A single comparison.
    Condition(Condition),
    /// All children must match. An empty list matches everything.
    And(Vec<FilterNode>),
    /// At least one child must match. An empty list matches nothing.
    Or(Vec<FilterNode>),
    /// Negation.
    Not(Box<FilterNode>),
    /// Formula predicate evaluated per record.
    Formula(String),
    /// Constant truth value.
    Const(bool),
}

impl FilterNode {
    /// Build a condition leaf.
    pub fn condition(field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        FilterNode::Condition(Condition {
            field: field.into(),
            op,
            value: value.into(),
        })
    }

    /// Build a condition from the `[field, op, value]` triplet form.
    pub fn triplet(field: impl Into<String>, op: &str, value: impl Into<Value>) -> Result<Self, Error> {
        let op: Operator = op.parse()?;
        Ok(Self::condition(field, op, value))
    }

    /// Create an equality filter.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::condition(field, Operator::Eq, value)
    }

    /// Create a not-equal filter.
    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::condition(field, Operator::Ne, value)
    }

    /// Create a less-than filter.
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::condition(field, Operator::Lt, value)
    }

    /// Create a less-than-or-equal filter.
    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::condition(field, Operator::Le, value)
    }

    /// Create a greater-than filter.
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::condition(field, Operator::Gt, value)
    }

    /// Create a greater-than-or-equal filter.
    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::condition(field, Operator::Ge, value)
    }

    /// Create an IN filter.
    pub fn in_values(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::condition(field, Operator::In, Value::List(values))
    }

    /// Create a NOT IN filter.
    pub fn not_in_values(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::condition(field, Operator::NotIn, Value::List(values))
    }

    /// Create an IS NULL filter.
    pub fn is_null(field: impl Into<String>) -> Self {
        Self::condition(field, Operator::IsNull, Value::Null)
    }

    /// Create an IS NOT NULL filter.
    pub fn is_not_null(field: impl Into<String>) -> Self {
        Self::condition(field, Operator::IsNotNull, Value::Null)
    }

    /// Create a LIKE filter.
    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::condition(field, Operator::Like, Value::String(pattern.into()))
    }

    /// Create an AND node.
    pub fn and(children: Vec<FilterNode>) -> Self {
        FilterNode::And(children)
    }

    /// Create an OR node.
    pub fn or(children: Vec<FilterNode>) -> Self {
        FilterNode::Or(children)
    }

    /// Negate a node.
    #[allow(clippy::should_implement_trait)]
    pub fn not(child: FilterNode) -> Self {
        FilterNode::Not(Box::new(child))
    }

    /// Create a formula predicate.
    pub fn formula(expression: impl Into<String>) -> Self {
        FilterNode::Formula(expression.into())
    }

    /// Combine two nodes with AND, extending an existing AND root in place.
    pub fn and_with(self, other: FilterNode) -> FilterNode {
        match self {
            FilterNode::And(mut children) => {
                children.push(other);
                FilterNode::And(children)
            }
            node => FilterNode::And(vec![node, other]),
        }
    }

    /// Collect every field path referenced by this tree.
    pub fn fields(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields(&self, out: &mut BTreeSet<String>) {
        match self {
            FilterNode::Condition(c) => {
                out.insert(c.field.clone());
            }
            FilterNode::And(children) | FilterNode::Or(children) => {
                for child in children {
                    child.collect_fields(out);
                }
            }
            FilterNode::Not(child) => child.collect_fields(out),
            FilterNode::Formula(_) | FilterNode::Const(_) => {}
        }
    }

    /// Whether any formula leaf occurs in the tree.
    pub fn has_formula(&self) -> bool {
        match self {
            FilterNode::Formula(_) => true,
            FilterNode::And(children) | FilterNode::Or(children) => {
                children.iter().any(FilterNode::has_formula)
            }
            FilterNode::Not(child) => child.has_formula(),
            FilterNode::Condition(_) | FilterNode::Const(_) => false,
        }
    }

    /// Depth of the tree (a single leaf has depth 1).
    pub fn depth(&self) -> usize {
        match self {
            FilterNode::And(children) | FilterNode::Or(children) => {
                1 + children.iter().map(FilterNode::depth).max().unwrap_or(0)
            }
            FilterNode::Not(child) => 1 + child.depth(),
            _ => 1,
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortDirection {
    /// Ascending order.
    Asc,
    /// Descending order.
    Desc,
}

/// One sort key. Keys apply in array order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    /// Field to order by.
    pub field: String,
    /// Sort direction.
    pub direction: SortDirection,
}

impl SortKey {
    /// Create an ascending sort key.
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    /// Create a descending sort key.
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Pagination. Offsets are zero-based.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pagination {
    /// Skip `offset` rows, then return at most `limit` rows.
    Offset {
        /// Rows to skip.
        offset: u64,
        /// Maximum rows to return (`None` = unbounded).
        limit: Option<u64>,
    },
    /// Resume after an opaque adapter cursor.
    Cursor {
        /// Opaque cursor issued by the adapter.
        cursor: String,
        /// Maximum rows to return.
        limit: u64,
    },
}

impl Pagination {
    /// Offset pagination.
    pub fn new(offset: u64, limit: u64) -> Self {
        Pagination::Offset {
            offset,
            limit: Some(limit),
        }
    }

    /// Limit-only pagination.
    pub fn limit(limit: u64) -> Self {
        Pagination::Offset {
            offset: 0,
            limit: Some(limit),
        }
    }

    /// Cursor pagination.
    pub fn cursor(cursor: impl Into<String>, limit: u64) -> Self {
        Pagination::Cursor {
            cursor: cursor.into(),
            limit,
        }
    }
}

/// Aggregate function types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateFunction {
    /// Count of rows/values.
    Count,
    /// Sum of numeric values.
    Sum,
    /// Average of numeric values.
    Avg,
    /// Minimum value.
    Min,
    /// Maximum value.
    Max,
}

/// A named aggregate measure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Measure {
    /// The aggregation function to apply.
    pub function: AggregateFunction,
    /// Field to aggregate (`None` for COUNT(*)).
    pub field: Option<String>,
    /// Output column name.
    pub alias: String,
}

impl Measure {
    /// COUNT(*) measure.
    pub fn count(alias: impl Into<String>) -> Self {
        Self {
            function: AggregateFunction::Count,
            field: None,
            alias: alias.into(),
        }
    }

    /// Measure over a field.
    pub fn over(function: AggregateFunction, field: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            function,
            field: Some(field.into()),
            alias: alias.into(),
        }
    }
}

/// Grouping and measures.
///
/// Group keys are evaluated before the `having` filter, which may reference
/// group keys and measure aliases only.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Aggregation {
    /// Group keys.
    pub group_by: Vec<String>,
    /// Measures computed per group.
    pub measures: Vec<Measure>,
    /// Filter applied to aggregated groups.
    pub having: Option<FilterNode>,
}

impl Aggregation {
    /// Create an empty aggregation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a group key.
    pub fn group_by(mut self, field: impl Into<String>) -> Self {
        self.group_by.push(field.into());
        self
    }

    /// Add a measure.
    pub fn measure(mut self, measure: Measure) -> Self {
        self.measures.push(measure);
        self
    }

    /// Set the having filter.
    pub fn having(mut self, filter: FilterNode) -> Self {
        self.having = Some(filter);
        self
    }
}

/// Backend-agnostic query description.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryAst {
    /// Filter tree for the root object.
    pub filter: Option<FilterNode>,
    /// Ordered sort keys.
    pub sort: Vec<SortKey>,
    /// Pagination parameters.
    pub pagination: Option<Pagination>,
    /// Grouping and measures.
    pub aggregation: Option<Aggregation>,
    /// Fields to project (`None` = all visible fields).
    pub projection: Option<Vec<String>>,
}

impl QueryAst {
    /// Create an empty query (all rows, natural order).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the filter.
    pub fn with_filter(mut self, filter: FilterNode) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Append a sort key.
    pub fn with_sort(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    /// Set pagination.
    pub fn with_pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = Some(pagination);
        self
    }

    /// Set aggregation.
    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = Some(aggregation);
        self
    }

    /// Set projection.
    pub fn with_projection(mut self, fields: Vec<String>) -> Self {
        self.projection = Some(fields);
        self
    }

    /// AND a predicate into the root of the filter tree.
    pub fn and_filter(mut self, predicate: FilterNode) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and_with(predicate),
            None => predicate,
        });
        self
    }

    /// Every field referenced by filter, sort, grouping, measures and projection.
    ///
    /// Having-clause references are excluded: they name group keys or measure
    /// aliases, not object fields.
    pub fn referenced_fields(&self) -> BTreeSet<String> {
        let mut fields = self
            .filter
            .as_ref()
            .map(FilterNode::fields)
            .unwrap_or_default();
        fields.extend(self.sort.iter().map(|k| k.field.clone()));
        if let Some(aggregation) = &self.aggregation {
            fields.extend(aggregation.group_by.iter().cloned());
            fields.extend(aggregation.measures.iter().filter_map(|m| m.field.clone()));
        }
        if let Some(projection) = &self.projection {
            fields.extend(projection.iter().cloned());
        }
        fields
    }

    /// Whether the filter or having clause contains a formula leaf. The
    /// fields a formula reads are not visible to [`referenced_fields`](Self::referenced_fields).
    pub fn has_formula(&self) -> bool {
        let having = self
            .aggregation
            .as_ref()
            .and_then(|a| a.having.as_ref());
        self.filter.iter().chain(having).any(FilterNode::has_formula)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_operator_parsing() {
        assert_eq!("=".parse::<Operator>().unwrap(), Operator::Eq);
        assert_eq!("<>".parse::<Operator>().unwrap(), Operator::Ne);
        assert_eq!("NOT IN".parse::<Operator>().unwrap(), Operator::NotIn);
        assert_eq!(">=".parse::<Operator>().unwrap(), Operator::Ge);
        assert!("~=".parse::<Operator>().is_err());
    }

    #[test]
    fn test_and_filter_extends_root() {
        let ast = QueryAst::new()
            .with_filter(FilterNode::and(vec![FilterNode::eq("a", 1)]))
            .and_filter(FilterNode::eq("b", 2));

        assert_eq!(
            ast.filter,
            Some(FilterNode::And(vec![
                FilterNode::eq("a", 1),
                FilterNode::eq("b", 2)
            ]))
        );
    }

    #[test]
    fn test_and_filter_on_empty_query() {
        let ast = QueryAst::new().and_filter(FilterNode::eq("owner_id", "U1"));
        assert_eq!(ast.filter, Some(FilterNode::eq("owner_id", "U1")));
    }

    #[test]
    fn test_referenced_fields() {
        let ast = QueryAst::new()
            .with_filter(FilterNode::or(vec![
                FilterNode::eq("status", "open"),
                FilterNode::not(FilterNode::gt("total", 10)),
            ]))
            .with_sort(SortKey::asc("created_at"))
            .with_aggregation(
                Aggregation::new()
                    .group_by("region")
                    .measure(Measure::over(AggregateFunction::Sum, "total", "sum_total"))
                    .having(FilterNode::gt("sum_total", 100)),
            );

        let fields: Vec<_> = ast.referenced_fields().into_iter().collect();
        assert_eq!(fields, vec!["created_at", "region", "status", "total"]);
    }

    #[test]
    fn test_filter_depth_and_formula_detection() {
        let node = FilterNode::and(vec![
            FilterNode::eq("a", 1),
            FilterNode::not(FilterNode::formula("record.a > 0")),
        ]);
        assert_eq!(node.depth(), 3);
        assert!(node.has_formula());
        assert!(!FilterNode::eq("a", 1).has_formula());
    }

    #[test]
    fn test_query_formula_in_having() {
        let plain = QueryAst::new().with_filter(FilterNode::eq("status", "open"));
        assert!(!plain.has_formula());

        let grouped = plain.with_aggregation(
            Aggregation::new()
                .group_by("status")
                .having(FilterNode::formula("n > 1")),
        );
        assert!(grouped.has_formula());
        assert!(grouped.referenced_fields().contains("status"));
    }
}
