//! AST normalization.
//!
//! Normalization rewrites a query into a canonical form so that semantically
//! identical queries hash to the same plan key:
//!
//! - nested AND/OR are flattened and single-child groups collapse;
//! - constants fold (`x AND false` is `false`, `x OR true` is `true`);
//! - double negation cancels;
//! - siblings are deduplicated and sorted by their canonical encoding;
//! - `IN` lists are sorted and deduplicated, one-element lists become `=`;
//! - equality against null becomes a null check;
//! - two different equalities on the same field in one AND fold to `false`;
//! - sort keys keep their first occurrence per field;
//! - a zero offset without a limit is dropped;
//! - projections are sorted and deduplicated.

use std::collections::{BTreeMap, HashSet};

use metagate_proto::{Condition, FilterNode, Operator, Pagination, QueryAst, Value};

use super::fingerprint::{node_bytes, value_bytes};

/// Normalize a query.
pub fn normalize(ast: &QueryAst) -> QueryAst {
    let filter = ast
        .filter
        .as_ref()
        .map(normalize_filter)
        .filter(|f| *f != FilterNode::Const(true));

    let mut seen = HashSet::new();
    let sort = ast
        .sort
        .iter()
        .filter(|k| seen.insert(k.field.clone()))
        .cloned()
        .collect();

    let pagination = match &ast.pagination {
        Some(Pagination::Offset {
            offset: 0,
            limit: None,
        }) => None,
        other => other.clone(),
    };

    let aggregation = ast.aggregation.as_ref().map(|agg| {
        let mut agg = agg.clone();
        let mut seen = HashSet::new();
        agg.group_by.retain(|k| seen.insert(k.clone()));
        agg.having = agg
            .having
            .as_ref()
            .map(normalize_filter)
            .filter(|f| *f != FilterNode::Const(true));
        agg
    });

    let projection = ast.projection.as_ref().map(|fields| {
        let mut fields = fields.clone();
        fields.sort();
        fields.dedup();
        fields
    });

    QueryAst {
        filter,
        sort,
        pagination,
        aggregation,
        projection,
    }
}

/// Normalize a filter tree.
pub fn normalize_filter(node: &FilterNode) -> FilterNode {
    match node {
        FilterNode::Condition(c) => normalize_condition(c),
        FilterNode::Not(child) => match normalize_filter(child) {
            FilterNode::Const(b) => FilterNode::Const(!b),
            FilterNode::Not(inner) => *inner,
            other => FilterNode::Not(Box::new(other)),
        },
        FilterNode::And(children) => normalize_group(children, true),
        FilterNode::Or(children) => normalize_group(children, false),
        FilterNode::Formula(expression) => FilterNode::Formula(expression.trim().to_string()),
        FilterNode::Const(b) => FilterNode::Const(*b),
    }
}

fn normalize_condition(c: &Condition) -> FilterNode {
    match (c.op, &c.value) {
        (Operator::Eq, Value::Null) => FilterNode::is_null(c.field.clone()),
        (Operator::Ne, Value::Null) => FilterNode::is_not_null(c.field.clone()),
        (Operator::IsNull | Operator::IsNotNull, v) if !v.is_null() => {
            FilterNode::condition(c.field.clone(), c.op, Value::Null)
        }
        (Operator::In | Operator::NotIn, Value::List(items)) => {
            let mut keyed: Vec<(Vec<u8>, Value)> =
                items.iter().map(|v| (value_bytes(v), v.clone())).collect();
            keyed.sort_by(|a, b| a.0.cmp(&b.0));
            keyed.dedup_by(|a, b| a.0 == b.0);
            let mut values: Vec<Value> = keyed.into_iter().map(|(_, v)| v).collect();

            match (c.op, values.len()) {
                (Operator::In, 0) => FilterNode::Const(false),
                (Operator::NotIn, 0) => FilterNode::Const(true),
                (Operator::In, 1) => {
                    normalize_filter(&FilterNode::eq(c.field.clone(), values.remove(0)))
                }
                _ => FilterNode::condition(c.field.clone(), c.op, Value::List(values)),
            }
        }
        _ => FilterNode::Condition(c.clone()),
    }
}

fn normalize_group(children: &[FilterNode], is_and: bool) -> FilterNode {
    // identity element is dropped, absorbing element short-circuits
    let absorbing = !is_and;
    let mut flat: Vec<FilterNode> = Vec::with_capacity(children.len());

    for child in children {
        match normalize_filter(child) {
            FilterNode::Const(b) if b == absorbing => return FilterNode::Const(absorbing),
            FilterNode::Const(_) => {}
            FilterNode::And(grand) if is_and => flat.extend(grand),
            FilterNode::Or(grand) if !is_and => flat.extend(grand),
            other => flat.push(other),
        }
    }

    if is_and && has_conflicting_equalities(&flat) {
        return FilterNode::Const(false);
    }

    let mut keyed: Vec<(Vec<u8>, FilterNode)> =
        flat.into_iter().map(|n| (node_bytes(&n), n)).collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.dedup_by(|a, b| a.0 == b.0);
    let mut nodes: Vec<FilterNode> = keyed.into_iter().map(|(_, n)| n).collect();

    match nodes.len() {
        0 => FilterNode::Const(is_and),
        1 => nodes.remove(0),
        _ if is_and => FilterNode::And(nodes),
        _ => FilterNode::Or(nodes),
    }
}

fn has_conflicting_equalities(conjuncts: &[FilterNode]) -> bool {
    let mut equalities: BTreeMap<&str, &Value> = BTreeMap::new();
    for node in conjuncts {
        if let FilterNode::Condition(c) = node {
            if c.op == Operator::Eq && !c.value.is_null() {
                if let Some(previous) = equalities.insert(c.field.as_str(), &c.value) {
                    if !previous.loose_eq(&c.value) && previous.compare(&c.value).is_some() {
                        return true;
                    }
                }
            }
        }
    }
    false
}
