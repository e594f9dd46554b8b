//! Index hint selection.
//!
//! An index is usable when a leading run of its fields is constrained by
//! top-level conjuncts: equality on a prefix, optionally followed by one range
//! constraint. Indexes that only serve the leading sort key are hinted for
//! ordering. Hints are ranked most selective first; adapters are free to
//! ignore them.

use std::collections::HashSet;

use metagate_proto::{FilterNode, QueryAst};

use crate::catalog::{IndexDef, ObjectDef};

/// How an index can serve the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexUsage {
    /// Every indexed field is pinned by equality.
    Lookup,
    /// A prefix is pinned; the scan may be bounded by a range.
    Range,
    /// The index only provides ordering.
    Sort,
}

/// Suggestion that an adapter use an index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexHint {
    /// Index name.
    pub index: String,
    /// Leading index fields the query constrains.
    pub covered_fields: Vec<String>,
    /// Usage kind.
    pub usage: IndexUsage,
    /// Whether the index is unique.
    pub unique: bool,
}

/// Rank the object's indexes for a normalized query.
pub fn select_index_hints(def: &ObjectDef, ast: &QueryAst) -> Vec<IndexHint> {
    let (equalities, ranges) = constrained_fields(ast.filter.as_ref());
    let leading_sort = ast.sort.first().map(|k| k.field.as_str());

    let mut scored: Vec<(u32, IndexHint)> = def
        .indexes
        .iter()
        .filter_map(|index| score(index, &equalities, &ranges, leading_sort))
        .collect();

    scored.sort_by(|(sa, a), (sb, b)| {
        sb.cmp(sa)
            .then_with(|| index_width(def, &a.index).cmp(&index_width(def, &b.index)))
            .then_with(|| a.index.cmp(&b.index))
    });
    scored.into_iter().map(|(_, hint)| hint).collect()
}

fn index_width(def: &ObjectDef, name: &str) -> usize {
    def.get_index(name).map_or(usize::MAX, |i| i.fields.len())
}

fn score(
    index: &IndexDef,
    equalities: &HashSet<&str>,
    ranges: &HashSet<&str>,
    leading_sort: Option<&str>,
) -> Option<(u32, IndexHint)> {
    let eq_prefix = index
        .fields
        .iter()
        .take_while(|f| equalities.contains(f.as_str()))
        .count();
    let range = index
        .fields
        .get(eq_prefix)
        .is_some_and(|f| ranges.contains(f.as_str()));

    let covered = eq_prefix + usize::from(range);
    if covered == 0 {
        let sorts = leading_sort.is_some_and(|s| index.fields[0] == s);
        return sorts.then(|| {
            (
                1,
                IndexHint {
                    index: index.name.clone(),
                    covered_fields: vec![index.fields[0].clone()],
                    usage: IndexUsage::Sort,
                    unique: index.unique,
                },
            )
        });
    }

    let full_lookup = eq_prefix == index.fields.len();
    let usage = if full_lookup {
        IndexUsage::Lookup
    } else {
        IndexUsage::Range
    };

    // unique point lookups beat everything; equality beats range
    let mut points = (eq_prefix as u32) * 10 + if range { 5 } else { 0 };
    if full_lookup && index.unique {
        points += 1000;
    } else if full_lookup {
        points += 100;
    }

    Some((
        points,
        IndexHint {
            index: index.name.clone(),
            covered_fields: index.fields[..covered].to_vec(),
            usage,
            unique: index.unique,
        },
    ))
}

/// Fields pinned by equality and fields bounded by a range among the
/// top-level conjuncts of a normalized filter.
fn constrained_fields(filter: Option<&FilterNode>) -> (HashSet<&str>, HashSet<&str>) {
    let mut equalities = HashSet::new();
    let mut ranges = HashSet::new();

    let conjuncts: &[FilterNode] = match filter {
        Some(FilterNode::And(children)) => children,
        Some(node) => std::slice::from_ref(node),
        None => &[],
    };

    for node in conjuncts {
        if let FilterNode::Condition(c) = node {
            if c.op.is_equality() {
                equalities.insert(c.field.as_str());
            } else if c.op.is_range() {
                ranges.insert(c.field.as_str());
            }
        }
    }
    (equalities, ranges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FieldDef, FieldType};
    use metagate_proto::SortKey;

    fn invoice() -> ObjectDef {
        ObjectDef::new("invoice", "billing")
            .with_field(FieldDef::new("id", FieldType::Uuid))
            .with_field(FieldDef::new("owner_id", FieldType::Text))
            .with_field(FieldDef::new("status", FieldType::Text))
            .with_field(FieldDef::new("created_at", FieldType::DateTime))
            .with_index(IndexDef::unique("pk", vec!["id".into()]))
            .with_index(IndexDef::new("by_owner", vec!["owner_id".into()]))
            .with_index(IndexDef::new(
                "by_owner_status",
                vec!["owner_id".into(), "status".into()],
            ))
            .with_index(IndexDef::new(
                "by_status_created",
                vec!["status".into(), "created_at".into()],
            ))
    }

    fn names(hints: &[IndexHint]) -> Vec<&str> {
        hints.iter().map(|h| h.index.as_str()).collect()
    }

    #[test]
    fn test_composite_preferred() {
        let ast = QueryAst::new().with_filter(FilterNode::and(vec![
            FilterNode::eq("owner_id", "U1"),
            FilterNode::eq("status", "open"),
        ]));
        let hints = select_index_hints(&invoice(), &ast);

        assert_eq!(hints[0].index, "by_owner_status");
        assert_eq!(hints[0].usage, IndexUsage::Lookup);
        assert_eq!(hints[0].covered_fields, vec!["owner_id".to_string(), "status".to_string()]);
        assert_eq!(names(&hints), vec!["by_owner_status", "by_owner", "by_status_created"]);
    }

    #[test]
    fn test_unique_lookup_wins() {
        let ast = QueryAst::new().with_filter(FilterNode::and(vec![
            FilterNode::eq("id", "i-1"),
            FilterNode::eq("owner_id", "U1"),
            FilterNode::eq("status", "open"),
        ]));
        assert_eq!(select_index_hints(&invoice(), &ast)[0].index, "pk");
    }

    #[test]
    fn test_range_after_prefix() {
        let ast = QueryAst::new().with_filter(FilterNode::and(vec![
            FilterNode::eq("status", "open"),
            FilterNode::gt("created_at", 100),
        ]));
        let hints = select_index_hints(&invoice(), &ast);
        assert_eq!(hints[0].index, "by_status_created");
        assert_eq!(hints[0].usage, IndexUsage::Range);
        assert_eq!(hints[0].covered_fields.len(), 2);
    }

    #[test]
    fn test_or_branches_not_used() {
        let ast = QueryAst::new().with_filter(FilterNode::or(vec![
            FilterNode::eq("owner_id", "U1"),
            FilterNode::eq("status", "open"),
        ]));
        assert!(select_index_hints(&invoice(), &ast).is_empty());
    }

    #[test]
    fn test_sort_only_hint() {
        let ast = QueryAst::new().with_sort(SortKey::asc("status"));
        let hints = select_index_hints(&invoice(), &ast);
        assert_eq!(names(&hints), vec!["by_status_created"]);
        assert_eq!(hints[0].usage, IndexUsage::Sort);
    }
}
