//! Structural plan keys.
//!
//! A plan key is the blake3 hash of the object name and the canonical byte
//! encoding of a normalized AST. Literal values are part of the encoding, so
//! two queries that differ only in a filter value (for example the user id
//! substituted by a row filter) never share a plan.

use std::fmt;

use metagate_proto::{
    AggregateFunction, Aggregation, FilterNode, Pagination, QueryAst, SortDirection, Value,
};

/// Cache key of a compiled plan.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlanKey([u8; 32]);

impl PlanKey {
    /// Hash an object name and a normalized AST.
    pub fn compute(object: &str, ast: &QueryAst) -> Self {
        let mut buf = Vec::with_capacity(128);
        encode_str(&mut buf, object);
        encode_ast(&mut buf, ast);
        PlanKey(*blake3::hash(&buf).as_bytes())
    }

    /// Raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PlanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PlanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PlanKey({})", hex::encode(&self.0[..8]))
    }
}

/// Canonical encoding of a filter node, used to order and dedupe siblings.
pub(crate) fn node_bytes(node: &FilterNode) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_node(&mut buf, node);
    buf
}

/// Canonical encoding of a value.
pub(crate) fn value_bytes(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_value(&mut buf, value);
    buf
}

fn encode_len(buf: &mut Vec<u8>, len: usize) {
    buf.extend_from_slice(&(len as u32).to_le_bytes());
}

fn encode_str(buf: &mut Vec<u8>, s: &str) {
    encode_len(buf, s.len());
    buf.extend_from_slice(s.as_bytes());
}

fn encode_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => buf.push(0),
        Value::Bool(b) => {
            buf.push(1);
            buf.push(*b as u8);
        }
        Value::Int64(i) => {
            buf.push(2);
            buf.extend_from_slice(&i.to_be_bytes());
        }
        Value::Float64(f) => {
            buf.push(3);
            let f = if *f == 0.0 { 0.0 } else { *f };
            let bits = if f.is_nan() { f64::NAN.to_bits() } else { f.to_bits() };
            buf.extend_from_slice(&bits.to_be_bytes());
        }
        Value::String(s) => {
            buf.push(4);
            encode_str(buf, s);
        }
        Value::Bytes(b) => {
            buf.push(5);
            encode_len(buf, b.len());
            buf.extend_from_slice(b);
        }
        Value::Timestamp(t) => {
            buf.push(6);
            buf.extend_from_slice(&t.to_be_bytes());
        }
        Value::Uuid(u) => {
            buf.push(7);
            buf.extend_from_slice(u);
        }
        Value::List(items) => {
            buf.push(8);
            encode_len(buf, items.len());
            for item in items {
                encode_value(buf, item);
            }
        }
    }
}

fn encode_node(buf: &mut Vec<u8>, node: &FilterNode) {
    match node {
        FilterNode::Condition(c) => {
            buf.push(b'C');
            encode_str(buf, &c.field);
            encode_str(buf, c.op.as_str());
            encode_value(buf, &c.value);
        }
        FilterNode::And(children) | FilterNode::Or(children) => {
            buf.push(if matches!(node, FilterNode::And(_)) { b'&' } else { b'|' });
            encode_len(buf, children.len());
            for child in children {
                encode_node(buf, child);
            }
        }
        FilterNode::Not(child) => {
            buf.push(b'!');
            encode_node(buf, child);
        }
        FilterNode::Formula(expression) => {
            buf.push(b'F');
            encode_str(buf, expression);
        }
        FilterNode::Const(b) => {
            buf.push(b'K');
            buf.push(*b as u8);
        }
    }
}

fn encode_pagination(buf: &mut Vec<u8>, pagination: &Pagination) {
    match pagination {
        Pagination::Offset { offset, limit } => {
            buf.push(b'o');
            buf.extend_from_slice(&offset.to_be_bytes());
            match limit {
                Some(limit) => {
                    buf.push(1);
                    buf.extend_from_slice(&limit.to_be_bytes());
                }
                None => buf.push(0),
            }
        }
        Pagination::Cursor { cursor, limit } => {
            buf.push(b'c');
            encode_str(buf, cursor);
            buf.extend_from_slice(&limit.to_be_bytes());
        }
    }
}

fn encode_aggregation(buf: &mut Vec<u8>, aggregation: &Aggregation) {
    encode_len(buf, aggregation.group_by.len());
    for key in &aggregation.group_by {
        encode_str(buf, key);
    }
    encode_len(buf, aggregation.measures.len());
    for measure in &aggregation.measures {
        buf.push(match measure.function {
            AggregateFunction::Count => 0,
            AggregateFunction::Sum => 1,
            AggregateFunction::Avg => 2,
            AggregateFunction::Min => 3,
            AggregateFunction::Max => 4,
        });
        encode_str(buf, measure.field.as_deref().unwrap_or(""));
        encode_str(buf, &measure.alias);
    }
    match &aggregation.having {
        Some(having) => {
            buf.push(1);
            encode_node(buf, having);
        }
        None => buf.push(0),
    }
}

fn encode_ast(buf: &mut Vec<u8>, ast: &QueryAst) {
    match &ast.filter {
        Some(filter) => {
            buf.push(1);
            encode_node(buf, filter);
        }
        None => buf.push(0),
    }

    encode_len(buf, ast.sort.len());
    for key in &ast.sort {
        encode_str(buf, &key.field);
        buf.push(match key.direction {
            SortDirection::Asc => 0,
            SortDirection::Desc => 1,
        });
    }

    match &ast.pagination {
        Some(pagination) => {
            buf.push(1);
            encode_pagination(buf, pagination);
        }
        None => buf.push(0),
    }

    match &ast.aggregation {
        Some(aggregation) => {
            buf.push(1);
            encode_aggregation(buf, aggregation);
        }
        None => buf.push(0),
    }

    match &ast.projection {
        Some(fields) => {
            buf.push(1);
            encode_len(buf, fields.len());
            for field in fields {
                encode_str(buf, field);
            }
        }
        None => buf.push(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metagate_proto::SortKey;

    #[test]
    fn test_same_query_same_key() {
        let ast = QueryAst::new()
            .with_filter(FilterNode::eq("status", "open"))
            .with_sort(SortKey::desc("created_at"));
        assert_eq!(PlanKey::compute("invoice", &ast), PlanKey::compute("invoice", &ast));
    }

    #[test]
    fn test_values_are_part_of_key() {
        let u1 = QueryAst::new().with_filter(FilterNode::eq("owner_id", "U1"));
        let u2 = QueryAst::new().with_filter(FilterNode::eq("owner_id", "U2"));
        assert_ne!(PlanKey::compute("invoice", &u1), PlanKey::compute("invoice", &u2));
    }

    #[test]
    fn test_object_is_part_of_key() {
        let ast = QueryAst::new();
        assert_ne!(PlanKey::compute("invoice", &ast), PlanKey::compute("account", &ast));
    }

    #[test]
    fn test_no_ambiguous_concatenation() {
        let a = QueryAst::new().with_filter(FilterNode::eq("ab", "c"));
        let b = QueryAst::new().with_filter(FilterNode::eq("a", "bc"));
        assert_ne!(PlanKey::compute("x", &a), PlanKey::compute("x", &b));
    }

    #[test]
    fn test_negative_zero_matches_zero() {
        assert_eq!(value_bytes(&Value::Float64(-0.0)), value_bytes(&Value::Float64(0.0)));
    }

    #[test]
    fn test_hex_display() {
        let key = PlanKey::compute("invoice", &QueryAst::new());
        assert_eq!(key.to_string().len(), 64);
    }
}
