//! JSON filter syntax.
//!
//! Two shapes are accepted:
//!
//! - Array form: `["status", "=", "open"]` is a single condition; a list of
//!   conditions separated by optional `"and"` / `"or"` connectors combines
//!   them, with AND binding tighter than OR:
//!   `[["a", "=", 1], "or", ["b", "=", 2], ["c", ">", 3]]` is
//!   `a = 1 OR (b = 2 AND c > 3)`.
//! - Object form: `{"status": "open", "total": {"$gt": 10}}`, plus the
//!   `$and` / `$or` / `$not` combinators.

use serde_json::Value as Json;

use crate::error::{Error, Result};
use crate::query::{FilterNode, Operator};
use crate::value::Value;

impl FilterNode {
    /// Parse a filter from its JSON representation.
    pub fn from_json(json: &Json) -> Result<FilterNode> {
        match json {
            Json::Array(items) => parse_array(items),
            Json::Object(map) => parse_object(map),
            Json::Bool(b) => Ok(FilterNode::Const(*b)),
            other => Err(Error::InvalidFilter(format!(
                "expected array or object, got {}",
                other
            ))),
        }
    }
}

fn is_connector(json: &Json) -> Option<&str> {
    match json.as_str().map(str::to_ascii_lowercase).as_deref() {
        Some("and") => Some("and"),
        Some("or") => Some("or"),
        _ => None,
    }
}

fn parse_array(items: &[Json]) -> Result<FilterNode> {
    if is_triplet(items) {
        return parse_triplet(items);
    }

    let mut groups: Vec<Vec<FilterNode>> = vec![Vec::new()];
    for item in items {
        match is_connector(item) {
            Some("or") => groups.push(Vec::new()),
            Some(_) => {}
            None => {
                let node = FilterNode::from_json(item)?;
                if let Some(group) = groups.last_mut() {
                    group.push(node);
                }
            }
        }
    }

    let mut alternatives: Vec<FilterNode> = Vec::with_capacity(groups.len());
    for mut group in groups {
        match group.len() {
            0 => {
                return Err(Error::InvalidFilter(
                    "dangling connector in filter".to_string(),
                ))
            }
            1 => alternatives.extend(group.pop()),
            _ => alternatives.push(FilterNode::And(group)),
        }
    }

    if alternatives.len() == 1 {
        Ok(alternatives.remove(0))
    } else {
        Ok(FilterNode::Or(alternatives))
    }
}

fn is_triplet(items: &[Json]) -> bool {
    (items.len() == 3 || items.len() == 2)
        && items[0].is_string()
        && items[1].is_string()
        && is_connector(&items[0]).is_none()
}

fn parse_triplet(items: &[Json]) -> Result<FilterNode> {
    let field = items[0].as_str().unwrap_or_default();
    let op: Operator = items[1].as_str().unwrap_or_default().parse()?;
    let value = match items.get(2) {
        Some(json) => Value::from_json(json)?,
        None => Value::Null,
    };

    match (op, &value) {
        (Operator::IsNull | Operator::IsNotNull, _) => Ok(FilterNode::condition(field, op, Value::Null)),
        (Operator::Eq, Value::Null) => Ok(FilterNode::is_null(field)),
        (Operator::Ne, Value::Null) => Ok(FilterNode::is_not_null(field)),
        (Operator::In | Operator::NotIn, Value::List(_)) => Ok(FilterNode::condition(field, op, value)),
        (Operator::In | Operator::NotIn, other) => Err(Error::InvalidFilter(format!(
            "'{}' on '{}' expects a list, got {}",
            op,
            field,
            other.type_name()
        ))),
        _ if items.len() == 2 => Err(Error::InvalidFilter(format!(
            "operator '{}' on '{}' requires a value",
            op, field
        ))),
        _ => Ok(FilterNode::condition(field, op, value)),
    }
}

fn parse_object(map: &serde_json::Map<String, Json>) -> Result<FilterNode> {
    let mut conjuncts = Vec::with_capacity(map.len());

    for (key, value) in map {
        let node = match key.as_str() {
            "$and" | "$or" => {
                let items = value.as_array().ok_or_else(|| {
                    Error::InvalidFilter(format!("{} expects an array", key))
                })?;
                let children = items
                    .iter()
                    .map(FilterNode::from_json)
                    .collect::<Result<Vec<_>>>()?;
                if key == "$and" {
                    FilterNode::And(children)
                } else {
                    FilterNode::Or(children)
                }
            }
            "$not" => FilterNode::not(FilterNode::from_json(value)?),
            field => parse_field_object(field, value)?,
        };
        conjuncts.push(node);
    }

    if conjuncts.len() == 1 {
        Ok(conjuncts.remove(0))
    } else {
        Ok(FilterNode::And(conjuncts))
    }
}

fn parse_field_object(field: &str, value: &Json) -> Result<FilterNode> {
    let Json::Object(ops) = value else {
        let value = Value::from_json(value)?;
        return Ok(if value.is_null() {
            FilterNode::is_null(field)
        } else {
            FilterNode::eq(field, value)
        });
    };

    let mut conjuncts = Vec::with_capacity(ops.len());
    for (op, operand) in ops {
        let name = op.strip_prefix('$').ok_or_else(|| {
            Error::InvalidFilter(format!("operator keys must start with '$': {}", op))
        })?;
        let items = [
            Json::String(field.to_string()),
            Json::String(name.to_string()),
            operand.clone(),
        ];
        conjuncts.push(parse_triplet(&items)?);
    }

    match conjuncts.len() {
        0 => Err(Error::InvalidFilter(format!("empty operator object for '{}'", field))),
        1 => Ok(conjuncts.remove(0)),
        _ => Ok(FilterNode::And(conjuncts)),
    }
}
