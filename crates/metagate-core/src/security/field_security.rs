//! Field-level masking applied to result rows.

use std::collections::{BTreeMap, BTreeSet};

use metagate_proto::{Record, Value};

use crate::catalog::MaskingStrategy;

/// Which fields a role may see, and how hidden ones are presented.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldVisibility {
    /// Fields returned unchanged.
    pub visible: BTreeSet<String>,
    /// Hidden fields and their masking strategy.
    pub hidden: BTreeMap<String, MaskingStrategy>,
}

impl FieldVisibility {
    /// Whether a field path is visible. Dotted paths follow their first
    /// segment.
    pub fn is_visible(&self, path: &str) -> bool {
        self.visible.contains(head(path))
    }

    /// Masking for a hidden field path, `None` if visible or unknown.
    pub fn masking(&self, path: &str) -> Option<&MaskingStrategy> {
        self.hidden.get(head(path))
    }

    /// Fields among `paths` that are not visible. Unknown fields count as
    /// hidden so a refusal does not reveal which fields exist.
    pub fn hidden_among<'a>(&self, paths: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        paths
            .into_iter()
            .filter(|p| !self.is_visible(p))
            .map(str::to_string)
            .collect()
    }
}

fn head(path: &str) -> &str {
    path.split_once('.').map_or(path, |(h, _)| h)
}

/// Applies masking strategies to values and records.
pub struct FieldMasker;

impl FieldMasker {
    /// Mask a single value. `Omit` yields `None`.
    pub fn mask(value: &Value, strategy: &MaskingStrategy) -> Option<Value> {
        match strategy {
            MaskingStrategy::Omit => None,
            MaskingStrategy::Null => Some(Value::Null),
            MaskingStrategy::Redacted(placeholder) => Some(Value::String(placeholder.clone())),
            MaskingStrategy::Partial {
                visible_chars,
                from_end,
                mask_char,
            } => Some(Self::partial_mask(
                value,
                *visible_chars as usize,
                *from_end,
                *mask_char,
            )),
        }
    }

    /// Mask a record in place.
    ///
    /// Visible fields pass through, hidden fields are masked, and fields the
    /// object does not declare are dropped. Applying this twice yields the
    /// same record as applying it once.
    pub fn mask_record(record: Record, visibility: &FieldVisibility) -> Record {
        record
            .into_iter()
            .filter_map(|(name, value)| {
                if visibility.is_visible(&name) {
                    return Some((name, value));
                }
                let strategy = visibility.masking(&name)?;
                Self::mask(&value, strategy).map(|masked| (name, masked))
            })
            .collect()
    }

    /// Names of fields in `record` that masking would change.
    pub fn masked_fields(record: &Record, visibility: &FieldVisibility) -> Vec<String> {
        record
            .keys()
            .filter(|k| !visibility.is_visible(k))
            .cloned()
            .collect()
    }

    fn partial_mask(value: &Value, visible_chars: usize, from_end: bool, mask_char: char) -> Value {
        match value {
            Value::String(s) => {
                let chars: Vec<char> = s.chars().collect();
                let len = chars.len();
                if len <= visible_chars {
                    return Value::String(std::iter::repeat(mask_char).take(len).collect());
                }

                let masked_len = len - visible_chars;
                let out: String = if from_end {
                    std::iter::repeat(mask_char)
                        .take(masked_len)
                        .chain(chars[masked_len..].iter().copied())
                        .collect()
                } else {
                    chars[..visible_chars]
                        .iter()
                        .copied()
                        .chain(std::iter::repeat(mask_char).take(masked_len))
                        .collect()
                };
                Value::String(out)
            }
            _ => Value::Null,
        }
    }
}
