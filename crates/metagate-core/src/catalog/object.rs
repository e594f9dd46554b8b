//! Object, field and index definitions.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Field data types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    /// UTF-8 text.
    Text,
    /// 64-bit signed integer.
    Integer,
    /// 64-bit floating point.
    Float,
    /// Boolean.
    Boolean,
    /// Timestamp.
    DateTime,
    /// UUID.
    Uuid,
    /// Binary data.
    Binary,
    /// Fixed set of allowed values.
    Select {
        /// Allowed values.
        options: Vec<String>,
    },
    /// Reference to a record of another object.
    Lookup {
        /// Name of the referenced object.
        target: String,
    },
}

impl FieldType {
    /// Reference to another object.
    pub fn lookup(target: impl Into<String>) -> Self {
        FieldType::Lookup {
            target: target.into(),
        }
    }

    /// Whether this is a relationship type.
    pub fn is_lookup(&self) -> bool {
        matches!(self, FieldType::Lookup { .. })
    }

    /// Whether values of this type are numeric.
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Integer | FieldType::Float)
    }
}

/// A field of an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name, unique within the object.
    pub name: String,
    /// Field data type.
    pub field_type: FieldType,
    /// Whether a value must be supplied.
    pub required: bool,
    /// Whether the value is derived rather than stored.
    pub computed: bool,
    /// Name of a validation rule evaluated by the validation engine.
    pub validation: Option<String>,
    /// Module that contributed this field through an extension, if any.
    pub contributed_by: Option<String>,
}

impl FieldDef {
    /// Create a required field.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            computed: false,
            validation: None,
            contributed_by: None,
        }
    }

    /// Create an optional field.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            required: false,
            ..Self::new(name, field_type)
        }
    }

    /// Mark the field as computed.
    pub fn computed(mut self) -> Self {
        self.computed = true;
        self.required = false;
        self
    }

    /// Attach a validation rule reference.
    pub fn with_validation(mut self, rule: impl Into<String>) -> Self {
        self.validation = Some(rule.into());
        self
    }
}

/// An index over one or more fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name, unique within the object.
    pub name: String,
    /// Indexed fields, in key order.
    pub fields: Vec<String>,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
}

impl IndexDef {
    /// Create a non-unique index.
    pub fn new(name: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            name: name.into(),
            fields,
            unique: false,
        }
    }

    /// Create a unique index.
    pub fn unique(name: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            unique: true,
            ..Self::new(name, fields)
        }
    }
}

/// How a CRUD denial is reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DenialMode {
    /// Fail with a permission error.
    #[default]
    Error,
    /// Reads return an empty result; mutations still fail.
    Hide,
}

/// An object definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDef {
    /// Object name, unique in the registry.
    pub name: String,
    /// Module that owns the definition.
    pub module: String,
    /// Fields in declaration order.
    pub fields: Vec<FieldDef>,
    /// Index definitions.
    pub indexes: Vec<IndexDef>,
    /// Objects this one depends on.
    pub depends_on: Vec<String>,
    /// Whether other modules may add fields.
    pub extensible: bool,
    /// Public objects skip permission checks.
    pub public: bool,
    /// How denials are reported.
    pub denial_mode: DenialMode,
    /// Field naming the record owner; falls back to the engine default.
    pub owner_field: Option<String>,
}

impl ObjectDef {
    /// Create an object definition owned by `module`.
    pub fn new(name: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
            fields: Vec::new(),
            indexes: Vec::new(),
            depends_on: Vec::new(),
            extensible: false,
            public: false,
            denial_mode: DenialMode::Error,
            owner_field: None,
        }
    }

    /// Add a field.
    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Add multiple fields.
    pub fn with_fields(mut self, fields: impl IntoIterator<Item = FieldDef>) -> Self {
        self.fields.extend(fields);
        self
    }

    /// Add an index.
    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    /// Declare a dependency on another object.
    pub fn depends_on(mut self, object: impl Into<String>) -> Self {
        self.depends_on.push(object.into());
        self
    }

    /// Allow other modules to extend this object.
    pub fn extensible(mut self) -> Self {
        self.extensible = true;
        self
    }

    /// Mark the object as public.
    pub fn public(mut self) -> Self {
        self.public = true;
        self
    }

    /// Return empty reads instead of errors on denial.
    pub fn hide_on_denial(mut self) -> Self {
        self.denial_mode = DenialMode::Hide;
        self
    }

    /// Set the owner field.
    pub fn with_owner_field(mut self, field: impl Into<String>) -> Self {
        self.owner_field = Some(field.into());
        self
    }

    /// Get a field by name.
    pub fn get_field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Whether a field exists.
    pub fn has_field(&self, name: &str) -> bool {
        self.get_field(name).is_some()
    }

    /// Field names in declaration order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Resolve a field path against this object.
    ///
    /// A plain name must be a field. A dotted path (`account.name`) must start
    /// with a lookup field; the remainder is resolved by the adapter.
    pub fn resolve_path(&self, path: &str) -> Result<&FieldDef> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };

        let field = self.get_field(head).ok_or_else(|| {
            Error::InvalidQuery(format!("unknown field '{}' on '{}'", head, self.name))
        })?;

        match rest {
            Some(rest) if rest.is_empty() || !field.field_type.is_lookup() => {
                Err(Error::InvalidQuery(format!(
                    "'{}' on '{}' cannot be traversed",
                    path, self.name
                )))
            }
            _ => Ok(field),
        }
    }

    /// Index by name.
    pub fn get_index(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidDefinition("object name is empty".into()));
        }
        if self.module.is_empty() {
            return Err(Error::InvalidDefinition(format!(
                "object '{}' has no owning module",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name.is_empty() || field.name.contains('.') {
                return Err(Error::InvalidDefinition(format!(
                    "invalid field name '{}' on '{}'",
                    field.name, self.name
                )));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(Error::InvalidDefinition(format!(
                    "field '{}' declared twice on '{}'",
                    field.name, self.name
                )));
            }
        }

        let mut index_names = HashSet::new();
        for index in &self.indexes {
            if !index_names.insert(index.name.as_str()) {
                return Err(Error::InvalidDefinition(format!(
                    "index '{}' declared twice on '{}'",
                    index.name, self.name
                )));
            }
            if index.fields.is_empty() {
                return Err(Error::InvalidDefinition(format!(
                    "index '{}' on '{}' has no fields",
                    index.name, self.name
                )));
            }
            if let Some(missing) = index.fields.iter().find(|f| !seen.contains(f.as_str())) {
                return Err(Error::InvalidDefinition(format!(
                    "index '{}' on '{}' references unknown field '{}'",
                    index.name, self.name, missing
                )));
            }
        }

        if let Some(owner) = &self.owner_field {
            if !seen.contains(owner.as_str()) {
                return Err(Error::InvalidDefinition(format!(
                    "owner field '{}' is not a field of '{}'",
                    owner, self.name
                )));
            }
        }

        Ok(())
    }
}
