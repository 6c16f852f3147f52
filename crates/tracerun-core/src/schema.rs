//! Explicit I/O schema descriptors for node contracts.
//!
//! Schemas are plain data values, not reflected types: the wrapper validates
//! every node input and output against them at runtime, so the contract
//! behaves identically regardless of what concrete types a node uses
//! internally.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SchemaViolation;

/// Field names every node input carries; injected by the wrapper, so they
/// are declared optional for validation purposes.
pub const TRACE_ID_FIELD: &str = "trace_id";
pub const CONTEXT_TAGS_FIELD: &str = "context_tags";

/// Field names every node output carries; attached by the wrapper after
/// output validation.
pub const EXECUTION_TIMESTAMP_FIELD: &str = "execution_timestamp";
pub const NODE_META_FIELD: &str = "node_meta";

static BASE_INPUT_FIELDS: Lazy<Vec<FieldSpec>> = Lazy::new(|| {
    vec![
        FieldSpec::optional(TRACE_ID_FIELD, FieldType::String),
        FieldSpec::optional(CONTEXT_TAGS_FIELD, FieldType::List),
    ]
});

static BASE_OUTPUT_FIELDS: Lazy<Vec<FieldSpec>> = Lazy::new(|| {
    vec![
        FieldSpec::optional(EXECUTION_TIMESTAMP_FIELD, FieldType::Timestamp),
        FieldSpec::optional(NODE_META_FIELD, FieldType::Object),
    ]
});

/// Runtime type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Bool,
    List,
    Object,
    /// RFC 3339 timestamp carried as a JSON string.
    Timestamp,
    Any,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Bool => "bool",
            FieldType::List => "list",
            FieldType::Object => "object",
            FieldType::Timestamp => "timestamp",
            FieldType::Any => "any",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.as_i64().is_some() || value.as_u64().is_some(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::List => value.is_array(),
            FieldType::Object => value.is_object(),
            FieldType::Timestamp => value
                .as_str()
                .map(|raw| DateTime::parse_from_rfc3339(raw).is_ok())
                .unwrap_or(false),
            FieldType::Any => true,
        }
    }
}

/// One named field in a schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub ty: FieldType,
    pub required: bool,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: false,
        }
    }
}

/// A node input or output contract.
///
/// Tolerant by default: keys not named in the schema pass through untouched.
/// `strict()` rejects them instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<FieldSpec>,
    strict: bool,
}

impl Schema {
    /// Input schema seeded with the base input fields.
    pub fn input() -> Self {
        Self {
            fields: BASE_INPUT_FIELDS.clone(),
            strict: false,
        }
    }

    /// Output schema seeded with the base output fields.
    pub fn output() -> Self {
        Self {
            fields: BASE_OUTPUT_FIELDS.clone(),
            strict: false,
        }
    }

    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push(FieldSpec::required(name, ty));
        self
    }

    pub fn optional_field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push(FieldSpec::optional(name, ty));
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn validate(&self, value: &Value) -> Result<(), SchemaViolation> {
        let map = value.as_object().ok_or_else(|| {
            SchemaViolation::new(None, format!("expected a JSON object, got {}", kind_of(value)))
        })?;

        for field in &self.fields {
            match map.get(&field.name) {
                Some(found) => {
                    if !field.ty.matches(found) {
                        return Err(SchemaViolation::new(
                            Some(field.name.clone()),
                            format!("expected {}, got {}", field.ty.as_str(), kind_of(found)),
                        ));
                    }
                }
                None if field.required => {
                    return Err(SchemaViolation::new(
                        Some(field.name.clone()),
                        "required field missing",
                    ));
                }
                None => {}
            }
        }

        if self.strict {
            for key in map.keys() {
                if !self.fields.iter().any(|field| &field.name == key) {
                    return Err(SchemaViolation::new(
                        Some(key.clone()),
                        "unknown field rejected by strict schema",
                    ));
                }
            }
        }

        Ok(())
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Metadata the wrapper attaches to every node output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMeta {
    pub node_name: String,
    pub version: String,
    pub tags: Vec<String>,
    pub replay_trace_id: Option<String>,
    pub runtime_timestamp: DateTime<Utc>,
}
