//! Declarative request schemas.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON value types a property may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    String,
    Number,
    /// Accepts JSON numbers with no fractional part only.
    Integer,
    Boolean,
    Array,
    Object,
}

/// Well-known string formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PropertyFormat {
    Uuid,
    Email,
    Url,
    Ipv4,
    Ipv6,
    DateTime,
}

/// Constraints on a single property.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropertyRule {
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "type")]
    pub prop_type: Option<PropertyType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    /// Anchored automatically; a value must match the whole pattern.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "enum")]
    pub allowed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<PropertyFormat>,
    /// Element constraints for arrays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<PropertyRule>>,
}

impl PropertyRule {
    pub fn typed(prop_type: PropertyType) -> Self {
        Self {
            prop_type: Some(prop_type),
            ..Default::default()
        }
    }

    pub fn with_format(mut self, format: PropertyFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_enum(mut self, values: &[&str]) -> Self {
        self.allowed = values.iter().map(|v| (*v).to_string()).collect();
        self
    }

    pub fn with_bounds(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.minimum = min;
        self.maximum = max;
        self
    }
}

/// A named request schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub properties: HashMap<String, PropertyRule>,
    /// Pre-parse body size guard in bytes; 0 means the global cap applies.
    #[serde(default)]
    pub max_size: usize,
}

impl Schema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn require(mut self, field: &str, rule: PropertyRule) -> Self {
        self.required.push(field.to_string());
        self.properties.insert(field.to_string(), rule);
        self
    }

    pub fn optional(mut self, field: &str, rule: PropertyRule) -> Self {
        self.properties.insert(field.to_string(), rule);
        self
    }
}

/// First violation found while walking a payload. The walk is fail-fast:
/// exactly one violation is reported per invalid payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>, value: Option<Value>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            value,
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
