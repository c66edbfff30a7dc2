//! Schema-driven request validation.
//!
//! Schemas are registered by name; validation walks the decoded JSON value
//! and stops at the first violation. Unknown payload properties are ignored
//! (lenient mode); an unknown schema name fails immediately.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;

use crate::domain::models::{
    PropertyFormat, PropertyRule, PropertyType, Schema, ValidationError,
};

/// Maximum nesting depth of array `items` recursion.
const MAX_DEPTH: usize = 10;
/// Global body-size cap applied when a schema does not set its own.
pub const GLOBAL_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Validator holding all registered schemas.
pub struct RequestValidator {
    schemas: HashMap<String, Schema>,
    email_pattern: Regex,
}

impl Default for RequestValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestValidator {
    pub fn new() -> Self {
        Self {
            schemas: HashMap::new(),
            email_pattern: Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static email pattern"),
        }
    }

    /// Validator pre-loaded with the gateway's request schemas.
    pub fn with_gateway_schemas() -> Self {
        let mut validator = Self::new();
        validator.register(
            Schema::new("ingest_event")
                .require(
                    "id",
                    PropertyRule::typed(PropertyType::String).with_format(PropertyFormat::Uuid),
                )
                .require(
                    "timestamp",
                    PropertyRule::typed(PropertyType::Integer).with_bounds(Some(0.0), None),
                )
                .require(
                    "type",
                    PropertyRule::typed(PropertyType::String)
                        .with_enum(&["security", "network", "system", "application"]),
                )
                .require(
                    "severity",
                    PropertyRule::typed(PropertyType::String)
                        .with_enum(&["low", "medium", "high", "critical"]),
                )
                .optional("source", PropertyRule::typed(PropertyType::String))
                .optional("payload", PropertyRule::typed(PropertyType::Object)),
        );
        validator.register(
            Schema::new("threat_report")
                .require(
                    "threat_id",
                    PropertyRule::typed(PropertyType::String).with_format(PropertyFormat::Uuid),
                )
                .require(
                    "detected_at",
                    PropertyRule::typed(PropertyType::Integer).with_bounds(Some(0.0), None),
                )
                .require(
                    "confidence",
                    PropertyRule::typed(PropertyType::Number).with_bounds(Some(0.0), Some(1.0)),
                )
                .optional(
                    "indicators",
                    {
                        let mut rule = PropertyRule::typed(PropertyType::Array);
                        rule.items = Some(Box::new(PropertyRule::typed(PropertyType::String)));
                        rule
                    },
                ),
        );
        validator
    }

    pub fn register(&mut self, schema: Schema) {
        self.schemas.insert(schema.name.clone(), schema);
    }

    /// Body-size cap for a schema; falls back to the global cap.
    pub fn max_size(&self, schema_name: &str) -> usize {
        self.schemas
            .get(schema_name)
            .map(|s| if s.max_size == 0 { GLOBAL_MAX_BODY_BYTES } else { s.max_size })
            .unwrap_or(GLOBAL_MAX_BODY_BYTES)
    }

    /// Validate a payload against a named schema. Fail-fast: the first
    /// violation is returned and the walk stops.
    pub fn validate(&self, schema_name: &str, payload: &Value) -> Result<(), ValidationError> {
        let schema = self.schemas.get(schema_name).ok_or_else(|| {
            ValidationError::new("$schema", format!("unknown schema '{schema_name}'"), None)
        })?;

        let object = payload.as_object().ok_or_else(|| {
            ValidationError::new("$", "payload must be a JSON object", Some(payload.clone()))
        })?;

        for field in &schema.required {
            if !object.contains_key(field) {
                return Err(ValidationError::new(
                    field.clone(),
                    "required field is missing",
                    None,
                ));
            }
        }

        for (field, rule) in &schema.properties {
            if let Some(value) = object.get(field) {
                self.check_value(field, value, rule, 0)?;
            }
        }

        Ok(())
    }

    fn check_value(
        &self,
        field: &str,
        value: &Value,
        rule: &PropertyRule,
        depth: usize,
    ) -> Result<(), ValidationError> {
        if depth > MAX_DEPTH {
            return Err(ValidationError::new(
                field,
                format!("nesting exceeds maximum depth {MAX_DEPTH}"),
                None,
            ));
        }

        if let Some(expected) = rule.prop_type {
            self.check_type(field, value, expected)?;
        }

        if let Some(s) = value.as_str() {
            if let Some(min) = rule.min_length {
                if s.chars().count() < min {
                    return Err(ValidationError::new(
                        field,
                        format!("shorter than minimum length {min}"),
                        Some(value.clone()),
                    ));
                }
            }
            if let Some(max) = rule.max_length {
                if s.chars().count() > max {
                    return Err(ValidationError::new(
                        field,
                        format!("longer than maximum length {max}"),
                        Some(value.clone()),
                    ));
                }
            }
            if let Some(pattern) = &rule.pattern {
                let anchored = format!("^(?:{pattern})$");
                let re = Regex::new(&anchored).map_err(|e| {
                    ValidationError::new(field, format!("invalid schema pattern: {e}"), None)
                })?;
                if !re.is_match(s) {
                    return Err(ValidationError::new(
                        field,
                        "does not match required pattern",
                        Some(value.clone()),
                    ));
                }
            }
            if !rule.allowed.is_empty() && !rule.allowed.iter().any(|a| a == s) {
                return Err(ValidationError::new(
                    field,
                    format!("must be one of: {}", rule.allowed.join(", ")),
                    Some(value.clone()),
                ));
            }
            if let Some(format) = rule.format {
                self.check_format(field, s, format)?;
            }
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = rule.minimum {
                if n < min {
                    return Err(ValidationError::new(
                        field,
                        format!("below minimum {min}"),
                        Some(value.clone()),
                    ));
                }
            }
            if let Some(max) = rule.maximum {
                if n > max {
                    return Err(ValidationError::new(
                        field,
                        format!("above maximum {max}"),
                        Some(value.clone()),
                    ));
                }
            }
        }

        if let (Some(items), Some(array)) = (&rule.items, value.as_array()) {
            for (i, element) in array.iter().enumerate() {
                self.check_value(&format!("{field}[{i}]"), element, items, depth + 1)?;
            }
        }

        Ok(())
    }

    fn check_type(
        &self,
        field: &str,
        value: &Value,
        expected: PropertyType,
    ) -> Result<(), ValidationError> {
        let ok = match expected {
            PropertyType::String => value.is_string(),
            PropertyType::Number => value.is_number(),
            // Integers reject floats with a fractional part; 3.0 passes.
            PropertyType::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            PropertyType::Boolean => value.is_boolean(),
            PropertyType::Array => value.is_array(),
            PropertyType::Object => value.is_object(),
        };
        if ok {
            Ok(())
        } else {
            let name = match expected {
                PropertyType::String => "string",
                PropertyType::Number => "number",
                PropertyType::Integer => "integer",
                PropertyType::Boolean => "boolean",
                PropertyType::Array => "array",
                PropertyType::Object => "object",
            };
            Err(ValidationError::new(
                field,
                format!("expected {name}"),
                Some(value.clone()),
            ))
        }
    }

    fn check_format(
        &self,
        field: &str,
        value: &str,
        format: PropertyFormat,
    ) -> Result<(), ValidationError> {
        let ok = match format {
            PropertyFormat::Uuid => uuid::Uuid::parse_str(value).is_ok(),
            PropertyFormat::Email => self.email_pattern.is_match(value),
            PropertyFormat::Url => url::Url::parse(value).is_ok(),
            PropertyFormat::Ipv4 => value.parse::<std::net::Ipv4Addr>().is_ok(),
            PropertyFormat::Ipv6 => value.parse::<std::net::Ipv6Addr>().is_ok(),
            PropertyFormat::DateTime => chrono::DateTime::parse_from_rfc3339(value).is_ok(),
        };
        if ok {
            Ok(())
        } else {
            let name = match format {
                PropertyFormat::Uuid => "uuid",
                PropertyFormat::Email => "email",
                PropertyFormat::Url => "url",
                PropertyFormat::Ipv4 => "ipv4",
                PropertyFormat::Ipv6 => "ipv6",
                PropertyFormat::DateTime => "date-time",
            };
            Err(ValidationError::new(
                field,
                format!("not a valid {name}"),
                Some(Value::String(value.to_string())),
            ))
        }
    }
}
