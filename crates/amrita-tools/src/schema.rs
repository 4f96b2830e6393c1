// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, thiserror::Error)]
#[error("tool arguments violate schema: {0}")]
pub struct SchemaViolation(pub String);

/// The JSON-Schema subset honored for tool parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

/// One property in a tool's parameters object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Closed set of admissible values.
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Element schema for `array` properties.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<PropertySchema>>,
    /// Nested properties for `object` properties.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, PropertySchema>,
}

impl PropertySchema {
    pub fn new(param_type: ParamType, description: impl Into<String>) -> Self {
        Self {
            param_type,
            description: description.into(),
            enum_values: Vec::new(),
            default: None,
            items: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn string(description: impl Into<String>) -> Self {
        Self::new(ParamType::String, description)
    }

    pub fn number(description: impl Into<String>) -> Self {
        Self::new(ParamType::Number, description)
    }

    pub fn boolean(description: impl Into<String>) -> Self {
        Self::new(ParamType::Boolean, description)
    }
}

fn object_type() -> String {
    "object".into()
}

/// The parameters block of a function definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParametersSchema {
    #[serde(rename = "type", default = "object_type")]
    pub schema_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

impl Default for ParametersSchema {
    fn default() -> Self {
        Self {
            schema_type: object_type(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }
}

impl ParametersSchema {
    pub fn with_property(mut self, name: impl Into<String>, prop: PropertySchema, required: bool) -> Self {
        let name = name.into();
        if required {
            self.required.push(name.clone());
        }
        self.properties.insert(name, prop);
        self
    }
}

/// A complete function-calling tool definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinitionSchema {
    pub name: String,
    pub description: String,
    pub parameters: ParametersSchema,
}

impl FunctionDefinitionSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: ParametersSchema::default(),
        }
    }

    pub fn with_parameters(mut self, parameters: ParametersSchema) -> Self {
        self.parameters = parameters;
        self
    }

    /// The adapter-facing mirror of this definition.
    pub fn to_tool_schema(&self) -> amrita_model::ToolSchema {
        amrita_model::ToolSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: serde_json::to_value(&self.parameters)
                .unwrap_or_else(|_| serde_json::json!({ "type": "object" })),
        }
    }
}

// ─── Validation ───────────────────────────────────────────────────────────────

/// Validate parsed tool arguments against a parameters schema.
///
/// Checks: arguments are an object; every `required` field is present; every
/// present field matches its declared type; `enum` membership holds.  Extra
/// fields not named in the schema pass through untouched.
pub fn validate_args(schema: &ParametersSchema, args: &Value) -> Result<(), SchemaViolation> {
    let obj = args
        .as_object()
        .ok_or_else(|| SchemaViolation("arguments must be a JSON object".into()))?;

    for name in &schema.required {
        if !obj.contains_key(name) {
            return Err(SchemaViolation(format!("missing required field `{name}`")));
        }
    }

    for (name, value) in obj {
        if let Some(prop) = schema.properties.get(name) {
            validate_value(name, prop, value)?;
        }
    }
    Ok(())
}

fn validate_value(name: &str, prop: &PropertySchema, value: &Value) -> Result<(), SchemaViolation> {
    let ok = match prop.param_type {
        ParamType::String => value.is_string(),
        ParamType::Number => value.is_number(),
        ParamType::Integer => value.is_i64() || value.is_u64(),
        ParamType::Boolean => value.is_boolean(),
        ParamType::Array => value.is_array(),
        ParamType::Object => value.is_object(),
    };
    if !ok {
        return Err(SchemaViolation(format!(
            "field `{name}` must be of type {:?}",
            prop.param_type
        )));
    }

    if !prop.enum_values.is_empty() && !prop.enum_values.contains(value) {
        return Err(SchemaViolation(format!(
            "field `{name}` must be one of {:?}",
            prop.enum_values
        )));
    }

    if let (ParamType::Array, Some(items)) = (prop.param_type, prop.items.as_deref()) {
        for (i, item) in value.as_array().into_iter().flatten().enumerate() {
            validate_value(&format!("{name}[{i}]"), items, item)?;
        }
    }

    if prop.param_type == ParamType::Object && !prop.properties.is_empty() {
        for (k, v) in value.as_object().into_iter().flatten() {
            if let Some(nested) = prop.properties.get(k) {
                validate_value(&format!("{name}.{k}"), nested, v)?;
            }
        }
    }

    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
