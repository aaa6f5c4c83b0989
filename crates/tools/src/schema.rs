//! Tool schema types
//!
//! JSON-Schema-shaped declarations the LLM adapter serializes into the
//! provider's tool format. Validation covers required fields and the
//! primitive property types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ToolError;

/// Tool declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Tool name
    pub name: String,
    /// Tool description shown to the model
    pub description: String,
    /// Input schema
    pub input_schema: InputSchema,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: InputSchema::object(),
        }
    }

    pub fn with_input(mut self, input_schema: InputSchema) -> Self {
        self.input_schema = input_schema;
        self
    }

    /// Validate a parameter value against this schema
    pub fn validate(&self, input: &Value) -> Result<(), ToolError> {
        let obj = match input {
            Value::Object(obj) => obj,
            Value::Null if self.input_schema.properties.is_empty() => return Ok(()),
            _ => {
                return Err(ToolError::InvalidParams(
                    "parameters must be a JSON object".to_string(),
                ))
            }
        };

        for required in &self.input_schema.required {
            if !obj.contains_key(required) {
                return Err(ToolError::InvalidParams(format!(
                    "missing required field '{}'",
                    required
                )));
            }
        }

        for (key, value) in obj {
            let Some(prop) = self.input_schema.properties.get(key) else {
                continue;
            };
            prop.check(key, value)?;
        }

        Ok(())
    }
}

/// Object input schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(rename = "type")]
    pub schema_type: String,
    #[serde(default)]
    pub properties: HashMap<String, PropertySchema>,
    #[serde(default)]
    pub required: Vec<String>,
}

impl InputSchema {
    pub fn object() -> Self {
        Self {
            schema_type: "object".to_string(),
            properties: HashMap::new(),
            required: Vec::new(),
        }
    }

    pub fn property(mut self, name: &str, schema: PropertySchema, required: bool) -> Self {
        self.properties.insert(name.to_string(), schema);
        if required {
            self.required.push(name.to_string());
        }
        self
    }
}

/// Property schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub prop_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
}

impl PropertySchema {
    pub fn string(description: impl Into<String>) -> Self {
        Self {
            prop_type: "string".to_string(),
            description: Some(description.into()),
            enum_values: None,
        }
    }

    pub fn number(description: impl Into<String>) -> Self {
        Self {
            prop_type: "number".to_string(),
            description: Some(description.into()),
            enum_values: None,
        }
    }

    pub fn boolean(description: impl Into<String>) -> Self {
        Self {
            prop_type: "boolean".to_string(),
            description: Some(description.into()),
            enum_values: None,
        }
    }

    pub fn enum_type(description: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            prop_type: "string".to_string(),
            description: Some(description.into()),
            enum_values: Some(values),
        }
    }

    fn check(&self, key: &str, value: &Value) -> Result<(), ToolError> {
        let ok = match self.prop_type.as_str() {
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            _ => true,
        };
        if !ok {
            return Err(ToolError::InvalidParams(format!(
                "field '{}' must be of type {}",
                key, self.prop_type
            )));
        }

        if let (Some(values), Some(s)) = (&self.enum_values, value.as_str()) {
            if !values.iter().any(|v| v == s) {
                return Err(ToolError::InvalidParams(format!(
                    "field '{}' must be one of {:?}",
                    key, values
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ToolSchema {
        ToolSchema::new("confirm_appointment", "Confirm an appointment").with_input(
            InputSchema::object()
                .property("date", PropertySchema::string("Date"), true)
                .property("time", PropertySchema::string("Time"), true)
                .property("reminder", PropertySchema::boolean("Send reminder"), false),
        )
    }

    #[test]
    fn test_validate_happy() {
        let s = schema();
        assert!(s
            .validate(&json!({"date": "Tuesday", "time": "3pm"}))
            .is_ok());
    }

    #[test]
    fn test_validate_missing_required() {
        let s = schema();
        let err = s.validate(&json!({"date": "Tuesday"})).unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams(_)));
    }

    #[test]
    fn test_validate_wrong_type() {
        let s = schema();
        let err = s
            .validate(&json!({"date": "Tuesday", "time": 3, "reminder": true}))
            .unwrap_err();
        assert!(err.to_string().contains("time"));
    }

    #[test]
    fn test_validate_non_object() {
        let s = schema();
        assert!(s.validate(&json!("nope")).is_err());
    }

    #[test]
    fn test_zero_arg_tool_accepts_empty_and_null() {
        let s = ToolSchema::new("end_call", "End the call");
        assert!(s.validate(&json!({})).is_ok());
        assert!(s.validate(&Value::Null).is_ok());
    }

    #[test]
    fn test_enum_values() {
        let s = ToolSchema::new("set_mode", "Set mode").with_input(InputSchema::object().property(
            "mode",
            PropertySchema::enum_type("Mode", vec!["fast".into(), "slow".into()]),
            true,
        ));
        assert!(s.validate(&json!({"mode": "fast"})).is_ok());
        assert!(s.validate(&json!({"mode": "sideways"})).is_err());
    }
}
