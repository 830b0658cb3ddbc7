//! Tool definitions and argument validation
//!
//! A [`ToolDefinition`] is both the declaration sent to the model and the
//! schema used to validate and coerce the arguments the model sends back.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Number, Value};

use super::ToolError;

/// JSON type of a tool parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }
}

/// One named parameter of a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub description: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<Value>,
}

fn default_required() -> bool {
    true
}

impl ToolParameter {
    /// A required parameter
    pub fn new(name: impl Into<String>, param_type: ParamType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: description.into(),
            required: true,
            default: None,
            enum_values: Vec::new(),
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Make the parameter optional with a fallback value
    pub fn with_default(mut self, default: Value) -> Self {
        self.required = false;
        self.default = Some(default);
        self
    }

    pub fn with_enum<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.enum_values = values.into_iter().map(Into::into).collect();
        self
    }

    fn json_schema(&self) -> Value {
        let mut schema = json!({
            "type": self.param_type.as_str(),
            "description": self.description,
        });
        if !self.enum_values.is_empty() {
            schema["enum"] = Value::Array(self.enum_values.clone());
        }
        if let Some(default) = &self.default {
            schema["default"] = default.clone();
        }
        schema
    }

    /// Coerce `value` into this parameter's type, then check the enum.
    fn coerce(&self, value: Value) -> Result<Value, ToolError> {
        let coerced = coerce_value(self.param_type, value).map_err(|found| {
            ToolError::Validation(format!(
                "Parameter '{}' expects {}, got {}",
                self.name,
                self.param_type.as_str(),
                found
            ))
        })?;
        if !self.enum_values.is_empty() && !self.enum_values.contains(&coerced) {
            let allowed: Vec<String> = self.enum_values.iter().map(|v| v.to_string()).collect();
            return Err(ToolError::Validation(format!(
                "Parameter '{}' must be one of [{}], got {}",
                self.name,
                allowed.join(", "),
                coerced
            )));
        }
        Ok(coerced)
    }
}

/// Declaration of a tool: name, description and parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    pub fn param(mut self, parameter: ToolParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Reject definitions the registry cannot dispatch or validate.
    pub fn check(&self) -> Result<(), ToolError> {
        if self.name.trim().is_empty() {
            return Err(ToolError::InvalidDefinition("tool name is empty".into()));
        }
        for (i, parameter) in self.parameters.iter().enumerate() {
            if parameter.name.is_empty() {
                return Err(ToolError::InvalidDefinition(format!(
                    "tool '{}' has a parameter without a name",
                    self.name
                )));
            }
            if self.parameters[..i].iter().any(|p| p.name == parameter.name) {
                return Err(ToolError::InvalidDefinition(format!(
                    "tool '{}' declares parameter '{}' twice",
                    self.name, parameter.name
                )));
            }
        }
        Ok(())
    }

    /// JSON Schema object describing the parameters
    pub fn parameters_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .parameters
            .iter()
            .map(|p| (p.name.clone(), p.json_schema()))
            .collect();
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Function-calling declaration in the common `{"type": "function"}` shape
    pub fn to_function_json(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters_schema(),
            }
        })
    }

    /// Validate raw arguments against the declared parameters.
    ///
    /// Values are coerced to their declared types, defaults fill in missing
    /// optional parameters and undeclared arguments are dropped.
    pub fn validate(&self, arguments: &Value) -> Result<Map<String, Value>, ToolError> {
        let empty = Map::new();
        let provided = match arguments {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => {
                return Err(ToolError::Validation(format!(
                    "Arguments for '{}' must be a JSON object, got {}",
                    self.name,
                    type_name(other)
                )))
            }
        };

        for key in provided.keys() {
            if !self.parameters.iter().any(|p| &p.name == key) {
                tracing::debug!(tool = %self.name, argument = %key, "Dropping undeclared argument");
            }
        }

        let mut validated = Map::new();
        for parameter in &self.parameters {
            match provided.get(&parameter.name).filter(|v| !v.is_null()) {
                Some(value) => {
                    validated.insert(parameter.name.clone(), parameter.coerce(value.clone())?);
                }
                None => {
                    if let Some(default) = &parameter.default {
                        validated.insert(parameter.name.clone(), default.clone());
                    } else if parameter.required {
                        return Err(ToolError::Validation(format!(
                            "Missing required parameter '{}'",
                            parameter.name
                        )));
                    }
                }
            }
        }
        Ok(validated)
    }
}

/// Coerce `value` to `target`; on failure returns the found type name.
fn coerce_value(target: ParamType, value: Value) -> Result<Value, &'static str> {
    let found = type_name(&value);
    match (target, value) {
        (ParamType::String, Value::String(s)) => Ok(Value::String(s)),
        (ParamType::String, Value::Number(n)) => Ok(Value::String(n.to_string())),
        (ParamType::String, Value::Bool(b)) => Ok(Value::String(b.to_string())),

        (ParamType::Integer, Value::Number(n)) => integer_from_number(&n).ok_or(found),
        (ParamType::Integer, Value::String(s)) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                return Ok(Value::from(i));
            }
            s.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .and_then(|n| integer_from_number(&n))
                .ok_or(found)
        }

        (ParamType::Number, Value::Number(n)) => Ok(Value::Number(n)),
        (ParamType::Number, Value::String(s)) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                return Ok(Value::from(i));
            }
            s.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or(found)
        }

        (ParamType::Boolean, Value::Bool(b)) => Ok(Value::Bool(b)),
        (ParamType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(found),
        },

        (ParamType::Array, Value::Array(a)) => Ok(Value::Array(a)),
        (ParamType::Array, Value::String(s)) => match serde_json::from_str(&s) {
            Ok(Value::Array(a)) => Ok(Value::Array(a)),
            _ => Err(found),
        },

        (ParamType::Object, Value::Object(o)) => Ok(Value::Object(o)),
        (ParamType::Object, Value::String(s)) => match serde_json::from_str(&s) {
            Ok(Value::Object(o)) => Ok(Value::Object(o)),
            _ => Err(found),
        },

        _ => Err(found),
    }
}

fn integer_from_number(n: &Number) -> Option<Value> {
    if n.is_i64() || n.is_u64() {
        return Some(Value::Number(n.clone()));
    }
    let f = n.as_f64()?;
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(Value::from(f as i64))
    } else {
        None
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
