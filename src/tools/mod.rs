//! Tools the model can call
//!
//! A tool is an async callable with a declared schema. The agent never
//! calls tools directly: it goes through the [`ToolRegistry`], which
//! validates arguments and turns every failure mode into a
//! [`ToolResult`] the model can read.
//!
//! ```text
//! ToolInvocation ──► ToolRegistry::execute
//!                       │ lookup      → "Tool 'x' not found"
//!                       │ validate    → ToolError::Validation
//!                       │ Tool::execute
//!                       │   Err / panic → ToolError::Execution
//!                       ▼
//!                    ToolResult { success, output | error }
//! ```

pub mod registry;
pub mod sandbox_tools;
pub mod schema;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::sandbox::SandboxError;

pub use registry::ToolRegistry;
pub use schema::{ParamType, ToolDefinition, ToolParameter};

/// Error type for tool registration and execution
#[derive(Debug)]
pub enum ToolError {
    /// Arguments failed schema validation or coercion
    Validation(String),
    /// The tool ran and failed
    Execution(String),
    /// The definition cannot be registered
    InvalidDefinition(String),
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolError::Validation(msg) => write!(f, "Invalid arguments: {}", msg),
            ToolError::Execution(msg) => write!(f, "Tool execution failed: {}", msg),
            ToolError::InvalidDefinition(msg) => write!(f, "Invalid tool definition: {}", msg),
        }
    }
}

impl std::error::Error for ToolError {}

impl From<SandboxError> for ToolError {
    fn from(e: SandboxError) -> Self {
        ToolError::Execution(e.to_string())
    }
}

/// Outcome of one tool invocation.
///
/// Built through [`ToolResult::ok`] and the failure constructors so that
/// a successful result never carries an error and a failed one always does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    metadata: Map<String, Value>,
}

impl ToolResult {
    pub fn ok(output: impl Into<Value>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
            metadata: Map::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn output(&self) -> Option<&Value> {
        self.output.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Serialized form stored as the content of a tool-result message
    pub fn to_content(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!("{{\"success\":false,\"error\":\"unserializable result: {}\"}}", e)
        })
    }
}

impl From<ToolError> for ToolResult {
    fn from(e: ToolError) -> Self {
        ToolResult::failure(e.to_string())
    }
}

/// Validated arguments handed to [`Tool::execute`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolArgs(Map<String, Value>);

impl ToolArgs {
    pub fn new(args: Map<String, Value>) -> Self {
        Self(args)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn i64(&self, name: &str) -> Option<i64> {
        self.0.get(name).and_then(Value::as_i64)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.0.get(name).and_then(Value::as_bool)
    }

    /// A string argument that must be present
    pub fn require_str(&self, name: &str) -> Result<&str, ToolError> {
        self.str(name)
            .ok_or_else(|| ToolError::Validation(format!("Missing required parameter '{}'", name)))
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

/// A callable the model can invoke by name
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name, description and parameter schema.
    ///
    /// Read once at registration; the registry dispatches on the name
    /// returned here.
    fn definition(&self) -> ToolDefinition;

    /// Run the tool with arguments that already passed validation.
    async fn execute(&self, args: ToolArgs) -> Result<ToolResult, ToolError>;
}
