//! Message types shared by the conversation log and the provider seam

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Who produced a message.
///
/// `Tool` marks a tool-result message: the output of one invocation fed
/// back to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    #[serde(alias = "tool-result", alias = "tool_result")]
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool call requested by the model in an assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Identifier that the matching tool-result message refers back to
    pub id: String,
    pub tool_name: String,
    /// Arguments as decoded from the provider (normally a JSON object)
    #[serde(default)]
    pub arguments: Value,
}

impl ToolInvocation {
    pub fn new(id: impl Into<String>, tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            arguments: normalize_arguments(arguments),
        }
    }

    /// Invocation with a freshly generated `call_*` id, for providers that
    /// do not assign their own.
    pub fn generated(tool_name: impl Into<String>, arguments: Value) -> Self {
        Self::new(generate_call_id(), tool_name, arguments)
    }
}

/// Generate a unique invocation id.
pub fn generate_call_id() -> String {
    format!("call_{}", Uuid::now_v7().simple())
}

/// Bring provider argument encodings to one shape.
///
/// Some backends send arguments as a JSON object, others as a string that
/// holds JSON text. Strings that decode to an object are unwrapped, `null`
/// and empty strings become an empty object, anything else is kept as-is so
/// validation can report it.
pub fn normalize_arguments(arguments: Value) -> Value {
    match arguments {
        Value::Null => Value::Object(Map::new()),
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Value::Object(Map::new());
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(Value::Object(map)) => Value::Object(map),
                _ => Value::String(text),
            }
        }
        other => other,
    }
}

/// One entry in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// Tool calls requested by an assistant turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_invocations: Vec<ToolInvocation>,
    /// On tool-result messages, the id of the invocation being answered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_invocation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_invocations: Vec::new(),
            tool_invocation_id: None,
            timestamp: Utc::now(),
            metadata: Map::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// Assistant turn that requests tool calls.
    pub fn assistant_with_invocations(
        content: impl Into<String>,
        invocations: Vec<ToolInvocation>,
    ) -> Self {
        let mut message = Self::with_role(Role::Assistant, content);
        message.tool_invocations = invocations;
        message
    }

    /// Tool-result message answering the invocation `invocation_id`.
    pub fn tool_result(invocation_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut message = Self::with_role(Role::Tool, content);
        message.tool_invocation_id = Some(invocation_id.into());
        message
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn has_invocations(&self) -> bool {
        !self.tool_invocations.is_empty()
    }
}
