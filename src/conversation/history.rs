//! The append-only conversation log

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::message::{Message, Role};

/// Errors raised when a conversation would become inconsistent or cannot
/// be persisted.
#[derive(Debug)]
pub enum ConversationError {
    /// A system message anywhere but the first position
    MisplacedSystemMessage,
    /// A tool-result message without `tool_invocation_id`
    MissingInvocationId,
    /// A tool result whose id matches no pending invocation
    OrphanToolResult(String),
    /// A second result for an invocation that was already answered
    DuplicateToolResult(String),
    Io(std::io::Error),
    Serde(serde_json::Error),
}

impl std::fmt::Display for ConversationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversationError::MisplacedSystemMessage => {
                write!(f, "System message is only allowed as the first message")
            }
            ConversationError::MissingInvocationId => {
                write!(f, "Tool result message has no tool_invocation_id")
            }
            ConversationError::OrphanToolResult(id) => {
                write!(f, "Tool result '{}' does not answer a pending invocation", id)
            }
            ConversationError::DuplicateToolResult(id) => {
                write!(f, "Invocation '{}' already has a result", id)
            }
            ConversationError::Io(e) => write!(f, "Conversation I/O error: {}", e),
            ConversationError::Serde(e) => write!(f, "Conversation format error: {}", e),
        }
    }
}

impl std::error::Error for ConversationError {}

impl From<std::io::Error> for ConversationError {
    fn from(e: std::io::Error) -> Self {
        ConversationError::Io(e)
    }
}

impl From<serde_json::Error> for ConversationError {
    fn from(e: serde_json::Error) -> Self {
        ConversationError::Serde(e)
    }
}

/// Ordered message log for one agent session.
///
/// Every append is checked against the log's structural rules: a system
/// message can only open the log, and each tool result must answer an
/// unanswered invocation of the assistant turn it follows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(default = "new_conversation_id")]
    pub id: String,
    messages: Vec<Message>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn new_conversation_id() -> String {
    Uuid::now_v7().to_string()
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: new_conversation_id(),
            messages: Vec::new(),
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Content of the leading system message, if there is one.
    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .first()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
    }

    /// Append one message.
    pub fn push(&mut self, message: Message) -> Result<(), ConversationError> {
        validate_append(&self.messages, &message)?;
        self.messages.push(message);
        self.touch();
        Ok(())
    }

    /// Append several messages as a unit: either all land or none do.
    pub fn extend(
        &mut self,
        messages: impl IntoIterator<Item = Message>,
    ) -> Result<(), ConversationError> {
        let mark = self.messages.len();
        for message in messages {
            if let Err(e) = validate_append(&self.messages, &message) {
                self.messages.truncate(mark);
                return Err(e);
            }
            self.messages.push(message);
        }
        self.touch();
        Ok(())
    }

    /// Insert `prompt` as the leading system message unless one is already
    /// present. Returns whether a message was inserted.
    pub fn ensure_system_prompt(&mut self, prompt: &str) -> bool {
        if self.system_prompt().is_some() {
            return false;
        }
        self.messages.insert(0, Message::system(prompt));
        self.touch();
        true
    }

    /// The most recent `limit` messages.
    ///
    /// The window is widened backwards so it never opens on a tool result
    /// separated from the assistant turn that requested it.
    pub fn window(&self, limit: usize) -> &[Message] {
        if limit == 0 {
            return &[];
        }
        let mut start = self.messages.len().saturating_sub(limit);
        while start > 0 && self.messages[start].role == Role::Tool {
            start -= 1;
        }
        &self.messages[start..]
    }

    /// History as sent to a provider: everything, or the system message
    /// followed by a window of the most recent messages.
    pub fn projected(&self, limit: Option<usize>) -> Vec<Message> {
        let Some(limit) = limit else {
            return self.messages.clone();
        };
        let window = self.window(limit);
        let mut projected = Vec::with_capacity(window.len() + 1);
        if let Some(system) = self.messages.first().filter(|m| m.role == Role::System) {
            if window.first().map(|m| m.role != Role::System).unwrap_or(true) {
                projected.push(system.clone());
            }
        }
        projected.extend_from_slice(window);
        projected
    }

    /// Drop every message; the conversation is then indistinguishable from
    /// a fresh one apart from its id and creation time.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.touch();
    }

    /// Keep only the first `len` messages.
    pub fn truncate(&mut self, len: usize) {
        if len < self.messages.len() {
            self.messages.truncate(len);
            self.touch();
        }
    }

    /// Check the structural rules over the whole log.
    pub fn validate(&self) -> Result<(), ConversationError> {
        for (i, message) in self.messages.iter().enumerate() {
            validate_append(&self.messages[..i], message)?;
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, ConversationError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Decode and validate a persisted conversation.
    pub fn from_json(json: &str) -> Result<Self, ConversationError> {
        let conversation: Conversation = serde_json::from_str(json)?;
        conversation.validate()?;
        Ok(conversation)
    }

    /// Write the conversation to `path`, replacing any existing file.
    ///
    /// The document is written next to the target first and renamed into
    /// place, so readers never observe a half-written file.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), ConversationError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = self.to_json()?;
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, json).await?;
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConversationError> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Check that `message` may follow `existing`.
fn validate_append(existing: &[Message], message: &Message) -> Result<(), ConversationError> {
    match message.role {
        Role::System if !existing.is_empty() => Err(ConversationError::MisplacedSystemMessage),
        Role::Tool => {
            let id = message
                .tool_invocation_id
                .as_deref()
                .ok_or(ConversationError::MissingInvocationId)?;

            // Walk back over the results already given for this turn to
            // the assistant message that requested them.
            let mut answered = HashSet::new();
            for prior in existing.iter().rev() {
                match prior.role {
                    Role::Tool => {
                        if let Some(prior_id) = prior.tool_invocation_id.as_deref() {
                            answered.insert(prior_id);
                        }
                    }
                    Role::Assistant => {
                        if !prior.tool_invocations.iter().any(|inv| inv.id == id) {
                            break;
                        }
                        if answered.contains(id) {
                            return Err(ConversationError::DuplicateToolResult(id.to_string()));
                        }
                        return Ok(());
                    }
                    _ => break,
                }
            }
            Err(ConversationError::OrphanToolResult(id.to_string()))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ToolInvocation;
    use serde_json::json;

    fn turn_with_calls(ids: &[&str]) -> Message {
        let invocations = ids
            .iter()
            .map(|id| ToolInvocation::new(*id, "echo", json!({})))
            .collect();
        Message::assistant_with_invocations("", invocations)
    }

    #[test]
    fn test_system_message_only_first() {
        let mut conv = Conversation::new();
        conv.push(Message::system("be brief")).unwrap();
        conv.push(Message::user("hi")).unwrap();
        assert!(matches!(
            conv.push(Message::system("again")),
            Err(ConversationError::MisplacedSystemMessage)
        ));
        assert_eq!(conv.len(), 2);
    }

    #[test]
    fn test_ensure_system_prompt_is_idempotent() {
        let mut conv = Conversation::new();
        conv.push(Message::user("hi")).unwrap();
        assert!(conv.ensure_system_prompt("first"));
        assert!(!conv.ensure_system_prompt("second"));
        assert_eq!(conv.system_prompt(), Some("first"));
        assert_eq!(
            conv.messages().iter().filter(|m| m.role == Role::System).count(),
            1
        );
    }

    #[test]
    fn test_tool_result_linkage() {
        let mut conv = Conversation::new();
        conv.push(Message::user("go")).unwrap();
        conv.push(turn_with_calls(&["a", "b"])).unwrap();
        conv.push(Message::tool_result("a", "1")).unwrap();
        assert!(matches!(
            conv.push(Message::tool_result("a", "again")),
            Err(ConversationError::DuplicateToolResult(_))
        ));
        assert!(matches!(
            conv.push(Message::tool_result("zzz", "?")),
            Err(ConversationError::OrphanToolResult(_))
        ));
        conv.push(Message::tool_result("b", "2")).unwrap();
        assert_eq!(conv.len(), 4);
    }

    #[test]
    fn test_tool_result_requires_id() {
        let mut conv = Conversation::new();
        conv.push(turn_with_calls(&["a"])).unwrap();
        let mut result = Message::tool_result("a", "x");
        result.tool_invocation_id = None;
        assert!(matches!(
            conv.push(result),
            Err(ConversationError::MissingInvocationId)
        ));
    }

    #[test]
    fn test_extend_is_all_or_nothing() {
        let mut conv = Conversation::new();
        conv.push(Message::user("go")).unwrap();
        let batch = vec![
            turn_with_calls(&["a"]),
            Message::tool_result("a", "ok"),
            Message::tool_result("missing", "bad"),
        ];
        assert!(conv.extend(batch).is_err());
        assert_eq!(conv.len(), 1);
    }

    #[test]
    fn test_window_does_not_split_tool_results() {
        let mut conv = Conversation::new();
        conv.push(Message::system("sys")).unwrap();
        conv.push(Message::user("go")).unwrap();
        conv.push(turn_with_calls(&["a", "b"])).unwrap();
        conv.push(Message::tool_result("a", "1")).unwrap();
        conv.push(Message::tool_result("b", "2")).unwrap();

        let window = conv.window(1);
        assert_eq!(window.len(), 3);
        assert_eq!(window[0].role, Role::Assistant);

        let projected = conv.projected(Some(1));
        assert_eq!(projected.len(), 4);
        assert_eq!(projected[0].role, Role::System);
        assert_eq!(conv.projected(None).len(), 5);
    }

    #[test]
    fn test_zero_window_keeps_only_system_prompt() {
        let mut conv = Conversation::new();
        assert!(conv.window(0).is_empty());
        conv.push(Message::system("sys")).unwrap();
        conv.push(Message::user("go")).unwrap();

        assert!(conv.window(0).is_empty());
        let projected = conv.projected(Some(0));
        assert_eq!(projected.len(), 1);
        assert_eq!(projected[0].role, Role::System);
    }

    #[test]
    fn test_clear_and_truncate() {
        let mut conv = Conversation::new();
        conv.push(Message::user("a")).unwrap();
        conv.push(Message::assistant("b")).unwrap();
        conv.truncate(1);
        assert_eq!(conv.len(), 1);
        conv.clear();
        assert!(conv.is_empty());
    }

    #[test]
    fn test_json_round_trip() {
        let mut conv = Conversation::new();
        conv.push(Message::system("sys")).unwrap();
        conv.push(Message::user("hi").with_metadata("lang", json!("en")))
            .unwrap();
        conv.push(turn_with_calls(&["a"])).unwrap();
        conv.push(Message::tool_result("a", "{\"success\":true}")).unwrap();
        conv.metadata.insert("title".into(), json!("demo"));

        let restored = Conversation::from_json(&conv.to_json().unwrap()).unwrap();
        assert_eq!(restored, conv);
    }

    #[test]
    fn test_from_json_rejects_invalid_log() {
        let mut conv = Conversation::new();
        conv.push(Message::user("hi")).unwrap();
        let mut value = serde_json::to_value(&conv).unwrap();
        value["messages"]
            .as_array_mut()
            .unwrap()
            .push(serde_json::to_value(Message::system("late")).unwrap());
        let json = serde_json::to_string(&value).unwrap();
        assert!(matches!(
            Conversation::from_json(&json),
            Err(ConversationError::MisplacedSystemMessage)
        ));
    }
}
