//! Ollama `/api/chat` provider
//!
//! Supports native tool calling, NDJSON streaming, and a text fallback for
//! models that print tool calls in their reply instead of emitting them
//! natively.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{
    parse_tool_calls_from_text, Provider, ProviderError, Turn, TurnEvent, TurnRequest, TurnStream,
};
use crate::conversation::{Message, Role, ToolInvocation};

/// Connection settings for an Ollama server
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    /// Base URL of the server (e.g. "http://localhost:11434")
    pub base_url: String,
    /// Model name (e.g. "qwen3")
    pub model: String,
    /// Whole-request timeout, including reading a streamed body
    pub request_timeout_secs: u64,
    /// Recover tool calls the model wrote as JSON text
    pub parse_text_tool_calls: bool,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "qwen3".to_string(),
            request_timeout_secs: 300,
            parse_text_tool_calls: true,
        }
    }
}

impl OllamaConfig {
    /// Defaults overridden by `OLLAMA_HOST` and `AGENTVISOR_MODEL`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(host) = std::env::var("OLLAMA_HOST") {
            config.base_url = if host.starts_with("http") {
                host
            } else {
                format!("http://{}", host)
            };
        }
        if let Ok(model) = std::env::var("AGENTVISOR_MODEL") {
            config.model = model;
        }
        config
    }
}

/// A message in Ollama's chat format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant", "tool"
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OllamaToolCall>>,
    /// Name of the tool whose result this message carries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

/// A tool call as Ollama encodes it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// One response object (the whole body, or one NDJSON line when streaming)
#[derive(Debug, Clone, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Convert conversation messages to Ollama chat messages.
///
/// Tool results carry the name of the tool they answer, looked up from the
/// assistant turn that requested them.
pub fn project_messages(messages: &[Message]) -> Vec<ChatMessage> {
    let mut names: HashMap<&str, &str> = HashMap::new();
    messages
        .iter()
        .map(|message| {
            for invocation in &message.tool_invocations {
                names.insert(invocation.id.as_str(), invocation.tool_name.as_str());
            }
            let tool_calls = message.has_invocations().then(|| {
                message
                    .tool_invocations
                    .iter()
                    .map(|inv| OllamaToolCall {
                        id: Some(inv.id.clone()),
                        function: FunctionCall {
                            name: inv.tool_name.clone(),
                            arguments: inv.arguments.clone(),
                        },
                    })
                    .collect()
            });
            let tool_name = match message.role {
                Role::Tool => message
                    .tool_invocation_id
                    .as_deref()
                    .and_then(|id| names.get(id))
                    .map(|name| name.to_string()),
                _ => None,
            };
            ChatMessage {
                role: message.role.as_str().to_string(),
                content: message.content.clone(),
                tool_calls,
                tool_name,
            }
        })
        .collect()
}

/// Splits a byte stream into complete lines; a line may span chunks.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line).trim().to_string();
            if !text.is_empty() {
                lines.push(text);
            }
        }
        lines
    }

    fn finish(self) -> Option<String> {
        let text = String::from_utf8_lossy(&self.pending).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

/// Turns NDJSON lines into turn events
#[derive(Debug)]
struct ChatStreamState {
    known_tools: Vec<String>,
    parse_text_tool_calls: bool,
    content: String,
    next_index: usize,
    done: bool,
}

impl ChatStreamState {
    fn new(known_tools: Vec<String>, parse_text_tool_calls: bool) -> Self {
        Self {
            known_tools,
            parse_text_tool_calls,
            content: String::new(),
            next_index: 0,
            done: false,
        }
    }

    fn on_line(&mut self, line: &str) -> Result<Vec<TurnEvent>, ProviderError> {
        let chunk: ChatChunk = serde_json::from_str(line)?;
        if let Some(error) = chunk.error {
            return Err(ProviderError::Stream(error));
        }
        let mut events = Vec::new();
        if let Some(message) = chunk.message {
            if !message.content.is_empty() {
                self.content.push_str(&message.content);
                events.push(TurnEvent::ContentDelta(message.content));
            }
            for call in message.tool_calls.unwrap_or_default() {
                events.push(self.fragment(call.id, call.function.name, &call.function.arguments));
            }
        }
        self.done |= chunk.done;
        Ok(events)
    }

    /// Events emitted once the body is exhausted
    fn on_end(&mut self) -> Result<Vec<TurnEvent>, ProviderError> {
        if !self.done {
            return Err(ProviderError::Stream("stream ended before completion".into()));
        }
        if self.next_index > 0 || !self.parse_text_tool_calls {
            return Ok(Vec::new());
        }
        let known: Vec<&str> = self.known_tools.iter().map(String::as_str).collect();
        let recovered = parse_tool_calls_from_text(&self.content, &known);
        if !recovered.is_empty() {
            debug!(count = recovered.len(), "Recovered tool calls from streamed text");
        }
        Ok(recovered
            .into_iter()
            .map(|inv| self.fragment(Some(inv.id), inv.tool_name, &inv.arguments))
            .collect())
    }

    fn fragment(&mut self, id: Option<String>, name: String, arguments: &Value) -> TurnEvent {
        let index = self.next_index;
        self.next_index += 1;
        let arguments = match arguments {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        TurnEvent::ToolInvocationFragment {
            index,
            id,
            name: Some(name),
            arguments,
        }
    }
}

/// Provider backed by an Ollama server
#[derive(Clone)]
pub struct OllamaProvider {
    config: OllamaConfig,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: OllamaConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &OllamaConfig {
        &self.config
    }

    fn request_body(&self, request: &TurnRequest, stream: bool) -> Value {
        let mut options = serde_json::json!({ "temperature": request.sampling.temperature });
        if let Some(max_tokens) = request.sampling.max_tokens {
            options["num_predict"] = Value::from(max_tokens);
        }
        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": project_messages(&request.messages),
            "stream": stream,
            "options": options,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.iter().map(|t| t.to_function_json()).collect());
        }
        body
    }

    async fn send(&self, request: &TurnRequest, stream: bool) -> Result<reqwest::Response, ProviderError> {
        let endpoint = format!("{}/api/chat", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&endpoint)
            .json(&self.request_body(request, stream))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    fn tool_names(request: &TurnRequest) -> Vec<String> {
        request.tools.iter().map(|t| t.name.clone()).collect()
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn produce_turn(&self, request: TurnRequest) -> Result<Turn, ProviderError> {
        let text = self.send(&request, false).await?.text().await?;
        if text.trim().is_empty() {
            return Err(ProviderError::EmptyResponse);
        }
        let chunk: ChatChunk = serde_json::from_str(&text)?;
        if let Some(error) = chunk.error {
            return Err(ProviderError::Backend(error));
        }
        let message = chunk.message.ok_or(ProviderError::EmptyResponse)?;

        let mut invocations: Vec<ToolInvocation> = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| match call.id {
                Some(id) => ToolInvocation::new(id, call.function.name, call.function.arguments),
                None => ToolInvocation::generated(call.function.name, call.function.arguments),
            })
            .collect();

        if invocations.is_empty() && self.config.parse_text_tool_calls {
            let names = Self::tool_names(&request);
            let known: Vec<&str> = names.iter().map(String::as_str).collect();
            invocations = parse_tool_calls_from_text(&message.content, &known);
        }

        Ok(Turn::with_invocations(message.content, invocations))
    }

    async fn stream_turn(&self, request: TurnRequest) -> Result<TurnStream, ProviderError> {
        let response = self.send(&request, true).await?;
        let mut state = ChatStreamState::new(Self::tool_names(&request), self.config.parse_text_tool_calls);
        let mut bytes = response.bytes_stream();

        let stream = async_stream::stream! {
            let mut lines = LineBuffer::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(ProviderError::Request(e));
                        return;
                    }
                };
                for line in lines.push(&chunk) {
                    match state.on_line(&line) {
                        Ok(events) => {
                            for event in events {
                                yield Ok(event);
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
            let tail = match lines.finish() {
                Some(line) => state.on_line(&line),
                None => Ok(Vec::new()),
            };
            match tail.and_then(|mut events| {
                events.extend(state.on_end()?);
                Ok(events)
            }) {
                Ok(events) => {
                    for event in events {
                        yield Ok(event);
                    }
                }
                Err(e) => yield Err(e),
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::TurnAssembler;
    use serde_json::json;

    #[test]
    fn test_projection_names_tool_results() {
        let messages = vec![
            Message::user("list files"),
            Message::assistant_with_invocations(
                "",
                vec![ToolInvocation::new("c1", "sandbox_list_files", json!({"path": "."}))],
            ),
            Message::tool_result("c1", "{\"success\":true}"),
        ];
        let projected = project_messages(&messages);
        assert_eq!(projected[1].tool_calls.as_ref().unwrap()[0].function.name, "sandbox_list_files");
        assert_eq!(projected[2].role, "tool");
        assert_eq!(projected[2].tool_name.as_deref(), Some("sandbox_list_files"));
    }

    #[test]
    fn test_line_buffer_joins_split_lines() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"{\"done\":").is_empty());
        let lines = buffer.push(b"false}\n{\"done\"");
        assert_eq!(lines, vec!["{\"done\":false}".to_string()]);
        assert!(buffer.push(b":true}").is_empty());
        assert_eq!(buffer.finish().as_deref(), Some("{\"done\":true}"));
    }

    #[test]
    fn test_stream_state_native_calls() {
        let mut state = ChatStreamState::new(vec!["sandbox_run_command".into()], true);
        let mut assembler = TurnAssembler::new();
        let lines = [
            r#"{"message":{"role":"assistant","content":"Run"},"done":false}"#,
            r#"{"message":{"role":"assistant","content":"ning","tool_calls":[{"function":{"name":"sandbox_run_command","arguments":{"command":"ls"}}}]},"done":false}"#,
            r#"{"message":{"role":"assistant","content":""},"done":true}"#,
        ];
        for line in lines {
            for event in state.on_line(line).unwrap() {
                assembler.push(event);
            }
        }
        assert!(state.on_end().unwrap().is_empty());
        let turn = assembler.finish();
        assert_eq!(turn.content, "Running");
        assert_eq!(turn.tool_invocations[0].arguments, json!({"command": "ls"}));
    }

    #[test]
    fn test_stream_state_text_fallback() {
        let mut state = ChatStreamState::new(vec!["sandbox_run_command".into()], true);
        state
            .on_line(r#"{"message":{"role":"assistant","content":"{\"name\": \"sandbox_run_command\", \"arguments\": {\"command\": \"pwd\"}}"},"done":true}"#)
            .unwrap();
        let events = state.on_end().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            TurnEvent::ToolInvocationFragment { name: Some(n), .. } if n == "sandbox_run_command"
        ));
    }

    #[test]
    fn test_stream_state_errors() {
        let mut state = ChatStreamState::new(Vec::new(), false);
        assert!(matches!(
            state.on_line(r#"{"error":"model not found"}"#),
            Err(ProviderError::Stream(_))
        ));
        assert!(state.on_end().is_err());
    }
}
