//! Language-model provider seam
//!
//! A [`Provider`] turns the projected conversation plus the tool
//! declarations into one assistant [`Turn`]. Providers may also stream a
//! turn as a sequence of [`TurnEvent`]s; [`TurnAssembler`] folds such a
//! stream back into exactly the `Turn` the non-streaming call would have
//! produced, so the agent can treat both paths the same.
//!
//! # How a streamed turn is rebuilt
//!
//! ```text
//! ContentDelta("The ")                     content: "The answer"
//! ContentDelta("answer")            ──►
//! ToolInvocationFragment{0, id, name, "{\"pa"}
//! ToolInvocationFragment{0, None, None, "th\":1}"}   calls[0].arguments = {"path":1}
//! ```
//!
//! Argument fragments are concatenated per index before any JSON parsing.

pub mod assembler;
pub mod ollama;
pub mod text_calls;

use std::collections::HashSet;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};

use crate::conversation::{generate_call_id, Message, ToolInvocation};
use crate::tools::ToolDefinition;

pub use assembler::TurnAssembler;
pub use ollama::{OllamaConfig, OllamaProvider};
pub use text_calls::parse_tool_calls_from_text;

/// Sampling parameters forwarded to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: None,
        }
    }
}

/// Everything a provider needs to produce the next turn
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// Projected history, oldest first
    pub messages: Vec<Message>,
    /// Tools the model may call (empty when tool use is disabled)
    pub tools: Vec<ToolDefinition>,
    pub sampling: SamplingParams,
}

/// A complete assistant turn
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Turn {
    pub content: String,
    pub tool_invocations: Vec<ToolInvocation>,
}

impl Turn {
    /// A final answer with no tool calls
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_invocations: Vec::new(),
        }
    }

    pub fn with_invocations(content: impl Into<String>, invocations: Vec<ToolInvocation>) -> Self {
        Self {
            content: content.into(),
            tool_invocations: invocations,
        }
    }

    pub fn has_invocations(&self) -> bool {
        !self.tool_invocations.is_empty()
    }

    /// Give every invocation an id no other invocation in this turn uses.
    ///
    /// Empty and repeated ids are replaced with generated ones; the first
    /// holder of an id keeps it. Returns how many ids were replaced.
    pub fn ensure_unique_ids(&mut self) -> usize {
        let mut seen = HashSet::new();
        let mut replaced = 0;
        for invocation in &mut self.tool_invocations {
            if invocation.id.is_empty() || !seen.insert(invocation.id.clone()) {
                invocation.id = generate_call_id();
                seen.insert(invocation.id.clone());
                replaced += 1;
            }
        }
        replaced
    }

    /// Replay this turn as stream events. Arguments are sent in one piece.
    pub fn into_events(self) -> Vec<TurnEvent> {
        let mut events = Vec::with_capacity(self.tool_invocations.len() + 1);
        if !self.content.is_empty() {
            events.push(TurnEvent::ContentDelta(self.content));
        }
        for (index, invocation) in self.tool_invocations.into_iter().enumerate() {
            events.push(TurnEvent::ToolInvocationFragment {
                index,
                id: Some(invocation.id),
                name: Some(invocation.tool_name),
                arguments: invocation.arguments.to_string(),
            });
        }
        events
    }
}

/// One incremental piece of a streamed turn
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// Text to append to the turn's content
    ContentDelta(String),
    /// Part of the tool call at `index`.
    ///
    /// `id` and `name` usually arrive with the first fragment only;
    /// `arguments` is raw JSON text to be concatenated.
    ToolInvocationFragment {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
}

/// Stream of turn events as returned by [`Provider::stream_turn`]
pub type TurnStream = Pin<Box<dyn Stream<Item = Result<TurnEvent, ProviderError>> + Send>>;

/// Error type for provider calls
#[derive(Debug)]
pub enum ProviderError {
    /// Transport failure talking to the backend
    Request(reqwest::Error),
    /// Backend answered with a non-success status
    Http { status: u16, body: String },
    /// Response body could not be decoded
    Parse(serde_json::Error),
    EmptyResponse,
    /// The stream broke off or carried an error frame
    Stream(String),
    /// Any other backend failure
    Backend(String),
}

impl ProviderError {
    /// Whether repeating the same request could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Request(e) => e.is_timeout() || e.is_connect(),
            ProviderError::Http { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Stream(_) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Request(e) => write!(f, "Request error: {}", e),
            ProviderError::Http { status, body } => write!(f, "HTTP {}: {}", status, body),
            ProviderError::Parse(e) => write!(f, "Parse error: {}", e),
            ProviderError::EmptyResponse => write!(f, "Empty response from provider"),
            ProviderError::Stream(msg) => write!(f, "Stream error: {}", msg),
            ProviderError::Backend(msg) => write!(f, "Provider error: {}", msg),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Request(e)
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        ProviderError::Parse(e)
    }
}

/// A language-model backend
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short name used in logs and metrics
    fn name(&self) -> &str;

    /// Produce one complete assistant turn.
    async fn produce_turn(&self, request: TurnRequest) -> Result<Turn, ProviderError>;

    /// Produce the turn as a stream of events.
    ///
    /// The default implementation waits for [`Provider::produce_turn`] and
    /// replays the result, so every provider supports streaming callers.
    async fn stream_turn(&self, request: TurnRequest) -> Result<TurnStream, ProviderError> {
        let turn = self.produce_turn(request).await?;
        Ok(Box::pin(stream::iter(turn.into_events().into_iter().map(Ok))))
    }
}
