//! Shared test doubles for the integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use agentvisor::conversation::{Role, ToolInvocation};
use agentvisor::provider::{
    Provider, ProviderError, Turn, TurnEvent, TurnRequest, TurnStream,
};
use agentvisor::tools::{ParamType, Tool, ToolArgs, ToolDefinition, ToolError, ToolParameter, ToolResult};
use async_trait::async_trait;
use futures_util::stream;
use serde_json::{json, Value};

/// Provider that replays a fixed list of turns.
///
/// When streamed, content arrives in 3-character deltas and tool arguments
/// are split across two fragments, like a real backend.
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<Turn>>,
    requests: Mutex<Vec<TurnRequest>>,
    repeat_last: bool,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
            repeat_last: false,
        }
    }

    /// Keep returning the final turn once the script runs out
    pub fn repeating(turns: Vec<Turn>) -> Self {
        Self {
            repeat_last: true,
            ..Self::new(turns)
        }
    }

    pub fn requests(&self) -> Vec<TurnRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_turn(&self, request: TurnRequest) -> Result<Turn, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let mut turns = self.turns.lock().unwrap();
        if self.repeat_last && turns.len() == 1 {
            return Ok(turns[0].clone());
        }
        turns
            .pop_front()
            .ok_or_else(|| ProviderError::Backend("script exhausted".into()))
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn produce_turn(&self, request: TurnRequest) -> Result<Turn, ProviderError> {
        self.next_turn(request)
    }

    async fn stream_turn(&self, request: TurnRequest) -> Result<TurnStream, ProviderError> {
        let turn = self.next_turn(request)?;
        let mut events = Vec::new();

        let chars: Vec<char> = turn.content.chars().collect();
        for chunk in chars.chunks(3) {
            events.push(Ok(TurnEvent::ContentDelta(chunk.iter().collect())));
        }
        for (index, invocation) in turn.tool_invocations.into_iter().enumerate() {
            let arguments = invocation.arguments.to_string();
            let (head, tail) = arguments.split_at(arguments.len() / 2);
            events.push(Ok(TurnEvent::ToolInvocationFragment {
                index,
                id: Some(invocation.id),
                name: Some(invocation.tool_name),
                arguments: head.to_string(),
            }));
            events.push(Ok(TurnEvent::ToolInvocationFragment {
                index,
                id: None,
                name: None,
                arguments: tail.to_string(),
            }));
        }

        Ok(Box::pin(stream::iter(events)))
    }
}

/// Answers "Your name is Alice." when any user message mentions Alice
pub struct MemoryProvider;

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn produce_turn(&self, request: TurnRequest) -> Result<Turn, ProviderError> {
        let remembers = request
            .messages
            .iter()
            .any(|m| m.role == Role::User && m.content.contains("Alice"));
        let last = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();

        if last.contains('?') {
            if remembers {
                Ok(Turn::text("Your name is Alice."))
            } else {
                Ok(Turn::text("I don't know your name."))
            }
        } else {
            Ok(Turn::text("Nice to meet you."))
        }
    }
}

/// Sleeps for `delay_ms`, then returns `label`
pub struct SleepTool;

#[async_trait]
impl Tool for SleepTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new("sleep", "Sleep, then echo a label")
            .param(ToolParameter::new("label", ParamType::String, "Value to return"))
            .param(ToolParameter::new("delay_ms", ParamType::Integer, "How long to sleep"))
    }

    async fn execute(&self, args: ToolArgs) -> Result<ToolResult, ToolError> {
        let delay = args.i64("delay_ms").unwrap_or(0).max(0) as u64;
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(ToolResult::ok(args.require_str("label")?.to_string()))
    }
}

/// Always panics
pub struct PanicTool;

#[async_trait]
impl Tool for PanicTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new("explode", "Panics every time")
    }

    async fn execute(&self, _args: ToolArgs) -> Result<ToolResult, ToolError> {
        panic!("tool blew up")
    }
}

/// Always returns an execution error
pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new("fail", "Errors every time")
    }

    async fn execute(&self, _args: ToolArgs) -> Result<ToolResult, ToolError> {
        Err(ToolError::Execution("backend unavailable".into()))
    }
}

pub fn call(id: &str, tool: &str, arguments: Value) -> ToolInvocation {
    ToolInvocation::new(id, tool, arguments)
}

pub fn calls(invocations: Vec<ToolInvocation>) -> Turn {
    Turn::with_invocations("", invocations)
}

pub fn sleep_call(id: &str, label: &str, delay_ms: u64) -> ToolInvocation {
    call(id, "sleep", json!({ "label": label, "delay_ms": delay_ms }))
}
