//! Recovering tool calls that a model wrote into its text
//!
//! Smaller local models often answer with the JSON of a tool call in the
//! message body instead of using the native `tool_calls` field, e.g.
//!
//! ~~~text
//! I'll run it now:
//! ```json
//! {"name": "sandbox_run_command", "arguments": {"command": "ls"}}
//! ```
//! ~~~
//!
//! This module scans the text for top-level JSON objects and keeps the ones
//! that look like a call to a declared tool.

use serde_json::Value;

use crate::conversation::ToolInvocation;

/// Extract tool calls embedded in `content`.
///
/// Only objects naming one of `known_tools` are returned, so ordinary JSON
/// in an answer is not mistaken for a call.
pub fn parse_tool_calls_from_text(content: &str, known_tools: &[&str]) -> Vec<ToolInvocation> {
    let content = content.trim();

    if let Ok(value) = serde_json::from_str::<Value>(content) {
        let calls = calls_from_value(&value, known_tools);
        if !calls.is_empty() {
            return calls;
        }
    }

    json_objects(content)
        .into_iter()
        .filter_map(|candidate| serde_json::from_str::<Value>(candidate).ok())
        .flat_map(|value| calls_from_value(&value, known_tools))
        .collect()
}

/// Top-level `{...}` spans, skipping braces inside string literals
fn json_objects(text: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        spans.push(&text[s..=i]);
                    }
                }
            }
            _ => {}
        }
    }
    spans
}

fn calls_from_value(value: &Value, known_tools: &[&str]) -> Vec<ToolInvocation> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| call_from_object(item, known_tools))
            .collect(),
        other => call_from_object(other, known_tools).into_iter().collect(),
    }
}

/// Accepts `{"name", "arguments"|"parameters"}`, optionally wrapped in
/// `{"function": {...}}`.
fn call_from_object(value: &Value, known_tools: &[&str]) -> Option<ToolInvocation> {
    let call = value.get("function").filter(|f| f.is_object()).unwrap_or(value);
    let name = call
        .get("name")
        .or_else(|| call.get("tool_name"))
        .and_then(Value::as_str)?;
    if !known_tools.contains(&name) {
        return None;
    }
    let arguments = call
        .get("arguments")
        .or_else(|| call.get("parameters"))
        .cloned()
        .unwrap_or(Value::Null);
    Some(ToolInvocation::generated(name, arguments))
}
