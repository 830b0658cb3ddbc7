//! Folding streamed turn events into a complete turn

use std::collections::BTreeMap;

use serde_json::Value;

use super::{Turn, TurnEvent};
use crate::conversation::{generate_call_id, ToolInvocation};

#[derive(Debug, Default)]
struct PartialInvocation {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Accumulates [`TurnEvent`]s until the stream ends.
///
/// Tool calls are ordered by their fragment index, not by arrival.
#[derive(Debug, Default)]
pub struct TurnAssembler {
    content: String,
    invocations: BTreeMap<usize, PartialInvocation>,
}

impl TurnAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: TurnEvent) {
        match event {
            TurnEvent::ContentDelta(delta) => self.content.push_str(&delta),
            TurnEvent::ToolInvocationFragment {
                index,
                id,
                name,
                arguments,
            } => {
                let partial = self.invocations.entry(index).or_default();
                if let Some(id) = id.filter(|s| !s.is_empty()) {
                    partial.id = Some(id);
                }
                if let Some(name) = name.filter(|s| !s.is_empty()) {
                    partial.name = Some(name);
                }
                partial.arguments.push_str(&arguments);
            }
        }
    }

    /// Content received so far
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Build the final turn.
    ///
    /// Arguments that are not valid JSON are kept as a string so the
    /// registry reports them as a validation failure to the model.
    pub fn finish(self) -> Turn {
        let tool_invocations = self
            .invocations
            .into_values()
            .map(|partial| {
                let raw = partial.arguments.trim();
                let arguments = if raw.is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
                };
                ToolInvocation::new(
                    partial.id.unwrap_or_else(generate_call_id),
                    partial.name.unwrap_or_default(),
                    arguments,
                )
            })
            .collect();
        Turn {
            content: self.content,
            tool_invocations,
        }
    }
}
