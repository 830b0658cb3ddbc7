//! Tool registry: registration, validation and dispatch

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use serde_json::Value;
use tracing::{debug, info_span, warn, Instrument};

use super::{Tool, ToolArgs, ToolDefinition, ToolError, ToolResult};
use crate::metrics::{TOOL_CALLS, TOOL_CALL_DURATION};

struct RegisteredTool {
    definition: ToolDefinition,
    tool: Arc<dyn Tool>,
}

/// Name-keyed collection of tools.
///
/// Declarations are returned in registration order. Registering a name
/// that already exists replaces the earlier tool in place.
#[derive(Default)]
pub struct ToolRegistry {
    entries: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under the name from its definition.
    ///
    /// Returns the definition that was replaced, if any.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<Option<ToolDefinition>, ToolError> {
        let definition = tool.definition();
        definition.check()?;

        let name = definition.name.clone();
        let entry = RegisteredTool { definition, tool };
        match self.index.get(&name) {
            Some(&slot) => {
                warn!(tool = %name, "Replacing previously registered tool");
                let previous = std::mem::replace(&mut self.entries[slot], entry);
                Ok(Some(previous.definition))
            }
            None => {
                debug!(tool = %name, "Registered tool");
                self.index.insert(name, self.entries.len());
                self.entries.push(entry);
                Ok(None)
            }
        }
    }

    /// Remove a tool by name
    pub fn unregister(&mut self, name: &str) -> Option<ToolDefinition> {
        let slot = self.index.remove(name)?;
        let removed = self.entries.remove(slot);
        for index in self.index.values_mut() {
            if *index > slot {
                *index -= 1;
            }
        }
        Some(removed.definition)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.definition.name.as_str()).collect()
    }

    /// Declarations for every registered tool, in registration order
    pub fn declarations(&self) -> Vec<ToolDefinition> {
        self.entries.iter().map(|e| e.definition.clone()).collect()
    }

    /// Validate `arguments` and run the named tool.
    ///
    /// Never fails: an unknown name, invalid arguments, a tool error or a
    /// panic inside the tool all come back as a failed [`ToolResult`].
    pub async fn execute(&self, name: &str, arguments: &Value) -> ToolResult {
        let Some(entry) = self.index.get(name).map(|&slot| &self.entries[slot]) else {
            warn!(tool = %name, "Model requested an unknown tool");
            TOOL_CALLS.with_label_values(&["unknown", "not_found"]).inc();
            return ToolResult::failure(format!("Tool '{}' not found", name));
        };

        let args = match entry.definition.validate(arguments) {
            Ok(args) => ToolArgs::new(args),
            Err(e) => {
                debug!(tool = %name, error = %e, "Tool arguments rejected");
                TOOL_CALLS.with_label_values(&[name, "invalid"]).inc();
                return e.into();
            }
        };

        let span = info_span!("tool_call", tool = %name, otel.name = "tool_call");
        let start = Instant::now();
        let outcome = AssertUnwindSafe(entry.tool.execute(args))
            .catch_unwind()
            .instrument(span)
            .await;
        TOOL_CALL_DURATION
            .with_label_values(&[name])
            .observe(start.elapsed().as_secs_f64());

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(tool = %name, error = %e, "Tool returned an error");
                ToolResult::from(e)
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                warn!(tool = %name, reason = %reason, "Tool panicked");
                ToolError::Execution(format!("tool panicked: {}", reason)).into()
            }
        };

        let label = if result.success() { "success" } else { "failure" };
        TOOL_CALLS.with_label_values(&[name, label]).inc();
        result
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
