//! AgentVisor - tool-calling agents with snapshot-able sandboxes
//!
//! An [`Agent`] drives a conversation with a language-model [`Provider`],
//! runs the tools the model asks for and feeds the results back until the
//! model answers. A [`SandboxedAgent`] gives it an isolated workspace to
//! work in, with snapshots and conversation checkpoints.
//!
//! # Modules
//!
//! - `agent` - the tool-resolution loop and the sandboxed agent
//! - `provider` - the provider seam, stream assembly and an Ollama adapter
//! - `tools` - tool trait, schemas, argument validation and the registry
//! - `conversation` - the append-only message log and its persistence
//! - `sandbox` - isolated execution environments
//! - `cgroups` - resource limits for sandboxes using Linux cgroups v2
//! - `security` - seccomp network filter and capability dropping
//! - `metrics` - Prometheus metrics
//! - `tracing` - logging and OpenTelemetry export
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use agentvisor::{AgentConfig, OllamaConfig, OllamaProvider, SandboxConfig, SandboxedAgent};
//!
//! let provider = Arc::new(OllamaProvider::new(OllamaConfig::from_env())?);
//! let mut agent = SandboxedAgent::new(provider, AgentConfig::default(), SandboxConfig::default());
//!
//! let answer = agent.run("Write fizzbuzz in Python and run it", None).await?;
//! let checkpoint = agent.create_checkpoint("after-fizzbuzz").await?;
//! agent.shutdown().await;
//! ```

pub mod agent;
pub mod cgroups;
pub mod conversation;
pub mod metrics;
pub mod provider;
pub mod sandbox;
pub mod security;
pub mod tools;
pub mod tracing;

// Re-export commonly used types at crate root for convenience
pub use agent::{Agent, AgentConfig, AgentError, AgentEvent, AgentResult, SandboxedAgent};
pub use cgroups::ResourceLimits;
pub use conversation::{Conversation, Message, Role, ToolInvocation};
pub use provider::{OllamaConfig, OllamaProvider, Provider, ProviderError};
pub use sandbox::{SandboxConfig, SandboxEnvironment, SandboxError};
pub use tools::{Tool, ToolDefinition, ToolError, ToolRegistry, ToolResult};
