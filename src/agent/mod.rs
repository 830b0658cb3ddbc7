//! Agent loop and its sandboxed variant
//!
//! # Architecture
//!
//! ```text
//! User message → Agent → Provider (turn, with tool declarations)
//!                  ↓
//!           Tool calls: ToolRegistry::execute (concurrently)
//!                  ↓
//!           Results appended to the Conversation
//!                  ↓
//!           Ask the provider again → Loop or Complete
//!
//! SandboxedAgent = Agent
//!                + SandboxEnvironment (lazily initialized)
//!                + sandbox tools registered into the Agent's registry
//!                + checkpoints (snapshot id, conversation length)
//! ```

pub mod controller;
pub mod sandboxed;

pub use controller::{Agent, AgentConfig, AgentError, AgentEvent, AgentResult};
pub use sandboxed::{Checkpoint, SandboxReport, SandboxedAgent};
