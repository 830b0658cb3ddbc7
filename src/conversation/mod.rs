//! Conversation state
//!
//! An append-only, ordered log of [`Message`]s exchanged between the user,
//! the model and tools. The log enforces its own shape:
//!
//! ```text
//! [system]? user assistant(calls: a, b) tool(a) tool(b) assistant user ...
//!    ↑                         ↑          └──────┬─────┘
//!  only at 0             invocations      one result per call,
//!                                          right after the turn
//! ```
//!
//! Conversations serialize to a JSON document and round-trip losslessly.

pub mod history;
pub mod message;
pub mod store;

pub use history::{Conversation, ConversationError};
pub use message::{generate_call_id, normalize_arguments, Message, Role, ToolInvocation};
pub use store::{ConversationStore, ConversationSummary};
