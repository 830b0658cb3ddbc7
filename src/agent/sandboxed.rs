//! SandboxedAgent - an Agent whose tools act on a private sandbox
//!
//! The sandbox is created lazily on first use. Checkpoints tie a sandbox
//! snapshot to a position in the conversation so both can be rolled back
//! together:
//!
//! ```text
//! create_checkpoint("before-refactor")
//!     snapshot workspace ──► snap-0003-1a2b3c4d
//!     remember len(conversation) = 7
//!
//! restore_checkpoint("before-refactor")
//!     1. checkpoint known?            else CheckpointNotFound (nothing changes)
//!     2. 7 <= len(conversation)?      else CheckpointInvalid  (nothing changes)
//!     3. restore snapshot             failure leaves the conversation as is
//!     4. truncate conversation to 7
//!     5. forget later checkpoints
//! ```
//!
//! A sandbox prompt prepended later moves the conversation by one message;
//! recorded lengths move with it. A sandbox that has terminated (failed
//! restore) is replaced on next use and its checkpoints are dropped.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{Stream, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::cgroups::ResourceLimits;
use crate::conversation::Conversation;
use crate::provider::Provider;
use crate::sandbox::{SandboxConfig, SandboxEnvironment, SandboxError, SandboxStatus, SnapshotInfo};
use crate::tools::{sandbox_tools, Tool, ToolRegistry};

use super::controller::{Agent, AgentConfig, AgentError, AgentEvent, AgentResult};

/// A named pairing of a sandbox snapshot and a conversation length
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Checkpoint {
    /// Same as the snapshot id
    pub id: String,
    pub name: String,
    pub snapshot_id: String,
    pub conversation_len: usize,
    pub created_at: DateTime<Utc>,
}

/// Summary of the sandbox and checkpoints
#[derive(Debug, Clone, Serialize)]
pub struct SandboxReport {
    pub session_id: Option<String>,
    pub status: SandboxStatus,
    pub workspace: Option<String>,
    pub network_enabled: bool,
    pub resource_limits: ResourceLimits,
    pub snapshots: Vec<SnapshotInfo>,
    pub checkpoints: Vec<Checkpoint>,
    pub conversation_len: usize,
}

/// Agent with sandbox tools and checkpoints
pub struct SandboxedAgent {
    agent: Agent,
    sandbox_config: SandboxConfig,
    sandbox: Option<Arc<SandboxEnvironment>>,
    checkpoints: Vec<Checkpoint>,
}

impl SandboxedAgent {
    pub fn new(
        provider: Arc<dyn Provider>,
        config: AgentConfig,
        sandbox_config: SandboxConfig,
    ) -> Self {
        Self {
            agent: Agent::new(provider, config),
            sandbox_config,
            sandbox: None,
            checkpoints: Vec::new(),
        }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn conversation(&self) -> &Conversation {
        self.agent.conversation()
    }

    pub fn registry(&self) -> &ToolRegistry {
        self.agent.registry()
    }

    pub fn register_tool(&mut self, tool: Arc<dyn Tool>) -> Result<(), AgentError> {
        self.agent.register_tool(tool)
    }

    /// The live sandbox, if one has been initialized
    pub fn sandbox(&self) -> Option<&Arc<SandboxEnvironment>> {
        self.sandbox.as_ref()
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// Bring the sandbox up now instead of on first use
    pub async fn initialize_sandbox(&mut self) -> Result<(), AgentError> {
        self.ensure_sandbox().await.map(|_| ())
    }

    /// The running sandbox, provisioning a new one if there is none or the
    /// current one has terminated (e.g. after a failed restore).
    async fn ensure_sandbox(&mut self) -> Result<Arc<SandboxEnvironment>, AgentError> {
        if let Some(sandbox) = self.sandbox.clone() {
            if sandbox.status().await == SandboxStatus::Running {
                return Ok(sandbox);
            }
            warn!(
                session_id = %sandbox.session_id(),
                "sandbox no longer running, provisioning a new one"
            );
            sandbox.teardown().await;
            self.sandbox = None;
            self.checkpoints.clear();
        }

        let sandbox = Arc::new(SandboxEnvironment::new(self.sandbox_config.clone()));
        sandbox.initialize().await?;

        for tool in sandbox_tools::all(&sandbox) {
            if let Err(e) = self.agent.register_tool(tool) {
                sandbox.teardown().await;
                return Err(e);
            }
        }

        info!(
            session_id = %sandbox.session_id(),
            tools = self.agent.registry().len(),
            "sandbox tools registered"
        );
        self.sandbox = Some(sandbox.clone());
        Ok(sandbox)
    }

    /// Install the sandbox system prompt if the conversation has none.
    ///
    /// Prepending shifts every message by one, so recorded checkpoint
    /// lengths shift with it.
    fn install_system_prompt(&mut self, base: Option<&str>) -> String {
        let prompt = self.system_prompt(base);
        if self.agent.conversation_mut().ensure_system_prompt(&prompt) {
            for checkpoint in &mut self.checkpoints {
                checkpoint.conversation_len += 1;
            }
        }
        prompt
    }

    fn system_prompt(&self, base: Option<&str>) -> String {
        let sandbox = format!(
            "You can work inside an isolated sandbox. Its workspace is {}; \
             relative paths are resolved there. Use sandbox_run_command for shell \
             commands, sandbox_execute_code to run code, sandbox_read_file, \
             sandbox_write_file and sandbox_list_files for files, \
             sandbox_install_package for dependencies, and sandbox_snapshot / \
             sandbox_restore_snapshot to save and roll back the workspace.",
            self.sandbox_config.working_directory
        );
        match base {
            Some(base) => format!("{}\n\n{}", base, sandbox),
            None => sandbox,
        }
    }

    pub async fn run(
        &mut self,
        message: &str,
        system_prompt: Option<&str>,
    ) -> Result<String, AgentError> {
        Ok(self.run_detailed(message, system_prompt).await?.final_response)
    }

    pub async fn run_detailed(
        &mut self,
        message: &str,
        system_prompt: Option<&str>,
    ) -> Result<AgentResult, AgentError> {
        self.ensure_sandbox().await?;
        let prompt = self.install_system_prompt(system_prompt);
        self.agent.run_detailed(message, Some(&prompt)).await
    }

    pub fn stream_response<'a>(
        &'a mut self,
        message: &'a str,
        system_prompt: Option<&'a str>,
    ) -> impl Stream<Item = Result<AgentEvent, AgentError>> + 'a {
        async_stream::stream! {
            if let Err(e) = self.ensure_sandbox().await {
                yield Err(e);
                return;
            }
            let prompt = self.install_system_prompt(system_prompt);
            let inner = self.agent.stream_response(message, Some(&prompt));
            futures_util::pin_mut!(inner);
            while let Some(item) = inner.next().await {
                yield item;
            }
        }
    }

    /// Snapshot the sandbox and remember the current conversation length.
    ///
    /// Returns the checkpoint id.
    pub async fn create_checkpoint(&mut self, name: &str) -> Result<String, AgentError> {
        let sandbox = self.ensure_sandbox().await?;
        let snapshot = sandbox.create_snapshot().await?;

        let checkpoint = Checkpoint {
            id: snapshot.snapshot_id.clone(),
            name: name.to_string(),
            snapshot_id: snapshot.snapshot_id,
            conversation_len: self.agent.conversation().len(),
            created_at: snapshot.created_at,
        };
        info!(
            checkpoint = %checkpoint.id,
            name,
            conversation_len = checkpoint.conversation_len,
            "checkpoint created"
        );
        let id = checkpoint.id.clone();
        self.checkpoints.push(checkpoint);
        Ok(id)
    }

    /// Roll the sandbox and the conversation back to a checkpoint.
    ///
    /// `id_or_name` matches a checkpoint id, or the most recent checkpoint
    /// with that name.
    pub async fn restore_checkpoint(&mut self, id_or_name: &str) -> Result<(), AgentError> {
        let position = self
            .checkpoints
            .iter()
            .rposition(|c| c.id == id_or_name || c.name == id_or_name)
            .ok_or_else(|| AgentError::CheckpointNotFound(id_or_name.to_string()))?;
        let checkpoint = self.checkpoints[position].clone();

        let current_len = self.agent.conversation().len();
        if checkpoint.conversation_len > current_len {
            return Err(AgentError::CheckpointInvalid(format!(
                "checkpoint {} expects {} messages but the conversation has {}",
                checkpoint.id, checkpoint.conversation_len, current_len
            )));
        }

        let sandbox = self.sandbox.clone().ok_or_else(|| {
            AgentError::CheckpointInvalid(format!("sandbox for {} is gone", checkpoint.id))
        })?;

        if let Err(e) = sandbox.restore_snapshot(&checkpoint.snapshot_id).await {
            if matches!(e, SandboxError::RestoreFailed(_) | SandboxError::NotRunning(_)) {
                // the environment is gone; start fresh next time
                warn!(checkpoint = %checkpoint.id, "sandbox lost during restore");
                self.sandbox = None;
                self.checkpoints.clear();
            }
            return Err(e.into());
        }

        self.agent
            .conversation_mut()
            .truncate(checkpoint.conversation_len);
        self.checkpoints.truncate(position + 1);
        info!(
            checkpoint = %checkpoint.id,
            conversation_len = checkpoint.conversation_len,
            "checkpoint restored"
        );
        Ok(())
    }

    /// Clear the conversation; checkpoints refer to it, so they go too
    pub fn clear_conversation(&mut self) {
        self.agent.clear_conversation();
        self.checkpoints.clear();
    }

    pub async fn save_conversation(&self, path: impl AsRef<Path>) -> Result<(), AgentError> {
        self.agent.save_conversation(path).await
    }

    /// Load a conversation; existing checkpoints no longer apply
    pub async fn load_conversation(&mut self, path: impl AsRef<Path>) -> Result<(), AgentError> {
        self.agent.load_conversation(path).await?;
        self.checkpoints.clear();
        Ok(())
    }

    /// Replace the sandbox with a fresh one
    pub async fn reset_sandbox(&mut self) -> Result<(), AgentError> {
        self.shutdown().await;
        self.ensure_sandbox().await.map(|_| ())
    }

    /// Tear the sandbox down. The next run provisions a new one.
    pub async fn shutdown(&mut self) {
        if let Some(sandbox) = self.sandbox.take() {
            sandbox.teardown().await;
        }
        self.checkpoints.clear();
    }

    pub async fn report(&self) -> SandboxReport {
        let (session_id, status, workspace, snapshots) = match &self.sandbox {
            Some(sandbox) => (
                Some(sandbox.session_id().to_string()),
                sandbox.status().await,
                Some(sandbox.workspace_path().display().to_string()),
                sandbox.snapshots().await,
            ),
            None => (None, SandboxStatus::Uninitialized, None, Vec::new()),
        };

        SandboxReport {
            session_id,
            status,
            workspace,
            network_enabled: self.sandbox_config.network_enabled,
            resource_limits: self.sandbox_config.resource_limits.clone(),
            snapshots,
            checkpoints: self.checkpoints.clone(),
            conversation_len: self.agent.conversation().len(),
        }
    }
}
