//! Agent - the tool-resolution loop
//!
//! The Agent drives one exchange at a time: it appends the user message,
//! asks the provider for a turn, runs any requested tools concurrently,
//! records the results and asks again until the provider answers without
//! tool calls.
//!
//! ```text
//! user message ──► Conversation
//!                     │
//!            ┌────────▼─────────┐
//!            │ Provider turn     │◄──────────────────────┐
//!            └────────┬─────────┘                        │
//!                     │ tool calls?                      │
//!           no ◄──────┴──────► yes                       │
//!           │                   │ join_all(registry.execute)
//!   commit answer        commit turn + results ──────────┘
//!           │                   (depth += 1, bounded by max_depth)
//!           ▼
//!     final response
//! ```
//!
//! An assistant turn and its tool results are committed together, after
//! every invocation has resolved. Dropping a `run` future or a
//! `stream_response` stream part-way therefore never leaves a turn in the
//! conversation without its results.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use futures_util::stream::{Stream, StreamExt};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::conversation::{Conversation, ConversationError, Message, ToolInvocation};
use crate::metrics::{AGENT_ITERATIONS, AGENT_RUNS, PROVIDER_CALL_DURATION, PROVIDER_ERRORS};
use crate::provider::{
    Provider, ProviderError, SamplingParams, Turn, TurnAssembler, TurnEvent, TurnRequest,
    TurnStream,
};
use crate::sandbox::SandboxError;
use crate::tools::{Tool, ToolError, ToolRegistry, ToolResult};

/// Configuration for the agent loop
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Maximum provider turns per exchange
    pub max_depth: usize,
    pub sampling: SamplingParams,
    /// Offer registered tools to the provider
    pub tools_enabled: bool,
    /// Consume provider turns as streams in `run`
    pub stream: bool,
    /// Send only the last N messages (plus the system prompt)
    pub history_window: Option<usize>,
    /// Extra attempts for retryable provider errors
    pub provider_retries: u32,
    /// Base delay between attempts, multiplied by the attempt number
    pub retry_delay: Duration,
    /// Save the conversation to `save_path` after each exchange
    pub auto_save: bool,
    pub save_path: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_depth: 25,
            sampling: SamplingParams::default(),
            tools_enabled: true,
            stream: false,
            history_window: None,
            provider_retries: 0,
            retry_delay: Duration::from_millis(500),
            auto_save: false,
            save_path: None,
        }
    }
}

impl AgentConfig {
    /// Defaults overridden by `AGENTVISOR_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(depth) = env_parse::<usize>("AGENTVISOR_MAX_DEPTH").filter(|d| *d > 0) {
            config.max_depth = depth;
        }
        if let Some(temperature) = env_parse::<f32>("AGENTVISOR_TEMPERATURE") {
            config.sampling.temperature = temperature;
        }
        if let Some(max_tokens) = env_parse::<u32>("AGENTVISOR_MAX_TOKENS") {
            config.sampling.max_tokens = Some(max_tokens);
        }
        if let Some(stream) = env_parse::<bool>("AGENTVISOR_STREAM") {
            config.stream = stream;
        }
        if let Some(window) = env_parse::<usize>("AGENTVISOR_HISTORY_WINDOW").filter(|w| *w > 0) {
            config.history_window = Some(window);
        }
        if let Some(retries) = env_parse::<u32>("AGENTVISOR_PROVIDER_RETRIES") {
            config.provider_retries = retries;
        }
        if let Ok(path) = std::env::var("AGENTVISOR_SAVE_PATH") {
            config.save_path = Some(PathBuf::from(path));
            config.auto_save = true;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let value = std::env::var(key).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(key, value = %value, "ignoring unparsable environment variable");
            None
        }
    }
}

/// Result of an agent run
#[derive(Debug, Clone)]
pub struct AgentResult {
    /// Final response from the provider
    pub final_response: String,
    /// Number of provider turns taken
    pub iterations: usize,
    /// Number of tool calls executed
    pub tool_calls_made: usize,
    /// Unique id for this run, also on the `agent_run` span
    pub run_id: String,
}

/// Progress reported by [`Agent::stream_response`]
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// A piece of assistant text as it arrives
    ContentDelta(String),
    ToolCallStarted { id: String, name: String },
    ToolCallFinished { id: String, name: String, success: bool },
    /// The exchange finished with this answer
    Completed { final_text: String },
}

/// Error type for agent operations
#[derive(Debug)]
pub enum AgentError {
    /// The provider failed (after any configured retries)
    Provider(ProviderError),
    /// The provider kept requesting tools past `max_depth` turns
    LoopDepthExceeded { depth: usize },
    /// Sandbox lifecycle failure
    Sandbox(SandboxError),
    /// Restore requested for an unknown checkpoint
    CheckpointNotFound(String),
    /// The checkpoint no longer matches the conversation
    CheckpointInvalid(String),
    /// Conversation append or persistence failed
    Conversation(ConversationError),
    /// A tool could not be registered
    Tool(ToolError),
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentError::Provider(e) => write!(f, "Provider error: {}", e),
            AgentError::LoopDepthExceeded { depth } => {
                write!(f, "Tool resolution exceeded the maximum depth of {}", depth)
            }
            AgentError::Sandbox(e) => write!(f, "Sandbox error: {}", e),
            AgentError::CheckpointNotFound(id) => write!(f, "Checkpoint not found: {}", id),
            AgentError::CheckpointInvalid(msg) => write!(f, "Checkpoint invalid: {}", msg),
            AgentError::Conversation(e) => write!(f, "Conversation error: {}", e),
            AgentError::Tool(e) => write!(f, "Tool error: {}", e),
        }
    }
}

impl std::error::Error for AgentError {}

impl From<ProviderError> for AgentError {
    fn from(e: ProviderError) -> Self {
        AgentError::Provider(e)
    }
}

impl From<SandboxError> for AgentError {
    fn from(e: SandboxError) -> Self {
        AgentError::Sandbox(e)
    }
}

impl From<ConversationError> for AgentError {
    fn from(e: ConversationError) -> Self {
        AgentError::Conversation(e)
    }
}

impl From<ToolError> for AgentError {
    fn from(e: ToolError) -> Self {
        AgentError::Tool(e)
    }
}

/// Agent orchestrating a provider, a tool registry and a conversation
pub struct Agent {
    provider: Arc<dyn Provider>,
    registry: ToolRegistry,
    conversation: Conversation,
    config: AgentConfig,
}

impl Agent {
    pub fn new(provider: Arc<dyn Provider>, config: AgentConfig) -> Self {
        Self {
            provider,
            registry: ToolRegistry::new(),
            conversation: Conversation::new(),
            config,
        }
    }

    /// Start with an already populated registry
    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub(crate) fn conversation_mut(&mut self) -> &mut Conversation {
        &mut self.conversation
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ToolRegistry {
        &mut self.registry
    }

    /// Register a tool, replacing any tool with the same name
    pub fn register_tool(&mut self, tool: Arc<dyn Tool>) -> Result<(), AgentError> {
        self.registry.register(tool)?;
        Ok(())
    }

    /// Forget the whole history, system prompt included
    pub fn clear_conversation(&mut self) {
        self.conversation.clear();
        info!(conversation_id = %self.conversation.id, "conversation cleared");
    }

    pub async fn save_conversation(&self, path: impl AsRef<Path>) -> Result<(), AgentError> {
        self.conversation.save(path).await?;
        Ok(())
    }

    /// Replace the current conversation with one loaded from disk
    pub async fn load_conversation(&mut self, path: impl AsRef<Path>) -> Result<(), AgentError> {
        self.conversation = Conversation::load(path).await?;
        Ok(())
    }

    /// Run one exchange and return the final answer
    pub async fn run(
        &mut self,
        message: &str,
        system_prompt: Option<&str>,
    ) -> Result<String, AgentError> {
        Ok(self.run_detailed(message, system_prompt).await?.final_response)
    }

    /// Run one exchange and report how it went
    pub async fn run_detailed(
        &mut self,
        message: &str,
        system_prompt: Option<&str>,
    ) -> Result<AgentResult, AgentError> {
        let run_id = Uuid::now_v7().to_string();
        let root_span = info_span!(
            "agent_run",
            run_id = %run_id,
            provider = %self.provider.name(),
            stream = self.config.stream,
            otel.name = "agent_run"
        );

        let result = self
            .resolve(message, system_prompt, run_id)
            .instrument(root_span)
            .await;
        AGENT_RUNS.with_label_values(&[outcome_label(&result)]).inc();
        result
    }

    async fn resolve(
        &mut self,
        message: &str,
        system_prompt: Option<&str>,
        run_id: String,
    ) -> Result<AgentResult, AgentError> {
        info!(run_id = %run_id, "starting exchange");
        self.prepare_exchange(message, system_prompt)?;

        let mut iterations = 0;
        let mut tool_calls_made = 0;

        loop {
            if iterations >= self.config.max_depth {
                warn!(depth = self.config.max_depth, "loop depth exceeded");
                AGENT_ITERATIONS.observe(iterations as f64);
                return Err(AgentError::LoopDepthExceeded {
                    depth: self.config.max_depth,
                });
            }
            iterations += 1;

            let mut turn = self.request_turn().await?;
            if turn.ensure_unique_ids() > 0 {
                warn!("provider repeated tool call ids, replaced them");
            }
            debug!(
                iteration = iterations,
                tool_calls = turn.tool_invocations.len(),
                content_len = turn.content.len(),
                "turn received"
            );

            if !turn.has_invocations() {
                let final_response = turn.content.clone();
                self.commit_turn(turn, Vec::new())?;
                self.finish_exchange().await?;
                AGENT_ITERATIONS.observe(iterations as f64);
                info!(iterations, tool_calls_made, "exchange complete");
                return Ok(AgentResult {
                    final_response,
                    iterations,
                    tool_calls_made,
                    run_id,
                });
            }

            let results = self.resolve_invocations(&turn.tool_invocations).await;
            tool_calls_made += results.len();
            self.commit_turn(turn, results)?;
        }
    }

    /// Run one exchange, reporting text and tool activity as it happens.
    ///
    /// Ends with [`AgentEvent::Completed`] or a single error. The final
    /// conversation is the one [`Agent::run`] would produce for the same
    /// provider output.
    pub fn stream_response<'a>(
        &'a mut self,
        message: &'a str,
        system_prompt: Option<&'a str>,
    ) -> impl Stream<Item = Result<AgentEvent, AgentError>> + 'a {
        let run_id = Uuid::now_v7().to_string();
        let root_span = info_span!(
            "agent_run",
            run_id = %run_id,
            provider = %self.provider.name(),
            stream = true,
            otel.name = "agent_run"
        );

        async_stream::stream! {
            if let Err(e) = self.prepare_exchange(message, system_prompt) {
                AGENT_RUNS.with_label_values(&["conversation_error"]).inc();
                yield Err(e);
                return;
            }

            let mut iterations = 0;
            loop {
                if iterations >= self.config.max_depth {
                    AGENT_RUNS.with_label_values(&["depth_exceeded"]).inc();
                    yield Err(AgentError::LoopDepthExceeded { depth: self.config.max_depth });
                    return;
                }
                iterations += 1;

                let mut events = match self.open_turn_stream().instrument(root_span.clone()).await {
                    Ok(events) => events,
                    Err(e) => {
                        AGENT_RUNS.with_label_values(&["provider_error"]).inc();
                        yield Err(AgentError::Provider(e));
                        return;
                    }
                };

                let mut assembler = TurnAssembler::new();
                while let Some(event) = events.next().await {
                    match event {
                        Ok(event) => {
                            if let TurnEvent::ContentDelta(text) = &event {
                                yield Ok(AgentEvent::ContentDelta(text.clone()));
                            }
                            assembler.push(event);
                        }
                        Err(e) => {
                            PROVIDER_ERRORS.with_label_values(&[self.provider.name()]).inc();
                            AGENT_RUNS.with_label_values(&["provider_error"]).inc();
                            yield Err(AgentError::Provider(e));
                            return;
                        }
                    }
                }
                let mut turn = assembler.finish();
                if turn.ensure_unique_ids() > 0 {
                    warn!("provider repeated tool call ids, replaced them");
                }

                if !turn.has_invocations() {
                    let final_text = turn.content.clone();
                    let committed = match self.commit_turn(turn, Vec::new()) {
                        Ok(()) => self.finish_exchange().await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = committed {
                        AGENT_RUNS.with_label_values(&["conversation_error"]).inc();
                        yield Err(e);
                        return;
                    }
                    AGENT_ITERATIONS.observe(iterations as f64);
                    AGENT_RUNS.with_label_values(&["completed"]).inc();
                    yield Ok(AgentEvent::Completed { final_text });
                    return;
                }

                for invocation in &turn.tool_invocations {
                    yield Ok(AgentEvent::ToolCallStarted {
                        id: invocation.id.clone(),
                        name: invocation.tool_name.clone(),
                    });
                }

                let results = self
                    .resolve_invocations(&turn.tool_invocations)
                    .instrument(root_span.clone())
                    .await;
                let finished: Vec<AgentEvent> = turn
                    .tool_invocations
                    .iter()
                    .zip(&results)
                    .map(|(invocation, result)| AgentEvent::ToolCallFinished {
                        id: invocation.id.clone(),
                        name: invocation.tool_name.clone(),
                        success: result.success(),
                    })
                    .collect();

                if let Err(e) = self.commit_turn(turn, results) {
                    AGENT_RUNS.with_label_values(&["conversation_error"]).inc();
                    yield Err(e);
                    return;
                }
                for event in finished {
                    yield Ok(event);
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Steps shared by run and stream_response
    // ═══════════════════════════════════════════════════════════════════════

    fn prepare_exchange(
        &mut self,
        message: &str,
        system_prompt: Option<&str>,
    ) -> Result<(), AgentError> {
        if let Some(prompt) = system_prompt {
            if self.conversation.ensure_system_prompt(prompt) {
                debug!("system prompt installed");
            }
        }
        self.conversation.push(Message::user(message))?;
        Ok(())
    }

    fn turn_request(&self) -> TurnRequest {
        let tools = if self.config.tools_enabled {
            self.registry.declarations()
        } else {
            Vec::new()
        };
        TurnRequest {
            messages: self.conversation.projected(self.config.history_window),
            tools,
            sampling: self.config.sampling.clone(),
        }
    }

    /// One complete turn, through whichever path the config selects
    async fn request_turn(&self) -> Result<Turn, ProviderError> {
        let mode = if self.config.stream { "stream" } else { "single" };
        let mut attempt = 0;

        loop {
            let request = self.turn_request();
            let span = info_span!(
                "provider_call",
                provider = %self.provider.name(),
                mode,
                attempt,
                messages = request.messages.len()
            );
            let started = Instant::now();
            let result = async {
                if self.config.stream {
                    self.collect_stream(request).await
                } else {
                    self.provider.produce_turn(request).await
                }
            }
            .instrument(span)
            .await;
            PROVIDER_CALL_DURATION
                .with_label_values(&[self.provider.name(), mode])
                .observe(started.elapsed().as_secs_f64());

            match result {
                Ok(turn) => return Ok(turn),
                Err(e) => {
                    PROVIDER_ERRORS.with_label_values(&[self.provider.name()]).inc();
                    if attempt < self.config.provider_retries && e.is_retryable() {
                        attempt += 1;
                        warn!(attempt, error = %e, "provider call failed, retrying");
                        tokio::time::sleep(self.config.retry_delay * attempt).await;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn collect_stream(&self, request: TurnRequest) -> Result<Turn, ProviderError> {
        let mut events = self.provider.stream_turn(request).await?;
        let mut assembler = TurnAssembler::new();
        while let Some(event) = events.next().await {
            assembler.push(event?);
        }
        Ok(assembler.finish())
    }

    /// Open a provider stream, retrying the open itself when allowed
    async fn open_turn_stream(&self) -> Result<TurnStream, ProviderError> {
        let mut attempt = 0;
        loop {
            let request = self.turn_request();
            match self.provider.stream_turn(request).await {
                Ok(events) => return Ok(events),
                Err(e) => {
                    PROVIDER_ERRORS.with_label_values(&[self.provider.name()]).inc();
                    if attempt < self.config.provider_retries && e.is_retryable() {
                        attempt += 1;
                        warn!(attempt, error = %e, "opening provider stream failed, retrying");
                        tokio::time::sleep(self.config.retry_delay * attempt).await;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Execute every invocation concurrently; results keep declaration order
    async fn resolve_invocations(&self, invocations: &[ToolInvocation]) -> Vec<ToolResult> {
        for invocation in invocations {
            info!(
                call_id = %invocation.id,
                tool = %invocation.tool_name,
                "dispatching tool call"
            );
        }
        join_all(
            invocations
                .iter()
                .map(|inv| self.registry.execute(&inv.tool_name, &inv.arguments)),
        )
        .await
    }

    /// Append a turn and its results in one step
    fn commit_turn(&mut self, turn: Turn, results: Vec<ToolResult>) -> Result<(), AgentError> {
        let mut batch = Vec::with_capacity(results.len() + 1);
        let invocations = turn.tool_invocations.clone();
        batch.push(if invocations.is_empty() {
            Message::assistant(turn.content)
        } else {
            Message::assistant_with_invocations(turn.content, turn.tool_invocations)
        });

        for (invocation, result) in invocations.iter().zip(results) {
            let message = Message::tool_result(&invocation.id, result.to_content())
                .with_metadata("tool_name", invocation.tool_name.clone().into())
                .with_metadata("success", result.success().into());
            batch.push(message);
        }

        self.conversation.extend(batch)?;
        Ok(())
    }

    async fn finish_exchange(&self) -> Result<(), AgentError> {
        if !self.config.auto_save {
            return Ok(());
        }
        if let Some(path) = &self.config.save_path {
            self.conversation.save(path).await?;
            debug!(path = %path.display(), "conversation saved");
        }
        Ok(())
    }
}

fn outcome_label(result: &Result<AgentResult, AgentError>) -> &'static str {
    match result {
        Ok(_) => "completed",
        Err(AgentError::Provider(_)) => "provider_error",
        Err(AgentError::LoopDepthExceeded { .. }) => "depth_exceeded",
        Err(AgentError::Conversation(_)) => "conversation_error",
        Err(_) => "error",
    }
}
