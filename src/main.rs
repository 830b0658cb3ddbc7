//! agentvisor - run one task with a sandboxed agent against Ollama
//!
//! ```text
//! agentvisor "write a script that prints the first 10 primes and run it"
//! ```
//!
//! Configuration comes from the environment: `OLLAMA_HOST`,
//! `AGENTVISOR_MODEL`, `AGENTVISOR_SYSTEM_PROMPT`, `AGENTVISOR_MAX_DEPTH`,
//! `AGENTVISOR_SANDBOX_*`, `AGENTVISOR_CONVERSATION_DIR`,
//! `AGENTVISOR_OTLP_ENDPOINT` and `RUST_LOG`.

use std::sync::Arc;

use agentvisor::conversation::ConversationStore;
use agentvisor::tracing::{init_tracing, shutdown_tracing, OTLP_ENDPOINT_ENV};
use agentvisor::{AgentConfig, OllamaConfig, OllamaProvider, SandboxConfig, SandboxedAgent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let task = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if task.trim().is_empty() {
        eprintln!("usage: agentvisor <task>");
        std::process::exit(2);
    }

    let otlp_endpoint = std::env::var(OTLP_ENDPOINT_ENV).ok();
    init_tracing("agentvisor", otlp_endpoint.as_deref())?;

    let provider = Arc::new(OllamaProvider::new(OllamaConfig::from_env())?);
    let mut agent = SandboxedAgent::new(
        provider,
        AgentConfig::from_env(),
        SandboxConfig::from_env(),
    );

    let system_prompt = std::env::var("AGENTVISOR_SYSTEM_PROMPT").ok();
    let outcome = agent.run_detailed(&task, system_prompt.as_deref()).await;

    let report = agent.report().await;
    tracing::info!(
        session_id = ?report.session_id,
        snapshots = report.snapshots.len(),
        messages = report.conversation_len,
        "sandbox summary"
    );
    agent.shutdown().await;

    if let Ok(dir) = std::env::var("AGENTVISOR_CONVERSATION_DIR") {
        let saved = match ConversationStore::new(&dir) {
            Ok(store) => store.save(agent.conversation()).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match saved {
            Ok(path) => tracing::info!(path = %path.display(), "conversation saved"),
            Err(e) => tracing::warn!(dir = %dir, error = %e, "failed to save conversation"),
        }
    }

    let exit_code = match outcome {
        Ok(result) => {
            println!("{}", result.final_response);
            eprintln!(
                "[AGENT] run {} finished: {} iterations, {} tool calls",
                result.run_id, result.iterations, result.tool_calls_made
            );
            0
        }
        Err(e) => {
            eprintln!("[AGENT] failed: {}", e);
            1
        }
    };

    shutdown_tracing();
    std::process::exit(exit_code);
}
