//! Prometheus metrics for the agent loop, tools, providers and sandboxes
//!
//! All metrics live in the default registry; [`gather`] renders them in the
//! text exposition format for whatever endpoint the embedding application
//! exposes.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, register_histogram_vec,
    CounterVec, Encoder, Gauge, Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Agent Loop Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Completed agent exchanges by outcome.
    ///
    /// Labels:
    /// - outcome: "success", "loop_depth_exceeded", "provider_error", "error"
    pub static ref AGENT_RUNS: CounterVec = register_counter_vec!(
        "agentvisor_agent_runs_total",
        "Agent exchanges by outcome",
        &["outcome"]
    ).expect("failed to register AGENT_RUNS metric");

    /// Provider turns needed to resolve one exchange.
    pub static ref AGENT_ITERATIONS: Histogram = register_histogram!(
        "agentvisor_agent_iterations",
        "Provider turns per agent exchange",
        vec![1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 25.0, 50.0]
    ).expect("failed to register AGENT_ITERATIONS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Tool Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Tool invocations by tool name and outcome.
    ///
    /// Labels:
    /// - tool: registered tool name ("unknown" for names not in the registry)
    /// - outcome: "success", "failure", "invalid", "not_found"
    pub static ref TOOL_CALLS: CounterVec = register_counter_vec!(
        "agentvisor_tool_calls_total",
        "Tool invocations by tool and outcome",
        &["tool", "outcome"]
    ).expect("failed to register TOOL_CALLS metric");

    pub static ref TOOL_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "agentvisor_tool_call_duration_seconds",
        "Wall time spent inside tool execution",
        &["tool"]
    ).expect("failed to register TOOL_CALL_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Provider Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Latency of one provider turn (request until the turn is fully assembled).
    ///
    /// Labels:
    /// - provider: provider name (e.g. "ollama")
    /// - mode: "single" or "stream"
    pub static ref PROVIDER_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "agentvisor_provider_call_duration_seconds",
        "Provider turn latency",
        &["provider", "mode"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).expect("failed to register PROVIDER_CALL_DURATION metric");

    pub static ref PROVIDER_ERRORS: CounterVec = register_counter_vec!(
        "agentvisor_provider_errors_total",
        "Provider failures, including retried ones",
        &["provider"]
    ).expect("failed to register PROVIDER_ERRORS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Sandbox Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Commands run inside sandboxes.
    ///
    /// Labels:
    /// - kind: "command", "code", "install"
    /// - status: "success", "error", "timeout"
    pub static ref SANDBOX_COMMANDS: CounterVec = register_counter_vec!(
        "agentvisor_sandbox_commands_total",
        "Sandboxed command executions by kind and status",
        &["kind", "status"]
    ).expect("failed to register SANDBOX_COMMANDS metric");

    pub static ref SANDBOX_COMMAND_DURATION: HistogramVec = register_histogram_vec!(
        "agentvisor_sandbox_command_duration_seconds",
        "Sandboxed command duration",
        &["kind"]
    ).expect("failed to register SANDBOX_COMMAND_DURATION metric");

    /// Snapshot operations.
    ///
    /// Labels:
    /// - op: "create", "restore"
    /// - outcome: "success", "failure"
    pub static ref SANDBOX_SNAPSHOTS: CounterVec = register_counter_vec!(
        "agentvisor_sandbox_snapshots_total",
        "Sandbox snapshot operations",
        &["op", "outcome"]
    ).expect("failed to register SANDBOX_SNAPSHOTS metric");

    /// Sandboxes currently initialized and not yet torn down.
    pub static ref SANDBOXES_ACTIVE: Gauge = register_gauge!(
        "agentvisor_sandboxes_active",
        "Number of running sandbox environments"
    ).expect("failed to register SANDBOXES_ACTIVE metric");
}

/// Render every registered metric in the Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}
