//! Integration tests for the agent loop
//!
//! These drive the Agent against scripted providers and in-process tools,
//! so no model backend is needed.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use agentvisor::agent::{Agent, AgentConfig, AgentError, AgentEvent};
use agentvisor::conversation::{Conversation, Message, Role};
use agentvisor::provider::Turn;
use futures_util::StreamExt;
use serde_json::{json, Value};

use common::{
    call, calls, sleep_call, FailingTool, MemoryProvider, PanicTool, ScriptedProvider, SleepTool,
};

fn agent_with(provider: Arc<ScriptedProvider>, config: AgentConfig) -> Agent {
    let mut agent = Agent::new(provider, config);
    agent.register_tool(Arc::new(SleepTool)).unwrap();
    agent.register_tool(Arc::new(PanicTool)).unwrap();
    agent.register_tool(Arc::new(FailingTool)).unwrap();
    agent
}

fn tool_results(conversation: &Conversation) -> Vec<(String, Value)> {
    conversation
        .messages()
        .iter()
        .filter(|m| m.role == Role::Tool)
        .map(|m| {
            (
                m.tool_invocation_id.clone().unwrap(),
                serde_json::from_str(&m.content).unwrap(),
            )
        })
        .collect()
}

/// Shape of a message without its timestamp
fn shape(message: &Message) -> (Role, String, Value, Option<String>) {
    (
        message.role,
        message.content.clone(),
        serde_json::to_value(&message.tool_invocations).unwrap(),
        message.tool_invocation_id.clone(),
    )
}

fn two_step_script() -> Vec<Turn> {
    vec![
        Turn::with_invocations(
            "Let me check.",
            vec![
                sleep_call("c1", "first", 30),
                sleep_call("c2", "second", 0),
            ],
        ),
        Turn::text("Both done: first, second."),
    ]
}

/// Test that AgentConfig has sensible defaults
#[test]
fn test_agent_config_defaults() {
    let config = AgentConfig::default();

    assert_eq!(config.max_depth, 25);
    assert!(config.tools_enabled);
    assert!(!config.stream);
    assert_eq!(config.provider_retries, 0);
    assert!(config.history_window.is_none());
    assert!(!config.auto_save);
}

/// Test the agent remembers earlier turns and forgets them after a clear
#[tokio::test]
async fn test_memory_across_turns_and_clear() {
    let mut agent = Agent::new(Arc::new(MemoryProvider), AgentConfig::default());

    agent.run("My name is Alice.", None).await.unwrap();
    let answer = agent.run("What's my name?", None).await.unwrap();
    assert!(answer.contains("Alice"));

    agent.clear_conversation();
    assert!(agent.conversation().is_empty());

    let answer = agent.run("What's my name?", None).await.unwrap();
    assert!(!answer.contains("Alice"));
}

/// Test N invocations produce N results in declaration order, run concurrently
#[tokio::test]
async fn test_results_follow_declaration_order() {
    let invocations: Vec<_> = (0..5)
        .map(|i| sleep_call(&format!("c{}", i), &format!("r{}", i), (5 - i) * 40))
        .collect();
    let provider = Arc::new(ScriptedProvider::new(vec![
        calls(invocations),
        Turn::text("done"),
    ]));
    let mut agent = agent_with(provider, AgentConfig::default());

    let started = Instant::now();
    let result = agent.run_detailed("go", None).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.final_response, "done");
    assert_eq!(result.tool_calls_made, 5);
    assert_eq!(result.iterations, 2);

    let results = tool_results(agent.conversation());
    let ids: Vec<_> = results.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, ["c0", "c1", "c2", "c3", "c4"]);
    for (i, (_, content)) in results.iter().enumerate() {
        assert_eq!(content["output"], json!(format!("r{}", i)));
    }

    // sequential would be 40+80+120+160+200 ms
    assert!(elapsed < Duration::from_millis(550), "took {:?}", elapsed);
}

/// Test an unknown tool becomes a failed result instead of an error
#[tokio::test]
async fn test_unknown_tool_never_raises() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        calls(vec![call("c1", "does_not_exist", json!({}))]),
        Turn::text("Sorry, that tool is missing."),
    ]));
    let mut agent = agent_with(provider, AgentConfig::default());

    let answer = agent.run("use a tool", None).await.unwrap();
    assert_eq!(answer, "Sorry, that tool is missing.");

    let results = tool_results(agent.conversation());
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].1["success"], json!(false));
    assert_eq!(
        results[0].1["error"],
        json!("Tool 'does_not_exist' not found")
    );
}

/// Test panicking and failing tools still let the loop reach an answer
#[tokio::test]
async fn test_throwing_tools_still_yield_terminal_answer() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        calls(vec![
            call("c1", "explode", json!({})),
            call("c2", "fail", json!({})),
            call("c3", "sleep", json!({"delay_ms": 1})),
        ]),
        Turn::text("Recovered."),
    ]));
    let mut agent = agent_with(provider, AgentConfig::default());

    assert_eq!(agent.run("try", None).await.unwrap(), "Recovered.");

    let results = tool_results(agent.conversation());
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|(_, r)| r["success"] == json!(false)));
    assert!(results[0].1["error"].as_str().unwrap().contains("tool blew up"));
    assert!(results[1].1["error"]
        .as_str()
        .unwrap()
        .contains("backend unavailable"));
    // missing required "label"
    assert!(results[2].1["error"].as_str().unwrap().contains("label"));
}

/// Test a provider that never stops calling tools hits the depth limit
#[tokio::test]
async fn test_loop_depth_exceeded() {
    let provider = Arc::new(ScriptedProvider::repeating(vec![calls(vec![sleep_call(
        "again", "x", 0,
    )])]));
    let config = AgentConfig {
        max_depth: 3,
        ..AgentConfig::default()
    };
    let mut agent = agent_with(provider.clone(), config);

    match agent.run("loop forever", None).await {
        Err(AgentError::LoopDepthExceeded { depth }) => assert_eq!(depth, 3),
        other => panic!("expected LoopDepthExceeded, got {:?}", other),
    }

    // user message + three committed (assistant, result) pairs stay inspectable
    assert_eq!(agent.conversation().len(), 7);
    assert_eq!(provider.requests().len(), 3);
    agent.conversation().validate().unwrap();
}

/// Test the system prompt is installed once no matter how often it is passed
#[tokio::test]
async fn test_system_prompt_is_idempotent() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        Turn::text("one"),
        Turn::text("two"),
    ]));
    let mut agent = agent_with(provider, AgentConfig::default());

    agent.run("first", Some("You are terse.")).await.unwrap();
    agent.run("second", Some("You are terse.")).await.unwrap();

    let messages = agent.conversation().messages();
    let systems = messages.iter().filter(|m| m.role == Role::System).count();
    assert_eq!(systems, 1);
    assert_eq!(messages[0].role, Role::System);
    assert_eq!(agent.conversation().system_prompt(), Some("You are terse."));
}

/// Test provider failures surface to the caller
#[tokio::test]
async fn test_provider_error_propagates() {
    let provider = Arc::new(ScriptedProvider::new(Vec::new()));
    let mut agent = agent_with(provider, AgentConfig::default());

    assert!(matches!(
        agent.run("hello", None).await,
        Err(AgentError::Provider(_))
    ));
}

/// Test streaming and non-streaming reach the same conversation
#[tokio::test]
async fn test_streaming_matches_non_streaming() {
    let mut plain = agent_with(
        Arc::new(ScriptedProvider::new(two_step_script())),
        AgentConfig::default(),
    );
    let plain_answer = plain.run("do both", Some("sys")).await.unwrap();

    let mut streamed = agent_with(
        Arc::new(ScriptedProvider::new(two_step_script())),
        AgentConfig::default(),
    );
    let mut deltas = String::new();
    let mut started = Vec::new();
    let mut finished = Vec::new();
    let mut completed = None;
    {
        let events = streamed.stream_response("do both", Some("sys"));
        futures_util::pin_mut!(events);
        while let Some(event) = events.next().await {
            match event.unwrap() {
                AgentEvent::ContentDelta(text) => deltas.push_str(&text),
                AgentEvent::ToolCallStarted { id, .. } => started.push(id),
                AgentEvent::ToolCallFinished { id, success, .. } => {
                    assert!(success);
                    finished.push(id)
                }
                AgentEvent::Completed { final_text } => completed = Some(final_text),
            }
        }
    }

    assert_eq!(completed.as_deref(), Some(plain_answer.as_str()));
    assert_eq!(deltas, "Let me check.Both done: first, second.");
    assert_eq!(started, ["c1", "c2"]);
    assert_eq!(finished, ["c1", "c2"]);

    let plain_shape: Vec<_> = plain.conversation().messages().iter().map(shape).collect();
    let streamed_shape: Vec<_> = streamed
        .conversation()
        .messages()
        .iter()
        .map(shape)
        .collect();
    assert_eq!(plain_shape, streamed_shape);

    // run() in stream mode assembles the same turns
    let mut assembled = agent_with(
        Arc::new(ScriptedProvider::new(two_step_script())),
        AgentConfig {
            stream: true,
            ..AgentConfig::default()
        },
    );
    assembled.run("do both", Some("sys")).await.unwrap();
    let assembled_shape: Vec<_> = assembled
        .conversation()
        .messages()
        .iter()
        .map(shape)
        .collect();
    assert_eq!(plain_shape, assembled_shape);
}

/// Test abandoning a stream mid-turn leaves no half-written assistant turn
#[tokio::test]
async fn test_dropped_stream_leaves_no_partial_turn() {
    let provider = Arc::new(ScriptedProvider::new(two_step_script()));
    let mut agent = agent_with(provider, AgentConfig::default());

    {
        let events = agent.stream_response("do both", None);
        futures_util::pin_mut!(events);
        while let Some(event) = events.next().await {
            if matches!(event.unwrap(), AgentEvent::ToolCallStarted { .. }) {
                break;
            }
        }
    }

    let messages = agent.conversation().messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::User);
    agent.conversation().validate().unwrap();
}

/// Test only the windowed history (plus the system prompt) is sent
#[tokio::test]
async fn test_history_window_limits_request() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        Turn::text("a"),
        Turn::text("b"),
        Turn::text("c"),
    ]));
    let config = AgentConfig {
        history_window: Some(2),
        ..AgentConfig::default()
    };
    let mut agent = agent_with(provider.clone(), config);

    agent.run("one", Some("sys")).await.unwrap();
    agent.run("two", Some("sys")).await.unwrap();
    agent.run("three", Some("sys")).await.unwrap();

    let last = provider.requests().pop().unwrap();
    let roles: Vec<_> = last.messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, [Role::System, Role::Assistant, Role::User]);
    assert_eq!(last.messages[2].content, "three");
    assert_eq!(last.tools.len(), 3);
}

/// Test disabling tools hides them from the provider
#[tokio::test]
async fn test_tools_disabled() {
    let provider = Arc::new(ScriptedProvider::new(vec![Turn::text("plain")]));
    let config = AgentConfig {
        tools_enabled: false,
        ..AgentConfig::default()
    };
    let mut agent = agent_with(provider.clone(), config);

    agent.run("hi", None).await.unwrap();
    assert!(provider.requests()[0].tools.is_empty());
}

/// Test auto-save writes a conversation that loads back identically
#[tokio::test]
async fn test_auto_save_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conversation.json");
    let config = AgentConfig {
        auto_save: true,
        save_path: Some(path.clone()),
        ..AgentConfig::default()
    };
    let mut agent = agent_with(Arc::new(ScriptedProvider::new(two_step_script())), config);

    agent.run("do both", Some("sys")).await.unwrap();

    let loaded = Conversation::load(&path).await.unwrap();
    assert_eq!(&loaded, agent.conversation());

    let mut restored = agent_with(
        Arc::new(ScriptedProvider::new(Vec::new())),
        AgentConfig::default(),
    );
    restored.load_conversation(&path).await.unwrap();
    assert_eq!(restored.conversation().len(), agent.conversation().len());
}

/// Test repeated call ids in one turn still resolve every call
#[tokio::test]
async fn test_repeated_call_ids_do_not_abort_exchange() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        calls(vec![
            sleep_call("dup", "first", 0),
            sleep_call("dup", "second", 0),
        ]),
        Turn::text("Both ran."),
    ]));
    let mut agent = agent_with(provider, AgentConfig::default());

    let result = agent.run_detailed("twice", None).await.unwrap();
    assert_eq!(result.final_response, "Both ran.");
    assert_eq!(result.tool_calls_made, 2);

    let results = tool_results(agent.conversation());
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, "dup");
    assert_ne!(results[1].0, "dup");
    assert_eq!(results[0].1["output"], json!("first"));
    assert_eq!(results[1].1["output"], json!("second"));
    agent.conversation().validate().unwrap();
}

/// Test a zero history window sends only the system prompt
#[tokio::test]
async fn test_zero_history_window() {
    let provider = Arc::new(ScriptedProvider::new(vec![Turn::text("hi")]));
    let config = AgentConfig {
        history_window: Some(0),
        ..AgentConfig::default()
    };
    let mut agent = agent_with(provider.clone(), config);

    assert_eq!(agent.run("hello", Some("sys")).await.unwrap(), "hi");

    let request = &provider.requests()[0];
    assert_eq!(request.messages.len(), 1);
    assert_eq!(request.messages[0].role, Role::System);
}
