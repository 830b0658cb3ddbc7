//! Integration tests for SandboxedAgent checkpoints
//!
//! A scripted provider drives the sandbox tools so that files and
//! conversation change together between checkpoints.

mod common;

use std::path::Path;
use std::sync::Arc;

use agentvisor::agent::{AgentConfig, AgentError, SandboxedAgent};
use agentvisor::conversation::{Conversation, Message, Role};
use agentvisor::provider::Turn;
use agentvisor::sandbox::{SandboxConfig, SandboxEnvironment, SandboxError, SandboxStatus};
use serde_json::json;

use common::{call, calls, ScriptedProvider};

fn sandbox_config(dir: &Path) -> SandboxConfig {
    SandboxConfig {
        use_cgroups: false,
        drop_capabilities: false,
        ..SandboxConfig::default()
    }
    .with_state_dir(dir)
}

fn write_then_answer(id: &str, content: &str, answer: &str) -> Vec<Turn> {
    vec![
        calls(vec![call(
            id,
            "sandbox_write_file",
            json!({ "path": "state.txt", "content": content }),
        )]),
        Turn::text(answer),
    ]
}

fn agent(dir: &Path, script: Vec<Turn>) -> SandboxedAgent {
    SandboxedAgent::new(
        Arc::new(ScriptedProvider::new(script)),
        AgentConfig::default(),
        sandbox_config(dir),
    )
}

fn snapshot_dir(sandbox: &SandboxEnvironment, snapshot_id: &str) -> std::path::PathBuf {
    sandbox
        .workspace_path()
        .parent()
        .unwrap()
        .join("snapshots")
        .join(snapshot_id)
}

async fn state_file(agent: &SandboxedAgent) -> Option<String> {
    agent
        .sandbox()
        .unwrap()
        .read_to_string("state.txt")
        .await
        .unwrap()
}

/// Test the sandbox is provisioned lazily and its tools registered
#[tokio::test]
async fn test_sandbox_tools_registered_on_first_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut agent = agent(dir.path(), vec![Turn::text("ready")]);
    assert!(agent.sandbox().is_none());

    agent.run("hello", Some("Be brief.")).await.unwrap();

    let sandbox = agent.sandbox().unwrap();
    assert_eq!(sandbox.status().await, SandboxStatus::Running);
    assert!(agent.registry().contains("sandbox_run_command"));
    assert!(agent.registry().contains("sandbox_restore_snapshot"));

    let system = agent.conversation().system_prompt().unwrap();
    assert!(system.starts_with("Be brief."));
    assert!(system.contains("/workspace"));

    agent.shutdown().await;
}

/// Test restoring a checkpoint rolls back files and conversation together
#[tokio::test]
async fn test_restore_checkpoint_rolls_back_both() {
    let dir = tempfile::tempdir().unwrap();
    let mut script = write_then_answer("w1", "X", "Wrote X.");
    script.extend(write_then_answer("w2", "Y", "Wrote Y."));
    let mut agent = agent(dir.path(), script);

    agent.run("write X", None).await.unwrap();
    assert_eq!(state_file(&agent).await.as_deref(), Some("X"));
    let len_at_checkpoint = agent.conversation().len();
    let checkpoint = agent.create_checkpoint("after-x").await.unwrap();

    agent.run("write Y", None).await.unwrap();
    assert_eq!(state_file(&agent).await.as_deref(), Some("Y"));
    agent.create_checkpoint("after-y").await.unwrap();
    assert_eq!(agent.checkpoints().len(), 2);

    agent.restore_checkpoint("after-x").await.unwrap();

    assert_eq!(state_file(&agent).await.as_deref(), Some("X"));
    assert_eq!(agent.conversation().len(), len_at_checkpoint);
    assert_eq!(
        agent.conversation().last().map(|m| m.content.as_str()),
        Some("Wrote X.")
    );
    let remaining: Vec<_> = agent.checkpoints().iter().map(|c| c.id.as_str()).collect();
    assert_eq!(remaining, [checkpoint.as_str()]);

    // restoring by id works as well
    agent.restore_checkpoint(&checkpoint).await.unwrap();
    assert_eq!(agent.conversation().len(), len_at_checkpoint);

    agent.shutdown().await;
}

/// Test an unknown checkpoint leaves files and conversation untouched
#[tokio::test]
async fn test_unknown_checkpoint_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut agent = agent(dir.path(), write_then_answer("w1", "X", "Wrote X."));

    agent.run("write X", None).await.unwrap();
    let before = agent.conversation().clone();

    assert!(matches!(
        agent.restore_checkpoint("never-made").await,
        Err(AgentError::CheckpointNotFound(_))
    ));
    assert_eq!(agent.conversation(), &before);
    assert_eq!(state_file(&agent).await.as_deref(), Some("X"));

    agent.shutdown().await;
}

/// Test a checkpoint taken before the sandbox prompt existed still lands on
/// the same message once the prompt is prepended
#[tokio::test]
async fn test_checkpoint_survives_prompt_insertion() {
    let dir = tempfile::tempdir().unwrap();
    let saved = dir.path().join("saved.json");
    let mut conversation = Conversation::new();
    conversation.push(Message::user("u1")).unwrap();
    conversation.push(Message::assistant("a1")).unwrap();
    conversation.save(&saved).await.unwrap();

    let mut agent = agent(dir.path(), vec![Turn::text("a2")]);
    agent.load_conversation(&saved).await.unwrap();
    let checkpoint = agent.create_checkpoint("loaded").await.unwrap();
    assert_eq!(agent.checkpoints()[0].conversation_len, 2);

    agent.run("u2", None).await.unwrap();
    assert_eq!(agent.conversation().messages()[0].role, Role::System);
    assert_eq!(agent.checkpoints()[0].conversation_len, 3);

    agent.restore_checkpoint(&checkpoint).await.unwrap();
    assert_eq!(agent.conversation().len(), 3);
    assert_eq!(agent.conversation().messages()[0].role, Role::System);
    assert_eq!(
        agent.conversation().last().map(|m| m.content.as_str()),
        Some("a1")
    );

    agent.shutdown().await;
}

/// Test a failed checkpoint restore keeps the conversation and drops the
/// lost sandbox
#[tokio::test]
async fn test_failed_checkpoint_restore() {
    let dir = tempfile::tempdir().unwrap();
    let mut script = write_then_answer("w1", "X", "Wrote X.");
    script.extend(write_then_answer("w2", "Y", "Wrote Y."));
    let mut agent = agent(dir.path(), script);

    agent.run("write X", None).await.unwrap();
    let checkpoint = agent.create_checkpoint("after-x").await.unwrap();
    agent.run("write Y", None).await.unwrap();
    let before = agent.conversation().clone();

    std::fs::remove_dir_all(snapshot_dir(agent.sandbox().unwrap(), &checkpoint)).unwrap();

    assert!(matches!(
        agent.restore_checkpoint(&checkpoint).await,
        Err(AgentError::Sandbox(SandboxError::RestoreFailed(_)))
    ));
    assert_eq!(agent.conversation(), &before);
    assert!(agent.sandbox().is_none());
    assert!(agent.checkpoints().is_empty());

    agent.shutdown().await;
}

/// Test a sandbox terminated by a failed restore tool call is replaced on
/// the next run
#[tokio::test]
async fn test_terminated_sandbox_replaced_on_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut agent = agent(dir.path(), write_then_answer("w1", "X", "Wrote X."));
    agent.initialize_sandbox().await.unwrap();

    let old = agent.sandbox().unwrap().clone();
    let snapshot = old.create_snapshot().await.unwrap();
    std::fs::remove_dir_all(snapshot_dir(&old, &snapshot.snapshot_id)).unwrap();

    let result = agent
        .registry()
        .execute(
            "sandbox_restore_snapshot",
            &json!({ "snapshot_id": snapshot.snapshot_id }),
        )
        .await;
    assert!(!result.success());
    assert_eq!(old.status().await, SandboxStatus::Terminated);

    assert_eq!(agent.run("write X", None).await.unwrap(), "Wrote X.");
    let current = agent.sandbox().unwrap();
    assert_ne!(current.session_id(), old.session_id());
    assert_eq!(current.status().await, SandboxStatus::Running);
    assert_eq!(state_file(&agent).await.as_deref(), Some("X"));

    agent.shutdown().await;
}

/// Test replacing the conversation forgets checkpoints that pointed into it
#[tokio::test]
async fn test_clear_and_load_drop_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let saved = dir.path().join("saved.json");
    let mut agent = agent(
        dir.path(),
        vec![Turn::text("first"), Turn::text("second")],
    );

    agent.run("one", None).await.unwrap();
    agent.save_conversation(&saved).await.unwrap();
    agent.run("two", None).await.unwrap();
    let late = agent.create_checkpoint("late").await.unwrap();

    agent.load_conversation(&saved).await.unwrap();
    assert!(agent.checkpoints().is_empty());
    assert!(matches!(
        agent.restore_checkpoint(&late).await,
        Err(AgentError::CheckpointNotFound(_))
    ));

    agent.clear_conversation();
    let empty = agent.create_checkpoint("empty").await.unwrap();
    assert_eq!(agent.checkpoints()[0].conversation_len, 0);
    agent.restore_checkpoint(&empty).await.unwrap();
    assert!(agent.conversation().is_empty());

    agent.shutdown().await;
}

/// Test the report reflects sandbox, snapshots and checkpoints
#[tokio::test]
async fn test_report_and_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let mut agent = agent(dir.path(), vec![Turn::text("ok")]);

    let report = agent.report().await;
    assert_eq!(report.status, SandboxStatus::Uninitialized);
    assert!(report.session_id.is_none());

    agent.run("hi", None).await.unwrap();
    agent.create_checkpoint("start").await.unwrap();
    let report = agent.report().await;
    assert_eq!(report.status, SandboxStatus::Running);
    assert_eq!(report.snapshots.len(), 1);
    assert_eq!(report.checkpoints.len(), 1);
    assert_eq!(report.conversation_len, agent.conversation().len());
    assert!(agent
        .conversation()
        .messages()
        .iter()
        .any(|m| m.role == Role::Assistant && m.content == "ok"));

    let sandbox = agent.sandbox().unwrap().clone();
    agent.shutdown().await;
    assert_eq!(sandbox.status().await, SandboxStatus::Terminated);
    assert!(agent.sandbox().is_none());
    assert!(agent.checkpoints().is_empty());
}
