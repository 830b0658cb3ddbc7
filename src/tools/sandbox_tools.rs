//! Tools backed by a [`SandboxEnvironment`]
//!
//! Each tool is a thin adapter: it reads validated arguments, calls one
//! sandbox operation and folds the outcome into a [`ToolResult`]. Sandbox
//! errors become [`ToolError::Execution`] through `?`, and the registry
//! turns those into failed results for the model.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::sandbox::{CommandOutput, Language, PackageManager, SandboxEnvironment};

use super::{ParamType, Tool, ToolArgs, ToolDefinition, ToolError, ToolParameter, ToolResult};

/// Timeout used by `sandbox_run_command` when the model gives none
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Every sandbox tool bound to `sandbox`
pub fn all(sandbox: &Arc<SandboxEnvironment>) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(ExecuteCodeTool::new(sandbox.clone())),
        Arc::new(RunCommandTool::new(sandbox.clone())),
        Arc::new(ReadFileTool::new(sandbox.clone())),
        Arc::new(WriteFileTool::new(sandbox.clone())),
        Arc::new(ListFilesTool::new(sandbox.clone())),
        Arc::new(InstallPackageTool::new(sandbox.clone())),
        Arc::new(SnapshotTool::new(sandbox.clone())),
        Arc::new(RestoreSnapshotTool::new(sandbox.clone())),
        Arc::new(SystemInfoTool::new(sandbox.clone())),
    ]
}

/// Successful exit ⇒ ok result with the streams as output. Failures carry
/// no output, so the streams move into metadata.
fn command_result(output: CommandOutput) -> ToolResult {
    let result = if output.success() {
        ToolResult::ok(json!({
            "stdout": output.stdout,
            "stderr": output.stderr,
            "exit_code": output.exit_code,
        }))
    } else {
        let error = if output.timed_out {
            "Command timed out".to_string()
        } else {
            match output.stderr.trim() {
                "" => format!("Command exited with code {}", output.exit_code),
                detail => format!("Command exited with code {}: {}", output.exit_code, detail),
            }
        };
        ToolResult::failure(error)
            .with_metadata("stdout", output.stdout)
            .with_metadata("stderr", output.stderr)
    };

    result
        .with_metadata("exit_code", output.exit_code)
        .with_metadata("timed_out", output.timed_out)
        .with_metadata("truncated", output.truncated)
        .with_metadata("duration_ms", output.duration_ms)
}

fn timeout_arg(args: &ToolArgs) -> Option<Duration> {
    args.i64("timeout")
        .filter(|secs| *secs > 0)
        .map(|secs| Duration::from_secs(secs as u64))
}

fn timeout_param(description: &str) -> ToolParameter {
    ToolParameter::new("timeout", ParamType::Integer, description).optional()
}

macro_rules! sandbox_tool {
    ($name:ident) => {
        pub struct $name {
            sandbox: Arc<SandboxEnvironment>,
        }

        impl $name {
            pub fn new(sandbox: Arc<SandboxEnvironment>) -> Self {
                Self { sandbox }
            }
        }
    };
}

sandbox_tool!(ExecuteCodeTool);
sandbox_tool!(RunCommandTool);
sandbox_tool!(ReadFileTool);
sandbox_tool!(WriteFileTool);
sandbox_tool!(ListFilesTool);
sandbox_tool!(InstallPackageTool);
sandbox_tool!(SnapshotTool);
sandbox_tool!(RestoreSnapshotTool);
sandbox_tool!(SystemInfoTool);

#[async_trait]
impl Tool for ExecuteCodeTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "sandbox_execute_code",
            "Execute a code snippet inside the sandbox and return its output",
        )
        .param(ToolParameter::new("code", ParamType::String, "Source code to run"))
        .param(
            ToolParameter::new("language", ParamType::String, "Programming language")
                .with_default(json!("python"))
                .with_enum(Language::ALL.iter().map(|l| l.as_str())),
        )
        .param(timeout_param("Timeout in seconds"))
    }

    async fn execute(&self, args: ToolArgs) -> Result<ToolResult, ToolError> {
        let code = args.require_str("code")?;
        let language = args.str("language").unwrap_or("python");
        let output = self
            .sandbox
            .run_code(code, language, timeout_arg(&args))
            .await?;
        Ok(command_result(output).with_metadata("language", language))
    }
}

#[async_trait]
impl Tool for RunCommandTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "sandbox_run_command",
            "Run a shell command in the sandbox workspace",
        )
        .param(ToolParameter::new("command", ParamType::String, "Shell command line"))
        .param(
            ToolParameter::new("timeout", ParamType::Integer, "Timeout in seconds")
                .with_default(json!(DEFAULT_COMMAND_TIMEOUT_SECS)),
        )
    }

    async fn execute(&self, args: ToolArgs) -> Result<ToolResult, ToolError> {
        let command = args.require_str("command")?;
        let timeout =
            timeout_arg(&args).unwrap_or(Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS));
        let output = self.sandbox.run_command(command, Some(timeout)).await?;
        Ok(command_result(output))
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new("sandbox_read_file", "Read a text file from the sandbox")
            .param(ToolParameter::new(
                "path",
                ParamType::String,
                "File path, relative to the workspace or absolute under it",
            ))
    }

    async fn execute(&self, args: ToolArgs) -> Result<ToolResult, ToolError> {
        let path = args.require_str("path")?;
        match self.sandbox.read_to_string(path).await? {
            Some(content) => Ok(ToolResult::ok(content).with_metadata("path", path)),
            None => Ok(ToolResult::failure(format!("File not found: {}", path))),
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "sandbox_write_file",
            "Write a text file in the sandbox, creating parent directories",
        )
        .param(ToolParameter::new("path", ParamType::String, "Destination path"))
        .param(ToolParameter::new("content", ParamType::String, "File contents"))
    }

    async fn execute(&self, args: ToolArgs) -> Result<ToolResult, ToolError> {
        let path = args.require_str("path")?;
        let content = args.require_str("content")?;
        let written = self.sandbox.write_file(path, content).await?;
        Ok(ToolResult::ok(json!({ "path": path, "bytes_written": written })))
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new("sandbox_list_files", "List files in a sandbox directory")
            .param(
                ToolParameter::new("path", ParamType::String, "Directory to list")
                    .with_default(json!(".")),
            )
            .param(
                ToolParameter::new("recursive", ParamType::Boolean, "Descend into subdirectories")
                    .with_default(json!(false)),
            )
    }

    async fn execute(&self, args: ToolArgs) -> Result<ToolResult, ToolError> {
        let path = args.str("path").unwrap_or(".");
        let entries = if args.bool("recursive").unwrap_or(false) {
            self.sandbox.list_files_recursive(path).await?
        } else {
            self.sandbox.list_files(path).await?
        };
        let count = entries.len();
        let output = serde_json::to_value(entries)
            .map_err(|e| ToolError::Execution(e.to_string()))?;
        Ok(ToolResult::ok(output).with_metadata("count", count))
    }
}

#[async_trait]
impl Tool for InstallPackageTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new("sandbox_install_package", "Install a package in the sandbox")
            .param(ToolParameter::new("package", ParamType::String, "Package name"))
            .param(
                ToolParameter::new("manager", ParamType::String, "Package manager")
                    .with_default(json!("pip"))
                    .with_enum(PackageManager::ALL.iter().map(|m| m.as_str())),
            )
    }

    async fn execute(&self, args: ToolArgs) -> Result<ToolResult, ToolError> {
        let package = args.require_str("package")?;
        let manager = args.str("manager").unwrap_or("pip");
        let output = self.sandbox.install_package(package, manager).await?;
        Ok(command_result(output)
            .with_metadata("package", package)
            .with_metadata("manager", manager))
    }
}

#[async_trait]
impl Tool for SnapshotTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "sandbox_snapshot",
            "Save the current sandbox workspace so it can be restored later",
        )
    }

    async fn execute(&self, _args: ToolArgs) -> Result<ToolResult, ToolError> {
        let info = self.sandbox.create_snapshot().await?;
        let output =
            serde_json::to_value(info).map_err(|e| ToolError::Execution(e.to_string()))?;
        Ok(ToolResult::ok(output))
    }
}

#[async_trait]
impl Tool for RestoreSnapshotTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "sandbox_restore_snapshot",
            "Restore the sandbox workspace from a snapshot",
        )
        .param(ToolParameter::new(
            "snapshot_id",
            ParamType::String,
            "Id returned by sandbox_snapshot",
        ))
    }

    async fn execute(&self, args: ToolArgs) -> Result<ToolResult, ToolError> {
        let snapshot_id = args.require_str("snapshot_id")?;
        self.sandbox.restore_snapshot(snapshot_id).await?;
        Ok(ToolResult::ok(json!({ "restored": snapshot_id })))
    }
}

#[async_trait]
impl Tool for SystemInfoTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "sandbox_system_info",
            "Describe the sandbox runtime (OS, language versions, disk)",
        )
    }

    async fn execute(&self, _args: ToolArgs) -> Result<ToolResult, ToolError> {
        let info = self.sandbox.system_info().await?;
        Ok(ToolResult::ok(json!(info)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxConfig;
    use crate::tools::ToolRegistry;

    async fn registry() -> (tempfile::TempDir, Arc<SandboxEnvironment>, ToolRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let config = SandboxConfig {
            use_cgroups: false,
            drop_capabilities: false,
            ..SandboxConfig::default()
        }
        .with_state_dir(dir.path());
        let sandbox = Arc::new(SandboxEnvironment::new(config));
        sandbox.initialize().await.unwrap();

        let mut registry = ToolRegistry::new();
        for tool in all(&sandbox) {
            registry.register(tool).unwrap();
        }
        (dir, sandbox, registry)
    }

    #[tokio::test]
    async fn test_all_tools_register() {
        let (_dir, sandbox, registry) = registry().await;
        assert_eq!(registry.len(), 9);
        assert!(registry.contains("sandbox_execute_code"));
        assert!(registry.contains("sandbox_restore_snapshot"));
        sandbox.teardown().await;
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (_dir, sandbox, registry) = registry().await;

        let written = registry
            .execute(
                "sandbox_write_file",
                &json!({"path": "notes/a.txt", "content": "hi"}),
            )
            .await;
        assert!(written.success());

        let read = registry
            .execute("sandbox_read_file", &json!({"path": "notes/a.txt"}))
            .await;
        assert_eq!(read.output(), Some(&json!("hi")));

        let missing = registry
            .execute("sandbox_read_file", &json!({"path": "nope.txt"}))
            .await;
        assert!(!missing.success());
        assert!(missing.error().unwrap().contains("not found"));

        sandbox.teardown().await;
    }

    #[tokio::test]
    async fn test_failed_command_keeps_streams() {
        let (_dir, sandbox, registry) = registry().await;

        let result = registry
            .execute(
                "sandbox_run_command",
                &json!({"command": "echo partial; echo broken >&2; exit 2"}),
            )
            .await;
        assert!(!result.success());
        assert!(result.output().is_none());
        assert_eq!(result.metadata()["stdout"], json!("partial\n"));
        assert_eq!(result.metadata()["exit_code"], json!(2));
        assert!(result.error().unwrap().contains("broken"));

        sandbox.teardown().await;
    }

    #[tokio::test]
    async fn test_timeout_is_a_structured_failure() {
        let (_dir, sandbox, registry) = registry().await;

        let result = registry
            .execute(
                "sandbox_execute_code",
                &json!({"code": "sleep 5", "language": "sh", "timeout": 1}),
            )
            .await;
        assert!(!result.success());
        assert_eq!(result.metadata()["timed_out"], json!(true));
        assert_eq!(result.metadata()["exit_code"], json!(124));

        sandbox.teardown().await;
    }

    #[tokio::test]
    async fn test_path_escape_is_a_failed_result() {
        let (_dir, sandbox, registry) = registry().await;

        let result = registry
            .execute(
                "sandbox_write_file",
                &json!({"path": "../../escape.txt", "content": "x"}),
            )
            .await;
        assert!(!result.success());
        assert!(result.error().unwrap().contains("Invalid path"));

        sandbox.teardown().await;
    }
}
