//! Spawning isolated child processes
//!
//! Every sandbox command goes through [`run_isolated`]. The child is set up
//! between fork and exec:
//!
//! ```text
//!   fork ──► setpgid(0, 0)           own process group (killable as a unit)
//!        ──► write "0" > cgroup.procs join the session cgroup (best effort)
//!        ──► PR_CAPBSET_DROP ...      shrink the bounding set (best effort)
//!        ──► seccomp filter          only when networking is disabled
//!        ──► exec
//! ```
//!
//! When the command finishes, times out, or the caller's future is dropped,
//! the whole process group gets SIGKILL. Background jobs a command leaves
//! behind therefore do not outlive it.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use seccompiler::BpfProgram;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::security::{CapabilityDropper, NetworkSeccomp};

/// Exit code reported when a command hits its timeout
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code reported when the program could not be started
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// How long output readers get to drain after the process group is killed
const READER_GRACE: Duration = Duration::from_secs(1);

/// Result of one command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Either stream exceeded the capture limit
    pub truncated: bool,
    pub duration_ms: f64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    fn spawn_failure(program: &str, err: io::Error, started: Instant) -> Self {
        Self {
            exit_code: SPAWN_FAILURE_EXIT_CODE,
            stdout: String::new(),
            stderr: format!("failed to start {}: {}", program, err),
            timed_out: false,
            truncated: false,
            duration_ms: elapsed_ms(started),
        }
    }
}

/// What to run
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// The complete child environment; nothing is inherited
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

/// Isolation applied in the child before exec
#[derive(Debug, Clone, Default)]
pub struct Isolation {
    /// Compiled network-deny filter
    pub network_filter: Option<Arc<BpfProgram>>,
    pub capabilities: Option<CapabilityDropper>,
    /// Path of the session's `cgroup.procs`
    pub cgroup_procs: Option<CString>,
}

impl Isolation {
    fn install(&self, cmd: &mut Command) {
        let network_filter = self.network_filter.clone();
        let capabilities = self.capabilities.clone();
        let cgroup_procs = self.cgroup_procs.clone();

        // SAFETY: the closure runs between fork and exec and only issues
        // raw syscalls on data prepared in the parent.
        unsafe {
            cmd.pre_exec(move || {
                if libc::setpgid(0, 0) != 0 {
                    return Err(io::Error::last_os_error());
                }

                if let Some(path) = &cgroup_procs {
                    let fd = libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
                    if fd >= 0 {
                        libc::write(fd, b"0".as_ptr() as *const libc::c_void, 1);
                        libc::close(fd);
                    }
                }

                if let Some(dropper) = &capabilities {
                    let _ = dropper.apply_bounding();
                }

                if let Some(program) = &network_filter {
                    NetworkSeccomp::apply(program)?;
                }

                Ok(())
            });
        }
    }
}

/// SIGKILLs the child's process group when dropped
struct ProcessGroup(Option<Pid>);

impl ProcessGroup {
    fn kill(&mut self) {
        if let Some(pgid) = self.0.take() {
            // ESRCH just means everybody is already gone
            let _ = killpg(pgid, Signal::SIGKILL);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Run one command to completion under `isolation`.
///
/// Never fails: spawn errors, timeouts and signals are all folded into the
/// returned [`CommandOutput`].
pub async fn run_isolated(spec: &CommandSpec, isolation: &Isolation) -> CommandOutput {
    let started = Instant::now();

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .env_clear()
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    isolation.install(&mut cmd);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return CommandOutput::spawn_failure(&spec.program, e, started),
    };

    // setpgid(0, 0) made the child's pid its group id
    let mut group = ProcessGroup(child.id().map(|pid| Pid::from_raw(pid as i32)));

    let limit = spec.max_output_bytes;
    let stdout_task = spawn_reader(child.stdout.take(), limit);
    let stderr_task = spawn_reader(child.stderr.take(), limit);

    let mut notes = Vec::new();
    let (exit_code, timed_out) = match tokio::time::timeout(spec.timeout, child.wait()).await {
        Ok(Ok(status)) => {
            let code = status
                .code()
                .or_else(|| status.signal().map(|sig| 128 + sig))
                .unwrap_or(-1);
            (code, false)
        }
        Ok(Err(e)) => {
            notes.push(format!("failed to wait for process: {}", e));
            (-1, false)
        }
        Err(_) => {
            group.kill();
            let _ = child.start_kill();
            let _ = child.wait().await;
            notes.push(format!("Command timed out after {}s", format_secs(spec.timeout)));
            (TIMEOUT_EXIT_CODE, true)
        }
    };

    group.kill();

    let (stdout, stdout_truncated) = collect(stdout_task).await;
    let (stderr, stderr_truncated) = collect(stderr_task).await;
    let truncated = stdout_truncated || stderr_truncated;

    let mut stdout = String::from_utf8_lossy(&stdout).into_owned();
    let mut stderr = String::from_utf8_lossy(&stderr).into_owned();
    if stdout_truncated {
        stdout.push_str("\n[output truncated]");
    }
    if stderr_truncated {
        stderr.push_str("\n[output truncated]");
    }
    for note in notes {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&note);
    }

    CommandOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
        truncated,
        duration_ms: elapsed_ms(started),
    }
}

fn spawn_reader<R>(stream: Option<R>, limit: usize) -> JoinHandle<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        match stream {
            Some(stream) => read_capped(stream, limit).await,
            None => (Vec::new(), false),
        }
    })
}

/// Keep the first `limit` bytes but drain everything, so the writer
/// never blocks on a full pipe
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> (Vec<u8>, bool) {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }

    (kept, truncated)
}

async fn collect(task: JoinHandle<(Vec<u8>, bool)>) -> (Vec<u8>, bool) {
    let abort = task.abort_handle();
    match tokio::time::timeout(READER_GRACE, task).await {
        Ok(Ok(output)) => output,
        Ok(Err(_)) => (Vec::new(), false),
        Err(_) => {
            // a descendant escaped the process group and still holds the pipe
            abort.abort();
            (Vec::new(), true)
        }
    }
}

fn format_secs(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        duration.as_secs().to_string()
    } else {
        format!("{:.3}", duration.as_secs_f64())
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(program: &str, args: &[&str]) -> CommandSpec {
        let mut env = BTreeMap::new();
        env.insert(
            "PATH".to_string(),
            std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string()),
        );
        CommandSpec {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: std::env::temp_dir(),
            env,
            timeout: Duration::from_secs(10),
            max_output_bytes: 1024,
        }
    }

    #[tokio::test]
    async fn test_captures_both_streams() {
        let out = run_isolated(
            &spec("sh", &["-c", "echo out; echo err >&2; exit 3"]),
            &Isolation::default(),
        )
        .await;
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert!(!out.timed_out);
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_environment_is_not_inherited() {
        std::env::set_var("AGENTVISOR_PROCESS_TEST_SECRET", "leak");
        let out = run_isolated(
            &spec("sh", &["-c", "echo \"[$AGENTVISOR_PROCESS_TEST_SECRET]\""]),
            &Isolation::default(),
        )
        .await;
        assert_eq!(out.stdout, "[]\n");
    }

    #[tokio::test]
    async fn test_timeout() {
        let mut s = spec("sh", &["-c", "sleep 5"]);
        s.timeout = Duration::from_millis(200);
        let out = run_isolated(&s, &Isolation::default()).await;
        assert!(out.timed_out);
        assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
        assert!(out.stderr.contains("timed out"));
        assert!(out.duration_ms < 4000.0);
    }

    #[tokio::test]
    async fn test_background_job_does_not_hold_output() {
        let s = spec("sh", &["-c", "sleep 30 & echo started"]);
        let started = Instant::now();
        let out = run_isolated(&s, &Isolation::default()).await;
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, "started\n");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let mut s = spec("sh", &["-c", "head -c 5000 /dev/zero | tr '\\0' 'x'"]);
        s.max_output_bytes = 100;
        let out = run_isolated(&s, &Isolation::default()).await;
        assert!(out.truncated);
        assert!(out.stdout.starts_with(&"x".repeat(100)));
        assert!(out.stdout.ends_with("[output truncated]"));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let out = run_isolated(
            &spec("definitely-not-a-real-program-xyz", &[]),
            &Isolation::default(),
        )
        .await;
        assert_eq!(out.exit_code, SPAWN_FAILURE_EXIT_CODE);
        assert!(out.stderr.contains("failed to start"));
    }

    #[tokio::test]
    async fn test_network_filter_blocks_inet_sockets() {
        let program = NetworkSeccomp::deny_inet().build().unwrap();
        let isolation = Isolation {
            network_filter: Some(Arc::new(program)),
            ..Isolation::default()
        };
        // bash's /dev/tcp needs socket(AF_INET); sh -c keeps this portable
        let out = run_isolated(
            &spec(
                "sh",
                &["-c", "command -v bash >/dev/null || exit 0; bash -c 'exec 3<>/dev/tcp/127.0.0.1/9' 2>/dev/null && echo open || echo blocked"],
            ),
            &isolation,
        )
        .await;
        assert_eq!(out.exit_code, 0);
        assert!(!out.stdout.contains("open"));
    }
}
