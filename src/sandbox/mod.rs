//! Sandboxed execution environments
//!
//! A [`SandboxEnvironment`] is an isolated place for an agent to run
//! commands and code, read and write files, install packages and take
//! snapshots. Each session is a private directory tree layered over the
//! host's pre-built runtimes:
//!
//! ```text
//! <state_dir>/<session_id>/
//! ├── workspace/     ← what commands see as the working directory
//! │                    (mapped from the configured "/workspace")
//! ├── scratch/       ← TMPDIR, generated source files
//! └── snapshots/
//!     ├── snap-0001-9f3c2a1b/   ← full copies of workspace/
//!     └── snap-0002-04be77d0/
//! ```
//!
//! Every spawned command runs in its own process group with a cleared
//! environment, inside the session's cgroup when the host allows it, with
//! dangerous capabilities removed and, if networking is disabled, a seccomp
//! filter that refuses IPv4/IPv6 sockets.
//!
//! # Lifecycle
//!
//! ```text
//!  Uninitialized ──initialize()──► Running ──teardown()──► Terminated
//!        │                          │   ▲                       ▲
//!        └── provisioning fails ────┼───┼───────────────────────┤
//!                                   │   └ restore_snapshot() ok │
//!                                   └── restore fails ──────────┘
//! ```

pub mod config;
pub mod environment;
pub mod language;
pub mod process;
pub mod snapshot;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use config::SandboxConfig;
pub use environment::SandboxEnvironment;
pub use language::{Language, PackageManager};
pub use process::CommandOutput;

/// Lifecycle state of a sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Uninitialized,
    Running,
    Terminated,
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxStatus::Uninitialized => write!(f, "uninitialized"),
            SandboxStatus::Running => write!(f, "running"),
            SandboxStatus::Terminated => write!(f, "terminated"),
        }
    }
}

/// Kind of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// One entry returned by `list_files`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    /// Path relative to the workspace root
    pub path: String,
    pub kind: FileKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    /// Unix permission bits, e.g. 0o644
    pub mode: u32,
}

/// Metadata about a stored snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Error type for sandbox operations
#[derive(Debug)]
pub enum SandboxError {
    /// The environment could not be brought up
    Provision(String),
    /// Operation requires a running sandbox
    NotRunning(SandboxStatus),
    UnsupportedLanguage(String),
    UnsupportedPackageManager(String),
    InvalidPackage(String),
    /// Path escapes the workspace or is malformed
    InvalidPath(String),
    NotFound(String),
    SnapshotNotFound(String),
    /// Restore failed part-way; the sandbox has been torn down
    RestoreFailed(String),
    Io(std::io::Error),
}

impl std::fmt::Display for SandboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxError::Provision(msg) => write!(f, "Sandbox provisioning failed: {}", msg),
            SandboxError::NotRunning(status) => write!(f, "Sandbox is not running ({})", status),
            SandboxError::UnsupportedLanguage(lang) => {
                write!(f, "Unsupported language: {}", lang)
            }
            SandboxError::UnsupportedPackageManager(manager) => {
                write!(f, "Unsupported package manager: {}", manager)
            }
            SandboxError::InvalidPackage(name) => write!(f, "Invalid package name: {:?}", name),
            SandboxError::InvalidPath(path) => write!(f, "Invalid path: {}", path),
            SandboxError::NotFound(path) => write!(f, "Not found: {}", path),
            SandboxError::SnapshotNotFound(id) => write!(f, "Snapshot not found: {}", id),
            SandboxError::RestoreFailed(msg) => write!(f, "Snapshot restore failed: {}", msg),
            SandboxError::Io(e) => write!(f, "Sandbox I/O error: {}", e),
        }
    }
}

impl std::error::Error for SandboxError {}

impl From<std::io::Error> for SandboxError {
    fn from(e: std::io::Error) -> Self {
        SandboxError::Io(e)
    }
}
