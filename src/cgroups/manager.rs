//! cgroup v2 resource isolation for sandbox sessions
//!
//! Each sandbox session gets its own cgroup under
//! /sys/fs/cgroup/agentvisor/{session_id}/ and every process the sandbox
//! spawns is moved into it.
//!
//! ```text
//! /sys/fs/cgroup/                     ← cgroup v2 root
//! └── agentvisor/                     ← our namespace
//!     ├── sbx-1a2b3c4d/               ← per-session cgroup
//!     │   ├── cpu.max                 ← CPU limit: "200000 100000" = 2 cores
//!     │   ├── memory.max              ← Memory limit in bytes
//!     │   ├── cgroup.procs            ← PIDs in this cgroup
//!     │   └── cgroup.kill             ← write "1" to SIGKILL everything
//!     └── sbx-5e6f7a8b/
//!         └── ...
//! ```
//!
//! When a process is added to a cgroup, the kernel enforces the limits:
//! - CPU: Process gets throttled if it exceeds its quota
//! - Memory: Process gets OOM-killed if it exceeds its limit

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Base path for cgroup v2 filesystem
const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Our namespace within the cgroup hierarchy
const CGROUP_NAMESPACE: &str = "agentvisor";

/// CPU accounting period in microseconds (100ms)
const CPU_PERIOD_USEC: u64 = 100_000;

/// Resource limits for a sandbox session
///
/// # CPU Quota Explained
///
/// cgroups v2 uses `cpu.max` with format: "{quota} {period}"
/// - period: Time slice in microseconds (usually 100000 = 100ms)
/// - quota: How many microseconds the cgroup can use per period
///
/// Examples:
/// - "100000 100000" = 1 CPU core (100% of one core)
/// - "200000 100000" = 2 CPU cores
/// - "50000 100000"  = 0.5 CPU cores (50% of one core)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Number of CPU cores (can be fractional, e.g., 0.5 for half a core)
    pub cpu_cores: f64,

    /// Memory limit in bytes
    pub memory_bytes: u64,
}

impl Default for ResourceLimits {
    /// 2 cores, 2GiB
    fn default() -> Self {
        Self {
            cpu_cores: 2.0,
            memory_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

impl ResourceLimits {
    /// Parse a memory size such as "512m", "2g" or "1048576".
    ///
    /// Suffixes k/m/g (optionally followed by "b" or "ib") are binary units.
    pub fn parse_memory(text: &str) -> Option<u64> {
        let lower = text.trim().to_ascii_lowercase();
        let digits_end = lower
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(lower.len());
        let (number, unit) = lower.split_at(digits_end);
        let value: f64 = number.parse().ok()?;
        let multiplier = match unit.trim() {
            "" | "b" => 1u64,
            "k" | "kb" | "kib" => 1024,
            "m" | "mb" | "mib" => 1024 * 1024,
            "g" | "gb" | "gib" => 1024 * 1024 * 1024,
            _ => return None,
        };
        (value >= 0.0).then(|| (value * multiplier as f64) as u64)
    }

    /// `cpu.max` contents for these limits
    pub(crate) fn cpu_max(&self) -> String {
        let quota = (self.cpu_cores * CPU_PERIOD_USEC as f64).max(1000.0) as u64;
        format!("{} {}", quota, CPU_PERIOD_USEC)
    }
}

/// Manages cgroup lifecycle for sandbox sessions
///
/// # Example
///
/// ```ignore
/// let manager = CgroupManager::new()?;
///
/// // Create cgroup with limits before spawning anything
/// manager.create("sbx-1", &ResourceLimits::default())?;
///
/// // A forked child joins by writing "0" to this file before exec
/// let procs = manager.procs_path("sbx-1");
///
/// // On teardown, kill stragglers and remove the cgroup
/// manager.kill_all("sbx-1")?;
/// manager.destroy("sbx-1")?;
/// ```
#[derive(Debug)]
pub struct CgroupManager {
    /// Base path: /sys/fs/cgroup/agentvisor
    base_path: PathBuf,
}

impl CgroupManager {
    /// Create a new CgroupManager under the system cgroup root
    ///
    /// This creates the agentvisor namespace directory if it doesn't exist,
    /// and enables the cpu and memory controllers for child cgroups.
    /// Requires root privileges or a delegated cgroup subtree.
    pub fn new() -> io::Result<Self> {
        Self::with_root(Path::new(CGROUP_ROOT))
    }

    /// Create a manager rooted at an arbitrary cgroup v2 mount
    ///
    /// # cgroups v2 Controller Delegation
    ///
    /// In cgroups v2, controllers must be explicitly enabled at the parent
    /// level before children can use them. We write "+cpu +memory" to
    /// `cgroup.subtree_control` to enable these controllers for sessions.
    pub fn with_root(root: &Path) -> io::Result<Self> {
        if !root.join("cgroup.controllers").exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a cgroup v2 mount", root.display()),
            ));
        }

        let base_path = root.join(CGROUP_NAMESPACE);
        if !base_path.exists() {
            fs::create_dir_all(&base_path)?;
        }

        fs::write(base_path.join("cgroup.subtree_control"), "+cpu +memory")?;

        Ok(Self { base_path })
    }

    /// Get the path to a session's cgroup directory
    fn session_path(&self, session_id: &str) -> PathBuf {
        self.base_path.join(session_id)
    }

    /// Create a cgroup for a session with resource limits
    ///
    /// # Arguments
    /// * `session_id` - Unique identifier for the sandbox session
    /// * `limits` - Resource limits to apply
    pub fn create(&self, session_id: &str, limits: &ResourceLimits) -> io::Result<()> {
        let cgroup_path = self.session_path(session_id);

        // The kernel populates the control files when the directory appears
        fs::create_dir_all(&cgroup_path)?;
        fs::write(cgroup_path.join("cpu.max"), limits.cpu_max())?;
        fs::write(
            cgroup_path.join("memory.max"),
            limits.memory_bytes.to_string(),
        )?;

        Ok(())
    }

    /// Path of a session's `cgroup.procs`
    ///
    /// A forked child can join the cgroup itself by writing "0" here.
    pub fn procs_path(&self, session_id: &str) -> PathBuf {
        self.session_path(session_id).join("cgroup.procs")
    }

    /// PIDs currently in a session's cgroup
    pub fn processes(&self, session_id: &str) -> io::Result<Vec<u32>> {
        let content = fs::read_to_string(self.session_path(session_id).join("cgroup.procs"))?;
        Ok(content
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect())
    }

    /// SIGKILL every process in a session's cgroup
    ///
    /// Uses `cgroup.kill` (Linux 5.14+) and falls back to signalling each
    /// PID listed in `cgroup.procs`.
    pub fn kill_all(&self, session_id: &str) -> io::Result<()> {
        let cgroup_path = self.session_path(session_id);
        if !cgroup_path.exists() {
            return Ok(());
        }
        if fs::write(cgroup_path.join("cgroup.kill"), "1").is_ok() {
            return Ok(());
        }
        for pid in self.processes(session_id)? {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
        Ok(())
    }

    /// Destroy a session's cgroup
    ///
    /// The kernel refuses to remove a cgroup that still has processes, so
    /// call [`CgroupManager::kill_all`] first.
    pub fn destroy(&self, session_id: &str) -> io::Result<()> {
        let cgroup_path = self.session_path(session_id);

        if cgroup_path.exists() {
            // rmdir (not rm -rf) - the kernel requires this
            fs::remove_dir(&cgroup_path)?;
        }

        Ok(())
    }

    /// Get current memory usage for a session (in bytes)
    pub fn get_memory_usage(&self, session_id: &str) -> io::Result<u64> {
        let content = fs::read_to_string(self.session_path(session_id).join("memory.current"))?;
        content
            .trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Get CPU usage statistics for a session from cpu.stat
    pub fn get_cpu_stats(&self, session_id: &str) -> io::Result<CpuStats> {
        let content = fs::read_to_string(self.session_path(session_id).join("cpu.stat"))?;
        Ok(CpuStats::parse(&content))
    }
}

/// CPU statistics from cpu.stat
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct CpuStats {
    /// Total CPU time consumed (microseconds)
    pub usage_usec: u64,
    /// User-mode CPU time (microseconds)
    pub user_usec: u64,
    /// Kernel-mode CPU time (microseconds)
    pub system_usec: u64,
    /// Number of times the cgroup was throttled
    pub nr_throttled: u64,
    /// Total time spent throttled (microseconds)
    pub throttled_usec: u64,
}

impl CpuStats {
    fn parse(content: &str) -> Self {
        let mut stats = CpuStats::default();
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            let value: u64 = value.parse().unwrap_or(0);
            match key {
                "usage_usec" => stats.usage_usec = value,
                "user_usec" => stats.user_usec = value,
                "system_usec" => stats.system_usec = value,
                "nr_throttled" => stats.nr_throttled = value,
                "throttled_usec" => stats.throttled_usec = value,
                _ => {}
            }
        }
        stats
    }
}
