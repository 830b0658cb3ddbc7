//! cgroups v2 resource isolation module
//!
//! This module provides resource limits (CPU, memory) for sandbox sessions
//! using Linux cgroups v2. Sandboxes use it when the host allows; without a
//! writable cgroup hierarchy they run unlimited and log a warning.
//!
//! # Example Usage
//!
//! ```ignore
//! use agentvisor::cgroups::{CgroupManager, ResourceLimits};
//!
//! let cgroups = CgroupManager::new()?;
//! cgroups.create("sbx-1", &ResourceLimits::default())?;
//! let procs = cgroups.procs_path("sbx-1"); // children write "0" here
//!
//! let memory = cgroups.get_memory_usage("sbx-1")?;
//! let cpu = cgroups.get_cpu_stats("sbx-1")?;
//!
//! cgroups.kill_all("sbx-1")?;
//! cgroups.destroy("sbx-1")?;
//! ```

pub mod manager;

pub use manager::{CgroupManager, CpuStats, ResourceLimits};
