//! Sandbox configuration

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cgroups::ResourceLimits;

use super::language::PackageManager;

/// Configuration for one sandbox environment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Directory whose contents seed the workspace
    pub base_template: Option<PathBuf>,
    pub resource_limits: ResourceLimits,
    /// Used by run_command/run_code when the caller passes no timeout
    pub timeout_default_secs: u64,
    /// When false, children cannot open IPv4/IPv6 sockets
    pub network_enabled: bool,
    /// Keep the workspace and snapshots on disk after teardown
    pub persist_data: bool,
    /// Absolute path presented to commands as the workspace root
    pub working_directory: String,
    /// Host directory holding one subdirectory per session
    pub state_dir: PathBuf,
    /// Installed during initialize()
    pub extra_packages: Vec<String>,
    pub package_manager: PackageManager,
    pub environment_vars: BTreeMap<String, String>,
    /// Place children in a per-session cgroup when the host allows it
    pub use_cgroups: bool,
    /// Shrink the capability bounding set of every child
    pub drop_capabilities: bool,
    /// Per-stream cap on captured stdout/stderr
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            base_template: None,
            resource_limits: ResourceLimits::default(),
            timeout_default_secs: 300,
            network_enabled: true,
            persist_data: false,
            working_directory: "/workspace".to_string(),
            state_dir: std::env::temp_dir().join("agentvisor"),
            extra_packages: Vec::new(),
            package_manager: PackageManager::Pip,
            environment_vars: BTreeMap::new(),
            use_cgroups: true,
            drop_capabilities: true,
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl SandboxConfig {
    /// Defaults overridden by `AGENTVISOR_SANDBOX_*` environment variables.
    ///
    /// Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("AGENTVISOR_SANDBOX_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }
        if let Ok(template) = std::env::var("AGENTVISOR_SANDBOX_TEMPLATE") {
            config.base_template = Some(PathBuf::from(template));
        }
        if let Ok(memory) = std::env::var("AGENTVISOR_SANDBOX_MEMORY") {
            match ResourceLimits::parse_memory(&memory) {
                Some(bytes) => config.resource_limits.memory_bytes = bytes,
                None => tracing::warn!(value = %memory, "ignoring AGENTVISOR_SANDBOX_MEMORY"),
            }
        }
        if let Ok(cpus) = std::env::var("AGENTVISOR_SANDBOX_CPUS") {
            match cpus.parse::<f64>() {
                Ok(cores) if cores > 0.0 => config.resource_limits.cpu_cores = cores,
                _ => tracing::warn!(value = %cpus, "ignoring AGENTVISOR_SANDBOX_CPUS"),
            }
        }
        if let Ok(timeout) = std::env::var("AGENTVISOR_SANDBOX_TIMEOUT") {
            match timeout.parse::<u64>() {
                Ok(secs) if secs > 0 => config.timeout_default_secs = secs,
                _ => tracing::warn!(value = %timeout, "ignoring AGENTVISOR_SANDBOX_TIMEOUT"),
            }
        }
        if let Ok(network) = std::env::var("AGENTVISOR_SANDBOX_NETWORK") {
            match parse_bool(&network) {
                Some(enabled) => config.network_enabled = enabled,
                None => tracing::warn!(value = %network, "ignoring AGENTVISOR_SANDBOX_NETWORK"),
            }
        }
        if let Ok(persist) = std::env::var("AGENTVISOR_SANDBOX_PERSIST") {
            match parse_bool(&persist) {
                Some(keep) => config.persist_data = keep,
                None => tracing::warn!(value = %persist, "ignoring AGENTVISOR_SANDBOX_PERSIST"),
            }
        }
        if let Ok(packages) = std::env::var("AGENTVISOR_SANDBOX_PACKAGES") {
            config.extra_packages = packages
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }

        config
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    pub fn with_network(mut self, enabled: bool) -> Self {
        self.network_enabled = enabled;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_default_secs = secs;
        self
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.timeout_default_secs, 300);
        assert!(config.network_enabled);
        assert!(!config.persist_data);
        assert_eq!(config.working_directory, "/workspace");
        assert_eq!(config.resource_limits, ResourceLimits::default());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SandboxConfig =
            serde_json::from_str(r#"{"network_enabled": false, "timeout_default_secs": 5}"#)
                .unwrap();
        assert!(!config.network_enabled);
        assert_eq!(config.timeout_default_secs, 5);
        assert_eq!(config.working_directory, "/workspace");
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" off "), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
