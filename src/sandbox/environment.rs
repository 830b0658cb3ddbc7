//! The sandbox environment: lifecycle, commands, files, snapshots

use std::collections::BTreeMap;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cgroups::CgroupManager;
use crate::metrics::{
    SANDBOXES_ACTIVE, SANDBOX_COMMANDS, SANDBOX_COMMAND_DURATION, SANDBOX_SNAPSHOTS,
};
use crate::security::{can_drop_bounding, CapabilityDropper, NetworkSeccomp};

use super::language::{validate_package_name, Language, PackageManager, RunPlan};
use super::process::{run_isolated, CommandOutput, CommandSpec, Isolation};
use super::snapshot::{copy_tree, dir_size, remove_tree};
use super::{FileEntry, FileKind, SandboxConfig, SandboxError, SandboxStatus, SnapshotInfo};

/// Host variables passed through to sandboxed commands
const PASSTHROUGH_ENV: &[&str] = &["PATH", "LANG", "LC_ALL", "TZ", "RUSTUP_HOME", "CARGO_HOME"];

struct SandboxState {
    status: SandboxStatus,
    isolation: Arc<Isolation>,
    cgroups: Option<Arc<CgroupManager>>,
    snapshots: Vec<SnapshotInfo>,
}

impl Default for SandboxState {
    fn default() -> Self {
        Self {
            status: SandboxStatus::Uninitialized,
            isolation: Arc::new(Isolation::default()),
            cgroups: None,
            snapshots: Vec::new(),
        }
    }
}

/// An isolated execution context owned by one agent.
///
/// Commands, code runs and file operations share a read lock and may run
/// concurrently; snapshot, restore and teardown take the write lock, so they
/// wait for in-flight commands and block new ones until they finish.
pub struct SandboxEnvironment {
    session_id: String,
    config: SandboxConfig,
    root: PathBuf,
    state: RwLock<SandboxState>,
    snapshot_seq: AtomicU64,
}

impl std::fmt::Debug for SandboxEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxEnvironment")
            .field("session_id", &self.session_id)
            .field("root", &self.root)
            .finish()
    }
}

impl SandboxEnvironment {
    /// Create an uninitialized environment; nothing touches the host yet
    pub fn new(config: SandboxConfig) -> Self {
        let hex = Uuid::now_v7().simple().to_string();
        let session_id = format!("sbx-{}", &hex[hex.len() - 12..]);
        let root = config.state_dir.join(&session_id);

        Self {
            session_id,
            config,
            root,
            state: RwLock::new(SandboxState::default()),
            snapshot_seq: AtomicU64::new(0),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Host directory backing the workspace
    pub fn workspace_path(&self) -> PathBuf {
        self.root.join("workspace")
    }

    fn scratch_path(&self) -> PathBuf {
        self.root.join("scratch")
    }

    fn snapshots_path(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    pub async fn status(&self) -> SandboxStatus {
        self.state.read().await.status
    }

    /// Snapshots taken so far, oldest first
    pub async fn snapshots(&self) -> Vec<SnapshotInfo> {
        self.state.read().await.snapshots.clone()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Provision the environment.
    ///
    /// Idempotent while running. On any failure everything created so far is
    /// released, the environment ends up terminated and
    /// [`SandboxError::Provision`] is returned.
    pub async fn initialize(&self) -> Result<(), SandboxError> {
        let mut state = self.state.write().await;
        match state.status {
            SandboxStatus::Running => return Ok(()),
            SandboxStatus::Terminated => {
                return Err(SandboxError::NotRunning(SandboxStatus::Terminated))
            }
            SandboxStatus::Uninitialized => {}
        }

        let span = info_span!("sandbox_initialize", session_id = %self.session_id);
        match self.provision(&mut state).instrument(span).await {
            Ok(()) => {
                state.status = SandboxStatus::Running;
                SANDBOXES_ACTIVE.inc();
                info!(
                    session_id = %self.session_id,
                    workspace = %self.workspace_path().display(),
                    network = self.config.network_enabled,
                    cgroup = state.cgroups.is_some(),
                    "sandbox ready"
                );
                Ok(())
            }
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "sandbox provisioning failed");
                self.release(&mut state);
                state.status = SandboxStatus::Terminated;
                Err(match e {
                    SandboxError::Provision(msg) => SandboxError::Provision(msg),
                    other => SandboxError::Provision(other.to_string()),
                })
            }
        }
    }

    async fn provision(&self, state: &mut SandboxState) -> Result<(), SandboxError> {
        let workspace = self.workspace_path();
        tokio::fs::create_dir_all(&workspace).await?;
        tokio::fs::create_dir_all(self.scratch_path()).await?;
        tokio::fs::create_dir_all(self.snapshots_path()).await?;

        if let Some(template) = &self.config.base_template {
            if !template.is_dir() {
                return Err(SandboxError::Provision(format!(
                    "base template {} is not a directory",
                    template.display()
                )));
            }
            let (src, dst) = (template.clone(), workspace.clone());
            let bytes = blocking(move || copy_tree(&src, &dst)).await?;
            debug!(template = %template.display(), bytes, "workspace seeded from template");
        }

        let mut isolation = Isolation::default();

        if !self.config.network_enabled {
            let program = NetworkSeccomp::deny_inet().build().map_err(|e| {
                SandboxError::Provision(format!("cannot build network filter: {}", e))
            })?;
            isolation.network_filter = Some(Arc::new(program));
        }

        if self.config.drop_capabilities {
            let dropper = CapabilityDropper::with_sandbox_drops();
            if !can_drop_bounding() {
                debug!("no CAP_SETPCAP, capability drops will be no-ops");
            }
            isolation.capabilities = Some(dropper);
        }

        if self.config.use_cgroups {
            let limits = &self.config.resource_limits;
            let created = CgroupManager::new().and_then(|manager| {
                manager.create(&self.session_id, limits)?;
                Ok(manager)
            });
            match created {
                Ok(manager) => {
                    let procs = manager.procs_path(&self.session_id);
                    isolation.cgroup_procs = CString::new(procs.as_os_str().as_bytes()).ok();
                    state.cgroups = Some(Arc::new(manager));
                    debug!(
                        cpu_max = %limits.cpu_max(),
                        memory_bytes = limits.memory_bytes,
                        "cgroup limits applied"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "cgroups unavailable, running without resource limits");
                }
            }
        }

        state.isolation = Arc::new(isolation);

        for package in &self.config.extra_packages {
            let output = self
                .install_with(&state.isolation, self.config.package_manager, package)
                .await?;
            if !output.success() {
                return Err(SandboxError::Provision(format!(
                    "failed to install {}: {}",
                    package,
                    output.stderr.trim()
                )));
            }
        }

        Ok(())
    }

    /// Release every resource. Best effort, idempotent, never fails.
    pub async fn teardown(&self) {
        let mut state = self.state.write().await;
        if state.status == SandboxStatus::Terminated {
            return;
        }

        let was_running = state.status == SandboxStatus::Running;
        self.release(&mut state);
        state.status = SandboxStatus::Terminated;
        if was_running {
            SANDBOXES_ACTIVE.dec();
        }
        info!(session_id = %self.session_id, "sandbox torn down");
    }

    fn release(&self, state: &mut SandboxState) {
        if let Some(cgroups) = state.cgroups.take() {
            if let Err(e) = cgroups.kill_all(&self.session_id) {
                warn!(session_id = %self.session_id, error = %e, "failed to kill sandbox processes");
            }
            if let Err(e) = cgroups.destroy(&self.session_id) {
                warn!(session_id = %self.session_id, error = %e, "failed to remove cgroup");
            }
        }
        state.isolation = Arc::new(Isolation::default());

        if let Err(e) = remove_tree(&self.scratch_path()) {
            warn!(error = %e, "failed to remove scratch directory");
        }

        if !self.config.persist_data {
            for dir in [self.workspace_path(), self.snapshots_path()] {
                if let Err(e) = remove_tree(&dir) {
                    warn!(path = %dir.display(), error = %e, "failed to remove sandbox data");
                }
            }
            state.snapshots.clear();
            // only succeeds once the tree is empty
            let _ = std::fs::remove_dir(&self.root);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Commands
    // ═══════════════════════════════════════════════════════════════════════

    /// Run a shell command in the workspace.
    ///
    /// Timeouts and non-zero exits are reported in the returned
    /// [`CommandOutput`], not as errors.
    pub async fn run_command(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, SandboxError> {
        let state = self.running().await?;
        let args = vec!["-c".to_string(), command.to_string()];
        Ok(self
            .exec(&state.isolation, "command", "sh", args, timeout)
            .await)
    }

    /// Execute a code snippet in `language`
    pub async fn run_code(
        &self,
        code: &str,
        language: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, SandboxError> {
        let language: Language = language.parse()?;
        let state = self.running().await?;

        let stem = format!("code-{}", Uuid::now_v7().simple());
        let source = self
            .scratch_path()
            .join(format!("{}.{}", stem, language.extension()));
        let binary = self.scratch_path().join(&stem);
        tokio::fs::write(&source, code).await?;

        let budget = self.effective_timeout(timeout);
        let plan = language.plan(&path_str(&source), &path_str(&binary));
        let output = match plan {
            RunPlan::Interpret { program, args } => {
                self.exec(&state.isolation, "code", &program, args, Some(budget))
                    .await
            }
            RunPlan::Compile {
                compiler,
                args,
                binary,
            } => {
                let compiled = self
                    .exec(&state.isolation, "compile", &compiler, args, Some(budget))
                    .await;
                if compiled.success() {
                    // compile and run share one deadline
                    let spent = Duration::from_secs_f64(compiled.duration_ms / 1000.0);
                    let remaining = budget
                        .saturating_sub(spent)
                        .max(Duration::from_millis(1));
                    self.exec(&state.isolation, "code", &binary, Vec::new(), Some(remaining))
                        .await
                } else {
                    compiled
                }
            }
        };

        let _ = tokio::fs::remove_file(&source).await;
        let _ = tokio::fs::remove_file(&binary).await;

        Ok(output)
    }

    /// Install a package with the named manager ("pip", "npm", ...)
    pub async fn install_package(
        &self,
        package: &str,
        manager: &str,
    ) -> Result<CommandOutput, SandboxError> {
        let manager: PackageManager = manager.parse()?;
        validate_package_name(package)?;
        let state = self.running().await?;
        self.install_with(&state.isolation, manager, package).await
    }

    async fn install_with(
        &self,
        isolation: &Isolation,
        manager: PackageManager,
        package: &str,
    ) -> Result<CommandOutput, SandboxError> {
        validate_package_name(package)?;
        let (program, args) = manager.install_command(package);
        info!(package, manager = %manager, "installing package");
        Ok(self.exec(isolation, "install", &program, args, None).await)
    }

    /// A few facts about the runtime inside the sandbox
    pub async fn system_info(&self) -> Result<BTreeMap<String, String>, SandboxError> {
        let state = self.running().await?;
        let checks = [
            ("os", "uname -a"),
            ("python", "python3 --version 2>&1"),
            ("node", "node --version 2>&1"),
            ("disk", "df -h . | tail -n 1"),
        ];

        let mut info = BTreeMap::new();
        info.insert("session_id".to_string(), self.session_id.clone());
        info.insert(
            "working_directory".to_string(),
            self.config.working_directory.clone(),
        );
        info.insert(
            "network_enabled".to_string(),
            self.config.network_enabled.to_string(),
        );
        for (key, command) in checks {
            let args = vec!["-c".to_string(), command.to_string()];
            let output = self
                .exec(
                    &state.isolation,
                    "info",
                    "sh",
                    args,
                    Some(Duration::from_secs(10)),
                )
                .await;
            let value = if output.success() {
                output.stdout.trim().to_string()
            } else {
                "unavailable".to_string()
            };
            info.insert(key.to_string(), value);
        }

        if let Some(cgroups) = &state.cgroups {
            if let Ok(bytes) = cgroups.get_memory_usage(&self.session_id) {
                info.insert("memory_current_bytes".to_string(), bytes.to_string());
            }
            if let Ok(cpu) = cgroups.get_cpu_stats(&self.session_id) {
                info.insert("cpu_usage_usec".to_string(), cpu.usage_usec.to_string());
                info.insert("cpu_throttled".to_string(), cpu.nr_throttled.to_string());
            }
        }
        info.insert(
            "memory_limit_bytes".to_string(),
            self.config.resource_limits.memory_bytes.to_string(),
        );
        info.insert(
            "cpu_limit_cores".to_string(),
            self.config.resource_limits.cpu_cores.to_string(),
        );
        Ok(info)
    }

    async fn exec(
        &self,
        isolation: &Isolation,
        kind: &'static str,
        program: &str,
        args: Vec<String>,
        timeout: Option<Duration>,
    ) -> CommandOutput {
        let timeout = self.effective_timeout(timeout);
        let spec = CommandSpec {
            program: program.to_string(),
            args,
            cwd: self.workspace_path(),
            env: self.child_env(),
            timeout,
            max_output_bytes: self.config.max_output_bytes,
        };

        let span = info_span!(
            "sandbox_exec",
            session_id = %self.session_id,
            kind,
            program = %spec.program,
        );
        let output = run_isolated(&spec, isolation).instrument(span).await;

        let status = if output.timed_out {
            "timeout"
        } else if output.exit_code == 0 {
            "success"
        } else {
            "failure"
        };
        SANDBOX_COMMANDS.with_label_values(&[kind, status]).inc();
        SANDBOX_COMMAND_DURATION
            .with_label_values(&[kind])
            .observe(output.duration_ms / 1000.0);
        debug!(
            kind,
            exit_code = output.exit_code,
            timed_out = output.timed_out,
            duration_ms = output.duration_ms,
            "sandbox command finished"
        );

        output
    }

    fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        requested
            .filter(|t| !t.is_zero())
            .unwrap_or_else(|| Duration::from_secs(self.config.timeout_default_secs))
    }

    fn child_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        for key in PASSTHROUGH_ENV {
            if let Ok(value) = std::env::var(key) {
                env.insert(key.to_string(), value);
            }
        }
        env.entry("PATH".to_string())
            .or_insert_with(|| "/usr/local/bin:/usr/bin:/bin".to_string());

        // HOME moves into the workspace; keep rustup's toolchains reachable
        if let Some(home) = std::env::var_os("HOME") {
            let rustup = Path::new(&home).join(".rustup");
            if rustup.is_dir() {
                env.entry("RUSTUP_HOME".to_string())
                    .or_insert_with(|| path_str(&rustup));
            }
        }

        let workspace = path_str(&self.workspace_path());
        env.insert("HOME".to_string(), workspace.clone());
        env.insert("TMPDIR".to_string(), path_str(&self.scratch_path()));
        env.insert("AGENTVISOR_WORKSPACE".to_string(), workspace);
        env.insert("AGENTVISOR_SESSION".to_string(), self.session_id.clone());

        for (key, value) in &self.config.environment_vars {
            env.insert(key.clone(), value.clone());
        }
        env
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Files
    // ═══════════════════════════════════════════════════════════════════════

    /// Write `content` to `path`, creating parent directories
    pub async fn write_file(
        &self,
        path: &str,
        content: impl AsRef<[u8]>,
    ) -> Result<u64, SandboxError> {
        let content = content.as_ref();
        let _state = self.running().await?;
        let target = self.resolve_path(path).await?;
        if target == self.workspace_path() {
            return Err(SandboxError::InvalidPath(format!("{} is a directory", path)));
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        debug!(path = %path, bytes = content.len(), "file written");
        Ok(content.len() as u64)
    }

    /// Read a file; `Ok(None)` when it does not exist
    pub async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, SandboxError> {
        let _state = self.running().await?;
        let target = self.resolve_path(path).await?;
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(_) if target.is_dir() => {
                Err(SandboxError::InvalidPath(format!("{} is a directory", path)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// [`SandboxEnvironment::read_file`] decoded as (lossy) UTF-8
    pub async fn read_to_string(&self, path: &str) -> Result<Option<String>, SandboxError> {
        Ok(self
            .read_file(path)
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Entries of a directory, sorted by name
    pub async fn list_files(&self, path: &str) -> Result<Vec<FileEntry>, SandboxError> {
        let _state = self.running().await?;
        let dir = self.resolve_path(path).await?;
        let mut entries = self.read_entries(&dir, path).await?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Every entry below a directory, depth first, sorted by path.
    /// Symlinked directories are listed but not descended into.
    pub async fn list_files_recursive(&self, path: &str) -> Result<Vec<FileEntry>, SandboxError> {
        let _state = self.running().await?;
        let root = self.resolve_path(path).await?;

        let mut all = Vec::new();
        let mut pending = vec![root];
        while let Some(dir) = pending.pop() {
            let entries = self.read_entries(&dir, path).await?;
            for entry in entries {
                if entry.kind == FileKind::Directory {
                    pending.push(self.workspace_path().join(&entry.path));
                }
                all.push(entry);
            }
        }
        all.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(all)
    }

    async fn read_entries(&self, dir: &Path, requested: &str) -> Result<Vec<FileEntry>, SandboxError> {
        let workspace = self.workspace_path();
        let mut reader = match tokio::fs::read_dir(dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SandboxError::NotFound(requested.to_string()))
            }
            Err(_) if dir.is_file() => {
                return Err(SandboxError::InvalidPath(format!(
                    "{} is not a directory",
                    requested
                )))
            }
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let metadata = tokio::fs::symlink_metadata(entry.path()).await?;
            let file_type = metadata.file_type();
            let kind = if file_type.is_symlink() {
                FileKind::Symlink
            } else if file_type.is_dir() {
                FileKind::Directory
            } else if file_type.is_file() {
                FileKind::File
            } else {
                FileKind::Other
            };
            let full = entry.path();
            let relative = full.strip_prefix(&workspace).unwrap_or(&full);

            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: path_str(relative),
                kind,
                size: metadata.len(),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                mode: metadata.permissions().mode() & 0o7777,
            });
        }
        Ok(entries)
    }

    /// Map a caller path onto the host workspace.
    ///
    /// Relative paths are taken from the workspace root. Absolute paths must
    /// lie under the configured working directory. Paths that climb out of
    /// the workspace, directly or through a symlink, are rejected.
    pub async fn resolve_path(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let invalid = |why: &str| SandboxError::InvalidPath(format!("{}: {}", path, why));
        if path.contains('\0') {
            return Err(invalid("contains a NUL byte"));
        }

        let workspace = self.workspace_path();
        let requested = Path::new(path.trim());
        let relative = if requested.is_absolute() {
            let working_dir = Path::new(&self.config.working_directory);
            requested
                .strip_prefix(working_dir)
                .map_err(|_| invalid("outside the workspace"))?
        } else {
            requested
        };

        let mut resolved = workspace.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if resolved == workspace {
                        return Err(invalid("escapes the workspace"));
                    }
                    resolved.pop();
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(invalid("unexpected root component"))
                }
            }
        }

        let real_workspace = tokio::fs::canonicalize(&workspace).await?;
        let mut ancestor = resolved.as_path();
        loop {
            match tokio::fs::canonicalize(ancestor).await {
                Ok(real) => {
                    if !real.starts_with(&real_workspace) {
                        return Err(invalid("symlink leads outside the workspace"));
                    }
                    break;
                }
                Err(_) if tokio::fs::symlink_metadata(ancestor).await.is_ok() => {
                    return Err(invalid("dangling symlink"));
                }
                Err(_) => match ancestor.parent() {
                    Some(parent) => ancestor = parent,
                    None => break,
                },
            }
        }

        Ok(resolved)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Snapshots
    // ═══════════════════════════════════════════════════════════════════════

    /// Copy the current workspace into a new snapshot
    pub async fn create_snapshot(&self) -> Result<SnapshotInfo, SandboxError> {
        let mut state = self.state.write().await;
        ensure_running(&state)?;

        let seq = self.snapshot_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let hex = Uuid::now_v7().simple().to_string();
        let snapshot_id = format!("snap-{:04}-{}", seq, &hex[hex.len() - 8..]);

        let source = self.workspace_path();
        let target = self.snapshots_path().join(&snapshot_id);
        let copy_target = target.clone();
        let copied = blocking(move || {
            copy_tree(&source, &copy_target)?;
            dir_size(&copy_target)
        })
        .await;

        let size_bytes = match copied {
            Ok(size) => size,
            Err(e) => {
                let _ = remove_tree(&target);
                SANDBOX_SNAPSHOTS
                    .with_label_values(&["create", "failure"])
                    .inc();
                return Err(e.into());
            }
        };

        let info = SnapshotInfo {
            snapshot_id,
            created_at: Utc::now(),
            size_bytes,
        };
        state.snapshots.push(info.clone());
        SANDBOX_SNAPSHOTS
            .with_label_values(&["create", "success"])
            .inc();
        info!(
            session_id = %self.session_id,
            snapshot_id = %info.snapshot_id,
            size_bytes,
            "snapshot created"
        );
        Ok(info)
    }

    /// Replace the workspace with a snapshot's contents.
    ///
    /// Unknown ids fail with [`SandboxError::SnapshotNotFound`] and change
    /// nothing. Any later failure tears the sandbox down and returns
    /// [`SandboxError::RestoreFailed`].
    pub async fn restore_snapshot(&self, snapshot_id: &str) -> Result<(), SandboxError> {
        let mut state = self.state.write().await;
        ensure_running(&state)?;

        if !state.snapshots.iter().any(|s| s.snapshot_id == snapshot_id) {
            SANDBOX_SNAPSHOTS
                .with_label_values(&["restore", "not_found"])
                .inc();
            return Err(SandboxError::SnapshotNotFound(snapshot_id.to_string()));
        }

        // nothing may keep writing into the old workspace
        if let Some(cgroups) = &state.cgroups {
            if let Err(e) = cgroups.kill_all(&self.session_id) {
                debug!(error = %e, "kill before restore failed");
            }
        }

        let source = self.snapshots_path().join(snapshot_id);
        let workspace = self.workspace_path();
        let staging = self.root.join(".restore-staging");
        let retired = self.root.join(".restore-retired");
        let swapped = blocking(move || {
            remove_tree(&staging)?;
            copy_tree(&source, &staging)?;
            remove_tree(&retired)?;
            std::fs::rename(&workspace, &retired)?;
            if let Err(e) = std::fs::rename(&staging, &workspace) {
                let _ = std::fs::rename(&retired, &workspace);
                return Err(e);
            }
            let _ = remove_tree(&retired);
            Ok(())
        })
        .await;

        match swapped {
            Ok(()) => {
                SANDBOX_SNAPSHOTS
                    .with_label_values(&["restore", "success"])
                    .inc();
                info!(session_id = %self.session_id, snapshot_id, "snapshot restored");
                Ok(())
            }
            Err(e) => {
                SANDBOX_SNAPSHOTS
                    .with_label_values(&["restore", "failure"])
                    .inc();
                warn!(
                    session_id = %self.session_id,
                    snapshot_id,
                    error = %e,
                    "restore failed, tearing sandbox down"
                );
                self.release(&mut state);
                state.status = SandboxStatus::Terminated;
                SANDBOXES_ACTIVE.dec();
                Err(SandboxError::RestoreFailed(e.to_string()))
            }
        }
    }

    async fn running(&self) -> Result<RwLockReadGuard<'_, SandboxState>, SandboxError> {
        let state = self.state.read().await;
        ensure_running(&state)?;
        Ok(state)
    }
}

impl Drop for SandboxEnvironment {
    fn drop(&mut self) {
        let mut state = std::mem::take(self.state.get_mut());
        if state.status == SandboxStatus::Running {
            self.release(&mut state);
            SANDBOXES_ACTIVE.dec();
        }
    }
}

fn ensure_running(state: &SandboxState) -> Result<(), SandboxError> {
    match state.status {
        SandboxStatus::Running => Ok(()),
        other => Err(SandboxError::NotRunning(other)),
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}
