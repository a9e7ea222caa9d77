//! Native Linux sandbox: cgroup v2 accounting plus namespace/chroot isolation.

use crate::cgroup::{self, BoxCgroup};
use crate::error::{SandboxError, SandboxResult, SetupError, SetupStep};
use crate::isolation::{self, Identity, IsolationPlan, Layer, ReportPipe};
use crate::limits::{self, LimiterHandle, Termination};
use crate::output::{decode_capped, OutputCapture};
use crate::sandbox::{self, BoxInfo, RunRequest, Sandbox, SandboxFile};
use async_trait::async_trait;
use isobox_common::config::EngineConfig;
use isobox_common::types::RunResult;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::watch;

const OUTPUT_GRACE: Duration = Duration::from_secs(2);
const CPU_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct LinuxSandboxConfig {
    pub sandbox_root: PathBuf,
    pub cgroup_root: PathBuf,
    pub system_mounts: Vec<PathBuf>,
    pub base_uid: u32,
    pub base_gid: u32,
}

impl From<&EngineConfig> for LinuxSandboxConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            sandbox_root: config.sandbox_root.clone(),
            cgroup_root: config.cgroup_root.clone(),
            system_mounts: config.system_mounts.clone(),
            base_uid: config.base_uid,
            base_gid: config.base_gid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoxState {
    Initializing,
    Active,
    Busy,
    CleaningUp,
    /// Teardown failed; the id stays reserved until a later cleanup succeeds
    Quarantined,
}

#[derive(Debug)]
struct BoxEntry {
    state: BoxState,
    info: Option<BoxInfo>,
    mounts: Vec<PathBuf>,
    runtime_mounted: bool,
    next_seq: u64,
}

impl BoxEntry {
    fn placeholder(state: BoxState) -> Self {
        Self {
            state,
            info: None,
            mounts: Vec::new(),
            runtime_mounted: false,
            next_seq: 0,
        }
    }
}

pub struct LinuxSandbox {
    config: LinuxSandboxConfig,
    boxes: Mutex<HashMap<String, BoxEntry>>,
    /// Serializes teardowns of the same box id
    teardowns: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LinuxSandbox {
    pub fn new(config: LinuxSandboxConfig) -> Self {
        Self {
            config,
            boxes: Mutex::new(HashMap::new()),
            teardowns: Mutex::new(HashMap::new()),
        }
    }

    /// Create the box and cgroup roots. Needs root and a cgroup v2 mount.
    pub fn prepare_host(&self) -> SandboxResult<()> {
        fs::create_dir_all(&self.config.sandbox_root)?;
        cgroup::ensure_root(&self.config.cgroup_root)
    }

    pub fn box_root(&self, box_id: &str) -> PathBuf {
        self.config.sandbox_root.join(box_id)
    }

    fn identity(&self, slot: usize) -> Identity {
        let offset = slot as u32;
        Identity {
            uid: self.config.base_uid + offset,
            gid: self.config.base_gid + offset,
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, BoxEntry>> {
        self.boxes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn teardown_lock(&self, box_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.teardowns.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(box_id.to_string()).or_default())
    }

    /// Tear down every box left on disk or in the cgroup tree by a previous
    /// process. Returns how many were reclaimed.
    pub async fn reclaim_stale(&self) -> usize {
        let mut ids: Vec<String> = Vec::new();
        for dir in [&self.config.sandbox_root, &self.config.cgroup_root] {
            if let Ok(entries) = fs::read_dir(dir) {
                for entry in entries.flatten() {
                    let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if is_dir && sandbox::validate_box_id(&name).is_ok() && !ids.contains(&name) {
                        ids.push(name);
                    }
                }
            }
        }

        let mut reclaimed = 0;
        for id in ids {
            match self.cleanup(&id).await {
                Ok(()) => reclaimed += 1,
                Err(e) => tracing::warn!(box_id = %id, error = %e, "failed to reclaim stale box"),
            }
        }
        reclaimed
    }

    fn set_state(&self, box_id: &str, state: BoxState) {
        if let Some(entry) = self.registry().get_mut(box_id) {
            entry.state = state;
        }
    }
}

fn allocation_error(box_id: &str, reason: impl Into<String>) -> SandboxError {
    SandboxError::BoxAllocation {
        box_id: box_id.to_string(),
        reason: reason.into(),
    }
}

async fn blocking<T, F>(f: F) -> SandboxResult<T>
where
    F: FnOnce() -> SandboxResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SandboxError::Io(io::Error::new(io::ErrorKind::Other, e)))?
}

/// Host-side layout of a new box: directories, cgroup, system layers.
fn create_box(config: &LinuxSandboxConfig, info: &BoxInfo) -> SandboxResult<Vec<PathBuf>> {
    let mut ledger = crate::setup::SetupLedger::new();

    fs::create_dir(&info.root).map_err(|e| allocation_error(&info.id, format!("create {}: {}", info.root.display(), e)))?;
    ledger.record(crate::setup::Undo::RemoveDir(info.root.clone()));

    let box_cgroup = BoxCgroup::create(&config.cgroup_root, &info.id)
        .map_err(|e| allocation_error(&info.id, e.to_string()))?;
    ledger.record(crate::setup::Undo::RemoveCgroup(box_cgroup));

    for dir in ["proc", "tmp", isolation::WORKDIR] {
        fs::create_dir_all(info.root.join(dir)).map_err(|e| SetupError::io(SetupStep::CreateBoxDir, e))?;
    }
    fs::set_permissions(info.root.join("tmp"), fs::Permissions::from_mode(0o1777))
        .map_err(|e| SetupError::io(SetupStep::CreateBoxDir, e))?;
    std::os::unix::fs::chown(&info.scratch, Some(info.identity.uid), Some(info.identity.gid))
        .map_err(|e| SetupError::io(SetupStep::CreateBoxDir, e))?;

    let mut mounts = Vec::new();
    for layer in isolation::base_layers(&config.system_mounts) {
        let target = isolation::mount_layer(&info.root, &layer)?;
        ledger.record(crate::setup::Undo::Unmount(target.clone()));
        mounts.push(target);
    }

    ledger.commit();
    Ok(mounts)
}

/// Kill, unmount, delete. Missing pieces are not errors.
fn teardown(config: &LinuxSandboxConfig, box_id: &str) -> SandboxResult<()> {
    let root = config.sandbox_root.join(box_id);
    let box_cgroup = BoxCgroup::open(&config.cgroup_root, box_id);
    let mut problems = Vec::new();

    box_cgroup.kill_all();

    if let Err(e) = isolation::detach_all_under(&root) {
        problems.push(format!("detach mounts: {}", e));
    }
    let remaining = fs::read_to_string("/proc/self/mountinfo")
        .map(|info| isolation::mounts_under(&info, &root))
        .unwrap_or_default();
    if !remaining.is_empty() {
        problems.push(format!("{} mounts still attached", remaining.len()));
    } else {
        match fs::remove_dir_all(&root) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => problems.push(format!("remove {}: {}", root.display(), e)),
        }
    }

    if let Err(e) = box_cgroup.remove() {
        problems.push(format!("remove cgroup: {}", e));
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(SandboxError::Cleanup {
            box_id: box_id.to_string(),
            reason: problems.join("; "),
        })
    }
}

/// Write files under the scratch area as the box identity.
fn materialize(
    scratch: &Path,
    mounts: &[PathBuf],
    identity: Identity,
    files: &[SandboxFile],
) -> SandboxResult<Vec<String>> {
    let mut written = Vec::with_capacity(files.len());
    for file in files {
        let name = match &file.name {
            Some(name) => name.clone(),
            None => sandbox::generate_file_name(scratch),
        };
        let relative = sandbox::validate_file_name(&name)?;
        let target = scratch.join(&relative);

        if mounts.iter().any(|m| target.starts_with(m) || m.starts_with(&target)) {
            return Err(SandboxError::InvalidFile {
                name,
                reason: "collides with a mounted runtime layer".to_string(),
            });
        }

        // Refuse to follow a symlink planted by an earlier run
        let mut current = scratch.to_path_buf();
        for part in relative.iter() {
            current.push(part);
            match fs::symlink_metadata(&current) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(SandboxError::InvalidFile {
                        name,
                        reason: "path traverses a symlink".to_string(),
                    });
                }
                Ok(meta) if current != target && !meta.is_dir() => {
                    return Err(SandboxError::InvalidFile {
                        name,
                        reason: "parent is not a directory".to_string(),
                    });
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                Err(e) => return Err(e.into()),
            }
        }

        let mut dir = scratch.to_path_buf();
        if let Some(parent) = relative.parent() {
            for part in parent.iter() {
                dir.push(part);
                if !dir.exists() {
                    fs::create_dir(&dir)?;
                    std::os::unix::fs::chown(&dir, Some(identity.uid), Some(identity.gid))?;
                }
            }
        }

        fs::write(&target, &file.content)?;
        fs::set_permissions(&target, fs::Permissions::from_mode(0o644))?;
        std::os::unix::fs::chown(&target, Some(identity.uid), Some(identity.gid))?;
        written.push(relative.to_string_lossy().into_owned());
    }
    Ok(written)
}

async fn cpu_exhausted(handle: &LimiterHandle) {
    let mut ticker = tokio::time::interval(CPU_POLL_INTERVAL);
    loop {
        ticker.tick().await;
        if handle.cpu_exceeded() {
            return;
        }
    }
}

async fn cancelled(cancel: Option<watch::Receiver<bool>>) {
    match cancel {
        Some(mut rx) => {
            if rx.wait_for(|flag| *flag).await.is_err() {
                // Sender gone without cancelling
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

/// Resets a box from Busy back to Active however the run ends.
struct BusyGuard<'a> {
    sandbox: &'a LinuxSandbox,
    box_id: &'a str,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut boxes = self.sandbox.registry();
        if let Some(entry) = boxes.get_mut(self.box_id) {
            if entry.state == BoxState::Busy {
                entry.state = BoxState::Active;
            }
        }
    }
}

#[async_trait]
impl Sandbox for LinuxSandbox {
    #[tracing::instrument(skip(self), fields(box_id = %box_id))]
    async fn init(&self, box_id: &str, slot: usize) -> SandboxResult<BoxInfo> {
        sandbox::validate_box_id(box_id)?;
        let root = self.box_root(box_id);
        {
            let mut boxes = self.registry();
            if let Some(entry) = boxes.get(box_id) {
                return Err(allocation_error(box_id, format!("box is {:?}", entry.state)));
            }
            if root.exists() || BoxCgroup::open(&self.config.cgroup_root, box_id).exists() {
                return Err(allocation_error(box_id, "stale state from a previous box must be cleaned up first"));
            }
            boxes.insert(box_id.to_string(), BoxEntry::placeholder(BoxState::Initializing));
        }

        let info = BoxInfo {
            id: box_id.to_string(),
            scratch: root.join(isolation::WORKDIR),
            root,
            identity: self.identity(slot),
            slot,
        };

        let config = self.config.clone();
        let layout = info.clone();
        match blocking(move || create_box(&config, &layout)).await {
            Ok(mounts) => {
                let mut boxes = self.registry();
                let entry = boxes
                    .entry(box_id.to_string())
                    .or_insert_with(|| BoxEntry::placeholder(BoxState::Initializing));
                entry.state = BoxState::Active;
                entry.info = Some(info.clone());
                entry.mounts = mounts;
                tracing::debug!(root = %info.root.display(), uid = info.identity.uid, "box initialized");
                Ok(info)
            }
            Err(e) => {
                self.registry().remove(box_id);
                tracing::warn!(error = %e, "box initialization failed");
                Err(e)
            }
        }
    }

    #[tracing::instrument(skip(self), fields(box_id = %box_id))]
    async fn mount_runtime(&self, box_id: &str, runtime_root: &Path) -> SandboxResult<()> {
        let root = {
            let boxes = self.registry();
            let entry = boxes
                .get(box_id)
                .ok_or_else(|| SandboxError::UnknownBox(box_id.to_string()))?;
            if entry.state != BoxState::Active {
                return Err(SandboxError::BoxBusy(box_id.to_string()));
            }
            if entry.runtime_mounted {
                return Err(SetupError::new(SetupStep::BindMount, "runtime already mounted").into());
            }
            entry
                .info
                .as_ref()
                .map(|info| info.root.clone())
                .ok_or_else(|| SandboxError::UnknownBox(box_id.to_string()))?
        };

        let layer = Layer::runtime(runtime_root);
        let target = blocking(move || isolation::mount_layer(&root, &layer).map_err(SandboxError::from)).await?;

        let mut boxes = self.registry();
        match boxes.get_mut(box_id) {
            Some(entry) => {
                entry.mounts.push(target);
                entry.runtime_mounted = true;
                Ok(())
            }
            None => {
                // Cleaned up underneath us; do not leave the mount behind
                let _ = isolation::detach(&target);
                Err(SandboxError::UnknownBox(box_id.to_string()))
            }
        }
    }

    #[tracing::instrument(skip(self, files), fields(box_id = %box_id, count = files.len()))]
    async fn write_files(&self, box_id: &str, files: &[SandboxFile]) -> SandboxResult<Vec<String>> {
        let (info, mounts) = {
            let boxes = self.registry();
            let entry = boxes
                .get(box_id)
                .ok_or_else(|| SandboxError::UnknownBox(box_id.to_string()))?;
            if entry.state != BoxState::Active {
                return Err(SandboxError::BoxBusy(box_id.to_string()));
            }
            let info = entry
                .info
                .clone()
                .ok_or_else(|| SandboxError::UnknownBox(box_id.to_string()))?;
            (info, entry.mounts.clone())
        };

        let files = files.to_vec();
        blocking(move || materialize(&info.scratch, &mounts, info.identity, &files)).await
    }

    #[tracing::instrument(skip(self, request), fields(box_id = %box_id, command = %request.command))]
    async fn run(&self, box_id: &str, request: RunRequest) -> SandboxResult<RunResult> {
        let (info, seq) = {
            let mut boxes = self.registry();
            let entry = boxes
                .get_mut(box_id)
                .ok_or_else(|| SandboxError::UnknownBox(box_id.to_string()))?;
            match entry.state {
                BoxState::Active => {}
                BoxState::Busy => return Err(SandboxError::BoxBusy(box_id.to_string())),
                _ => return Err(SandboxError::UnknownBox(box_id.to_string())),
            }
            let info = entry
                .info
                .clone()
                .ok_or_else(|| SandboxError::UnknownBox(box_id.to_string()))?;
            entry.state = BoxState::Busy;
            let seq = entry.next_seq;
            entry.next_seq += 1;
            (info, seq)
        };
        let _busy = BusyGuard { sandbox: self, box_id };

        let report = ReportPipe::new()?;
        let report_fd = report.write_fd();
        let box_cgroup = BoxCgroup::open(&self.config.cgroup_root, box_id);
        let mut handle = limits::apply(&request.limits, &box_cgroup, seq)?;
        let plan = match IsolationPlan::new(&info.root, handle.leaf(), &request.limits, info.identity) {
            Ok(plan) => Arc::new(plan),
            Err(e) => {
                handle.release();
                return Err(e);
            }
        };

        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args)
            .env_clear()
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        unsafe {
            cmd.pre_exec(move || plan.enter(report_fd));
        }

        let spawned = cmd.spawn();
        drop(cmd);
        let report = tokio::task::spawn_blocking(move || report.into_report())
            .await
            .ok()
            .flatten();
        let mut child = match (spawned, report) {
            (Ok(child), None) => child,
            (Ok(mut child), Some(setup)) => {
                let _ = child.start_kill();
                handle.release();
                return Err(setup.into());
            }
            (Err(_), Some(setup)) => {
                handle.release();
                return Err(setup.into());
            }
            (Err(e), None) => {
                handle.release();
                return Err(SetupError::io(SetupStep::Spawn, e).into());
            }
        };
        handle.restart_clock();

        if let Some(mut stdin) = child.stdin.take() {
            let input = request.stdin.clone().unwrap_or_default();
            tokio::spawn(async move {
                // The program may exit without reading its input
                let _ = stdin.write_all(&input).await;
                let _ = stdin.shutdown().await;
            });
        }
        let capture = OutputCapture::start(child.stdout.take(), child.stderr.take(), request.limits.max_output_bytes);

        let waited = tokio::select! {
            status = child.wait() => status.map(Termination::Exited),
            _ = tokio::time::sleep(handle.wall_limit()) => Ok(Termination::WallTimeout),
            _ = cpu_exhausted(&handle) => Ok(Termination::CpuLimit),
            _ = cancelled(request.cancel.clone()) => Ok(Termination::Cancelled),
        };
        let wall_time = handle.elapsed();
        let termination = match waited {
            Ok(termination) => termination,
            Err(e) => {
                handle.release();
                return Err(e.into());
            }
        };

        // Whatever ended the run, nothing from it may outlive it
        handle.kill();
        if !matches!(termination, Termination::Exited(_)) {
            let _ = child.wait().await;
        }

        let output = capture.finish(OUTPUT_GRACE).await;
        let usage = handle.collect();
        let verdict = limits::classify(termination, &usage, handle.limits(), output.truncated);
        let _ = tokio::task::spawn_blocking(move || handle.release()).await;

        let cap = request.limits.max_output_bytes;
        let result = RunResult {
            stdout: decode_capped(&output.stdout, cap),
            stderr: decode_capped(&output.stderr, cap),
            output: decode_capped(&output.combined, cap),
            exit_code: verdict.exit_code,
            signal: verdict.signal,
            memory_bytes: usage.peak_memory_bytes,
            cpu_time_ms: usage.cpu_time_usec / 1000,
            wall_time_ms: wall_time.as_millis() as u64,
            outcome: verdict.outcome,
        };
        tracing::info!(
            outcome = ?result.outcome,
            exit_code = ?result.exit_code,
            wall_ms = result.wall_time_ms,
            cpu_ms = result.cpu_time_ms,
            memory_bytes = result.memory_bytes,
            "run finished"
        );
        Ok(result)
    }

    #[tracing::instrument(skip(self), fields(box_id = %box_id))]
    async fn cleanup(&self, box_id: &str) -> SandboxResult<()> {
        sandbox::validate_box_id(box_id)?;
        // A concurrent caller waits for the teardown in flight, then checks
        // for itself (a no-op when nothing is left)
        let lock = self.teardown_lock(box_id);
        let _serial = lock.lock().await;
        {
            let mut boxes = self.registry();
            match boxes.get_mut(box_id) {
                Some(entry) => entry.state = BoxState::CleaningUp,
                None => {
                    boxes.insert(box_id.to_string(), BoxEntry::placeholder(BoxState::CleaningUp));
                }
            }
        }

        let config = self.config.clone();
        let id = box_id.to_string();
        let result = blocking(move || teardown(&config, &id)).await;
        match &result {
            Ok(()) => {
                self.registry().remove(box_id);
                tracing::debug!("box cleaned up");
            }
            Err(e) => {
                self.set_state(box_id, BoxState::Quarantined);
                tracing::warn!(error = %e, "box cleanup incomplete, quarantined");
            }
        }
        result
    }
}
