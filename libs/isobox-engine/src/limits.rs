//! Resource limiter: turns a [`LimitSet`] into cgroup and rlimit enforcement
//! and classifies how a run ended.

use crate::cgroup::{BoxCgroup, RunCgroup, UsageMetrics};
use crate::error::{SandboxError, SandboxResult};
use isobox_common::types::{LimitOverrides, LimitSet, NetworkMode, RunOutcome};
use nix::sys::signal::Signal;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

/// Cap on any single file written inside a box.
pub const MAX_FILE_SIZE_BYTES: u64 = 256 * 1024 * 1024;

/// Loopback names accepted in a network allowlist.
const LOOPBACK_HOSTS: &[&str] = &["127.0.0.1", "localhost", "::1"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Compile,
    Run,
}

/// Merge per-job overrides into the stage defaults. Unless the deployment
/// allows overrides, a per-job value may only tighten the default.
pub fn resolve(defaults: &LimitSet, stage: Stage, overrides: &LimitOverrides, allow_loosen: bool) -> LimitSet {
    let pick = |default: u64, requested: Option<u64>| match requested {
        Some(value) if allow_loosen => value,
        Some(value) => value.min(default),
        None => default,
    };

    let mut limits = defaults.clone();
    match stage {
        Stage::Compile => {
            limits.wall_time_ms = pick(defaults.wall_time_ms, overrides.compile_timeout_ms);
            limits.cpu_time_ms = pick(defaults.cpu_time_ms, overrides.compile_cpu_time_ms);
            limits.memory_bytes = pick(defaults.memory_bytes, overrides.compile_memory_limit_bytes);
        }
        Stage::Run => {
            limits.wall_time_ms = pick(defaults.wall_time_ms, overrides.run_timeout_ms);
            limits.cpu_time_ms = pick(defaults.cpu_time_ms, overrides.run_cpu_time_ms);
            limits.memory_bytes = pick(defaults.memory_bytes, overrides.run_memory_limit_bytes);
            if let Some(network) = &overrides.network {
                limits.network = resolve_network(&defaults.network, network, allow_loosen);
            }
        }
    }
    limits
}

fn resolve_network(default: &NetworkMode, requested: &NetworkMode, allow_loosen: bool) -> NetworkMode {
    if allow_loosen {
        return requested.clone();
    }
    match (default, requested) {
        (NetworkMode::Full, _) => requested.clone(),
        (_, NetworkMode::None) => NetworkMode::None,
        (NetworkMode::Allowlist(allowed), NetworkMode::Allowlist(wanted)) => {
            NetworkMode::Allowlist(wanted.iter().filter(|h| allowed.contains(h)).cloned().collect())
        }
        _ => default.clone(),
    }
}

pub fn validate(limits: &LimitSet) -> SandboxResult<()> {
    let fields = [
        ("wall_time_ms", limits.wall_time_ms),
        ("cpu_time_ms", limits.cpu_time_ms),
        ("memory_bytes", limits.memory_bytes),
        ("max_processes", limits.max_processes),
        ("max_open_files", limits.max_open_files),
    ];
    if let Some((name, _)) = fields.iter().find(|(_, value)| *value == 0) {
        return Err(SandboxError::InvalidLimits(format!("{} must be greater than 0", name)));
    }
    if let NetworkMode::Allowlist(hosts) = &limits.network {
        if let Some(host) = hosts.iter().find(|h| !LOOPBACK_HOSTS.contains(&h.as_str())) {
            return Err(SandboxError::InvalidLimits(format!(
                "allowlist entry {} is not reachable from an isolated network namespace",
                host
            )));
        }
    }
    Ok(())
}

/// Values installed with setrlimit in the child before exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlimitPlan {
    pub cpu_soft_secs: u64,
    pub cpu_hard_secs: u64,
    pub open_files: u64,
    pub file_size: u64,
}

impl RlimitPlan {
    pub fn from_limits(limits: &LimitSet) -> Self {
        let cpu_soft_secs = limits.cpu_time_ms.div_ceil(1000).max(1);
        Self {
            cpu_soft_secs,
            cpu_hard_secs: cpu_soft_secs.saturating_add(1),
            open_files: limits.max_open_files,
            file_size: MAX_FILE_SIZE_BYTES,
        }
    }

    /// Runs in the forked child: no allocation, errno on failure.
    pub fn apply(&self) -> Result<(), i32> {
        set_rlimit(libc::RLIMIT_CPU, self.cpu_soft_secs, self.cpu_hard_secs)?;
        set_rlimit(libc::RLIMIT_NOFILE, self.open_files, self.open_files)?;
        set_rlimit(libc::RLIMIT_CORE, 0, 0)?;
        set_rlimit(libc::RLIMIT_FSIZE, self.file_size, self.file_size)?;
        Ok(())
    }
}

fn set_rlimit(resource: libc::__rlimit_resource_t, soft: u64, hard: u64) -> Result<(), i32> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    let rc = unsafe { libc::setrlimit(resource, &limit) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL))
    }
}

/// Enforcement attached to one spawn.
pub struct LimiterHandle {
    leaf: RunCgroup,
    limits: LimitSet,
    started: Instant,
}

/// Create the run leaf with memory, swap and pid ceilings.
pub fn apply(limits: &LimitSet, box_cgroup: &BoxCgroup, seq: u64) -> SandboxResult<LimiterHandle> {
    validate(limits)?;
    let leaf = box_cgroup.leaf(seq, limits.memory_bytes, limits.max_processes)?;
    Ok(LimiterHandle {
        leaf,
        limits: limits.clone(),
        started: Instant::now(),
    })
}

impl LimiterHandle {
    pub fn leaf(&self) -> &RunCgroup {
        &self.leaf
    }

    pub fn limits(&self) -> &LimitSet {
        &self.limits
    }

    pub fn wall_limit(&self) -> Duration {
        Duration::from_millis(self.limits.wall_time_ms)
    }

    pub fn restart_clock(&mut self) {
        self.started = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn cpu_exceeded(&self) -> bool {
        self.leaf.cpu_usage_usec() >= cpu_budget_usec(&self.limits)
    }

    pub fn kill(&self) {
        self.leaf.kill();
    }

    pub fn collect(&self) -> UsageMetrics {
        self.leaf.usage()
    }

    /// Kill stragglers and remove the leaf.
    pub fn release(self) {
        self.leaf.kill();
        if let Err(e) = self.leaf.remove() {
            tracing::warn!(path = %self.leaf.path().display(), error = %e, "failed to remove run cgroup");
        }
    }
}

/// How the watchdog saw the run end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(ExitStatus),
    WallTimeout,
    CpuLimit,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub outcome: RunOutcome,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

fn cpu_budget_usec(limits: &LimitSet) -> u64 {
    limits.cpu_time_ms.saturating_mul(1000)
}

pub fn signal_name(signal: i32) -> String {
    Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("SIG{}", signal))
}

/// Rank the ways a run can end. Wall time wins over CPU time, and memory is
/// only blamed when the kernel OOM killer actually fired.
pub fn classify(termination: Termination, usage: &UsageMetrics, limits: &LimitSet, truncated: bool) -> Verdict {
    let killed = |outcome| Verdict {
        outcome,
        exit_code: None,
        signal: Some(Signal::SIGKILL.as_str().to_string()),
    };

    let status = match termination {
        Termination::WallTimeout => return killed(RunOutcome::Timeout),
        Termination::Cancelled => return killed(RunOutcome::SignalKilled),
        Termination::CpuLimit => return killed(RunOutcome::Timeout),
        Termination::Exited(status) => status,
    };

    if let Some(sig) = status.signal() {
        let cpu_over = usage.cpu_time_usec >= cpu_budget_usec(limits);
        let outcome = if sig == libc::SIGXCPU || (sig == libc::SIGKILL && cpu_over) {
            RunOutcome::Timeout
        } else if usage.oom_killed {
            RunOutcome::MemoryExceeded
        } else {
            RunOutcome::SignalKilled
        };
        return Verdict {
            outcome,
            exit_code: None,
            signal: Some(signal_name(sig)),
        };
    }

    let code = status.code();
    let outcome = match code {
        _ if usage.oom_killed => RunOutcome::MemoryExceeded,
        Some(0) if truncated => RunOutcome::OutputTruncated,
        Some(0) => RunOutcome::Success,
        _ => RunOutcome::RuntimeError,
    };
    Verdict {
        outcome,
        exit_code: code,
        signal: None,
    }
}
