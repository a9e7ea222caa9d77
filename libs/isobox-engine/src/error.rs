use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// One step of box or process setup. Child-side steps travel over the report
/// pipe as their `u8` discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SetupStep {
    CreateBoxDir = 1,
    CreateCgroup = 2,
    ConfigureCgroup = 3,
    ValidateLimits = 4,
    ProcessGroup = 10,
    JoinCgroup = 11,
    Unshare = 12,
    PrivateMounts = 13,
    BindMount = 14,
    Loopback = 15,
    Chroot = 16,
    Chdir = 17,
    PidNamespaceInit = 18,
    MountProc = 19,
    ParentDeathSignal = 20,
    Rlimit = 21,
    DropGroups = 22,
    SetGid = 23,
    SetUid = 24,
    NoNewPrivs = 25,
    Spawn = 30,
}

impl SetupStep {
    pub fn from_u8(raw: u8) -> Option<Self> {
        use SetupStep::*;
        let step = match raw {
            1 => CreateBoxDir,
            2 => CreateCgroup,
            3 => ConfigureCgroup,
            4 => ValidateLimits,
            10 => ProcessGroup,
            11 => JoinCgroup,
            12 => Unshare,
            13 => PrivateMounts,
            14 => BindMount,
            15 => Loopback,
            16 => Chroot,
            17 => Chdir,
            18 => PidNamespaceInit,
            19 => MountProc,
            20 => ParentDeathSignal,
            21 => Rlimit,
            22 => DropGroups,
            23 => SetGid,
            24 => SetUid,
            25 => NoNewPrivs,
            30 => Spawn,
            _ => return None,
        };
        Some(step)
    }
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupStep::CreateBoxDir => "create box directory",
            SetupStep::CreateCgroup => "create cgroup",
            SetupStep::ConfigureCgroup => "configure cgroup",
            SetupStep::ValidateLimits => "validate limits",
            SetupStep::ProcessGroup => "setpgid",
            SetupStep::JoinCgroup => "join cgroup",
            SetupStep::Unshare => "unshare namespaces",
            SetupStep::PrivateMounts => "make mounts private",
            SetupStep::BindMount => "bind mount",
            SetupStep::Loopback => "bring up loopback",
            SetupStep::Chroot => "chroot",
            SetupStep::Chdir => "chdir",
            SetupStep::PidNamespaceInit => "fork pid namespace init",
            SetupStep::MountProc => "mount /proc",
            SetupStep::ParentDeathSignal => "set parent death signal",
            SetupStep::Rlimit => "setrlimit",
            SetupStep::DropGroups => "setgroups",
            SetupStep::SetGid => "setgid",
            SetupStep::SetUid => "setuid",
            SetupStep::NoNewPrivs => "set no_new_privs",
            SetupStep::Spawn => "spawn",
        };
        f.write_str(name)
    }
}

/// A setup step that failed before any user code ran.
#[derive(Debug, Error)]
#[error("isolation setup failed at {step}: {detail}")]
pub struct SetupError {
    pub step: SetupStep,
    pub detail: String,
}

impl SetupError {
    pub fn new(step: SetupStep, detail: impl Into<String>) -> Self {
        Self {
            step,
            detail: detail.into(),
        }
    }

    pub fn from_errno(step: SetupStep, errno: i32) -> Self {
        Self::new(step, std::io::Error::from_raw_os_error(errno).to_string())
    }

    pub fn io(step: SetupStep, err: std::io::Error) -> Self {
        Self::new(step, err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("box allocation failed for {box_id}: {reason}")]
    BoxAllocation { box_id: String, reason: String },

    #[error("unknown box: {0}")]
    UnknownBox(String),

    #[error("box {0} is already running a process")]
    BoxBusy(String),

    #[error("invalid file {name}: {reason}")]
    InvalidFile { name: String, reason: String },

    #[error("invalid limits: {0}")]
    InvalidLimits(String),

    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error("cgroup error at {path}: {source}")]
    Cgroup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cleanup of {box_id} incomplete: {reason}")]
    Cleanup { box_id: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn cgroup(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SandboxError::Cgroup {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CapacityError {
    #[error("requested {requested} bytes exceeds host budget of {budget} bytes")]
    HardCeiling { requested: u64, budget: u64 },

    #[error("all {ceiling} box slots are retired pending cleanup")]
    Exhausted { ceiling: usize },

    #[error("capacity is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("unknown runtime {language}-{version}")]
    UnknownRuntime { language: String, version: String },

    #[error("setup failed: {0}")]
    Setup(#[from] SandboxError),

    #[error("admission failed: {0}")]
    Capacity(#[from] CapacityError),

    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition {
        from: isobox_common::types::JobState,
        to: isobox_common::types::JobState,
    },

    #[error("cancelled")]
    Cancelled,
}

pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_codes_round_trip() {
        for step in [
            SetupStep::ProcessGroup,
            SetupStep::Unshare,
            SetupStep::Chroot,
            SetupStep::SetUid,
            SetupStep::NoNewPrivs,
        ] {
            assert_eq!(SetupStep::from_u8(step as u8), Some(step));
        }
        assert_eq!(SetupStep::from_u8(0), None);
        assert_eq!(SetupStep::from_u8(255), None);
    }

    #[test]
    fn test_setup_error_from_errno_names_step() {
        let err = SetupError::from_errno(SetupStep::Unshare, libc::EPERM);
        let msg = err.to_string();
        assert!(msg.contains("unshare namespaces"));
        assert!(msg.to_lowercase().contains("not permitted"));
    }
}
