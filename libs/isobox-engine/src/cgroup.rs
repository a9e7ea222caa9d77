//! Cgroup v2 accounting for boxes.
//!
//! Every box owns `<cgroup_root>/<box_id>`, which never holds processes
//! itself. Each spawn gets a fresh leaf `run-<seq>` below it so that peak
//! memory, CPU time and OOM events are exact for that one run.

use crate::error::{SandboxError, SandboxResult};
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONTROLLERS: &str = "+memory +pids +cpu";
const CGROUP2_SUPER_MAGIC: i64 = 0x6367_7270;

/// Post-run usage read from a leaf cgroup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageMetrics {
    pub peak_memory_bytes: u64,
    pub cpu_time_usec: u64,
    pub oom_killed: bool,
}

/// Enable the controllers we rely on for children of `path`.
pub fn enable_subtree_controllers(path: &Path) -> SandboxResult<()> {
    let control = path.join("cgroup.subtree_control");
    fs::write(&control, CONTROLLERS).map_err(|e| SandboxError::cgroup(&control, e))
}

/// Prepare the engine-wide cgroup root.
pub fn ensure_root(root: &Path) -> SandboxResult<()> {
    fs::create_dir_all(root).map_err(|e| SandboxError::cgroup(root, e))?;
    enable_subtree_controllers(root)
}

#[derive(Debug, Clone)]
pub struct BoxCgroup {
    path: PathBuf,
}

impl BoxCgroup {
    pub fn create(root: &Path, box_id: &str) -> SandboxResult<Self> {
        let path = root.join(box_id);
        fs::create_dir(&path).map_err(|e| SandboxError::cgroup(&path, e))?;
        enable_subtree_controllers(&path)?;
        Ok(Self { path })
    }

    /// Handle to a box cgroup that may or may not exist, for teardown.
    pub fn open(root: &Path, box_id: &str) -> Self {
        Self {
            path: root.join(box_id),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Create the leaf for spawn number `seq` with its limits applied.
    pub fn leaf(&self, seq: u64, memory_bytes: u64, max_processes: u64) -> SandboxResult<RunCgroup> {
        let path = self.path.join(format!("run-{}", seq));
        fs::create_dir(&path).map_err(|e| SandboxError::cgroup(&path, e))?;
        let leaf = RunCgroup { path };
        if let Err(e) = leaf.apply(memory_bytes, max_processes) {
            let _ = leaf.remove();
            return Err(e);
        }
        Ok(leaf)
    }

    fn leaves(&self) -> Vec<RunCgroup> {
        let Ok(entries) = fs::read_dir(&self.path) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|entry| RunCgroup { path: entry.path() })
            .collect()
    }

    /// Kill everything left in any leaf of this box.
    pub fn kill_all(&self) {
        for leaf in self.leaves() {
            leaf.kill();
        }
    }

    /// Remove every leaf, then the box cgroup. Missing is success.
    pub fn remove(&self) -> io::Result<()> {
        if !self.exists() {
            return Ok(());
        }
        for leaf in self.leaves() {
            leaf.kill();
            leaf.remove()?;
        }
        remove_cgroup_dir(&self.path)
    }
}

#[derive(Debug)]
pub struct RunCgroup {
    path: PathBuf,
}

impl RunCgroup {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn procs_path(&self) -> PathBuf {
        self.path.join("cgroup.procs")
    }

    fn apply(&self, memory_bytes: u64, max_processes: u64) -> SandboxResult<()> {
        self.write("memory.max", &memory_bytes.to_string())?;
        // Exact accounting: no swap, so the box is OOM-killed instead of thrashing
        self.write("memory.swap.max", "0")?;
        self.write("memory.oom.group", "1")?;
        self.write("pids.max", &max_processes.to_string())?;
        Ok(())
    }

    fn write(&self, file: &str, value: &str) -> SandboxResult<()> {
        let path = self.path.join(file);
        fs::write(&path, value).map_err(|e| SandboxError::cgroup(&path, e))
    }

    pub fn cpu_usage_usec(&self) -> u64 {
        let Ok(content) = fs::read_to_string(self.path.join("cpu.stat")) else {
            return 0;
        };
        parse_keyed(&content, "usage_usec").unwrap_or(0)
    }

    /// memory.peak when the kernel has it, memory.current otherwise.
    pub fn peak_memory(&self) -> u64 {
        ["memory.peak", "memory.current"]
            .iter()
            .find_map(|file| {
                fs::read_to_string(self.path.join(file))
                    .ok()
                    .and_then(|s| s.trim().parse::<u64>().ok())
            })
            .unwrap_or(0)
    }

    pub fn oom_killed(&self) -> bool {
        fs::read_to_string(self.path.join("memory.events"))
            .ok()
            .and_then(|content| parse_keyed(&content, "oom_kill"))
            .map(|count| count > 0)
            .unwrap_or(false)
    }

    pub fn usage(&self) -> UsageMetrics {
        UsageMetrics {
            peak_memory_bytes: self.peak_memory(),
            cpu_time_usec: self.cpu_usage_usec(),
            oom_killed: self.oom_killed(),
        }
    }

    pub fn pids(&self) -> Vec<i32> {
        fs::read_to_string(self.procs_path())
            .map(|content| content.lines().filter_map(|l| l.trim().parse().ok()).collect())
            .unwrap_or_default()
    }

    /// SIGKILL every process in the leaf. Uses cgroup.kill, falling back to
    /// signalling each pid on kernels without it.
    pub fn kill(&self) {
        let kill_file = self.path.join("cgroup.kill");
        if kill_file.exists() && fs::write(&kill_file, "1").is_ok() {
            return;
        }
        for pid in self.pids() {
            if pid > 0 {
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                }
            }
        }
    }

    /// rmdir with a short retry while the kernel reaps killed tasks.
    pub fn remove(&self) -> io::Result<()> {
        remove_cgroup_dir(&self.path)
    }
}

fn parse_keyed(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(k), Some(v)) if k == key => v.parse().ok(),
            _ => None,
        }
    })
}

fn is_cgroupfs(path: &Path) -> bool {
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statfs(c_path.as_ptr(), &mut stat) };
    rc == 0 && stat.f_type as i64 == CGROUP2_SUPER_MAGIC
}

fn remove_cgroup_dir(path: &Path) -> io::Result<()> {
    let mut last_err = None;
    for _ in 0..10 {
        match fs::remove_dir(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            // Plain directory standing in for a cgroup (tests, stale state)
            Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) && !is_cgroupfs(path) => {
                return fs::remove_dir_all(path);
            }
            Err(e) => {
                last_err = Some(e);
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::Other)))
}
