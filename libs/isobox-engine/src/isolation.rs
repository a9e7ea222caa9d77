//! Isolation boundary.
//!
//! Host side: read-only bind mounts of system and runtime layers into the box
//! root, done once per box. Child side: a fixed pre-exec sequence that joins
//! the run cgroup, enters fresh mount/IPC/UTS/PID (and usually network)
//! namespaces, chroots into the box and drops to the box identity. Each
//! child-side step reports its own failure over a CLOEXEC pipe so the spawn
//! is aborted with the exact step that broke.

use crate::cgroup::RunCgroup;
use crate::error::{SandboxError, SandboxResult, SetupError, SetupStep};
use crate::limits::RlimitPlan;
use isobox_common::types::{LimitSet, NetworkMode};
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Mount point of the runtime layer inside every box.
pub const RUNTIME_MOUNT: &str = "runtime";
/// Working directory of spawned processes, relative to the box root.
pub const WORKDIR: &str = "submission";

const DEVICE_NODES: &[&str] = &["/dev/null", "/dev/zero", "/dev/urandom", "/dev/random"];

fn cstring(path: &Path) -> SandboxResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| SandboxError::InvalidFile {
        name: path.display().to_string(),
        reason: "path contains a NUL byte".to_string(),
    })
}

/// A host path bound into the box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    pub source: PathBuf,
    /// Path relative to the box root
    pub target: PathBuf,
    pub read_only: bool,
}

impl Layer {
    pub fn system(source: &Path) -> Self {
        Self {
            source: source.to_path_buf(),
            target: source.strip_prefix("/").unwrap_or(source).to_path_buf(),
            read_only: true,
        }
    }

    pub fn runtime(root: &Path) -> Self {
        Self {
            source: root.to_path_buf(),
            target: PathBuf::from(RUNTIME_MOUNT),
            read_only: true,
        }
    }

    fn device(node: &str) -> Self {
        Self {
            source: PathBuf::from(node),
            target: PathBuf::from(node.trim_start_matches('/')),
            read_only: false,
        }
    }
}

/// System directories that exist on this host plus the device nodes.
pub fn base_layers(system_mounts: &[PathBuf]) -> Vec<Layer> {
    system_mounts
        .iter()
        .filter(|p| p.is_dir())
        .map(|p| Layer::system(p))
        .chain(DEVICE_NODES.iter().map(|n| Layer::device(n)))
        .collect()
}

/// Bind `layer` into `box_root`. Read-only layers are remounted read-only.
pub fn mount_layer(box_root: &Path, layer: &Layer) -> Result<PathBuf, SetupError> {
    let target = box_root.join(&layer.target);
    let is_file = !layer.source.is_dir();
    let prepared = if is_file {
        target
            .parent()
            .map(fs::create_dir_all)
            .transpose()
            .and_then(|_| fs::OpenOptions::new().create(true).write(true).open(&target).map(|_| ()))
    } else {
        fs::create_dir_all(&target)
    };
    prepared.map_err(|e| SetupError::io(SetupStep::BindMount, e))?;

    let src = CString::new(layer.source.as_os_str().as_bytes())
        .map_err(|_| SetupError::new(SetupStep::BindMount, "source contains NUL"))?;
    let dst = CString::new(target.as_os_str().as_bytes())
        .map_err(|_| SetupError::new(SetupStep::BindMount, "target contains NUL"))?;

    let rc = unsafe {
        libc::mount(
            src.as_ptr(),
            dst.as_ptr(),
            std::ptr::null(),
            libc::MS_BIND | libc::MS_REC,
            std::ptr::null(),
        )
    };
    if rc != 0 {
        return Err(SetupError::new(
            SetupStep::BindMount,
            format!("{} -> {}: {}", layer.source.display(), target.display(), io::Error::last_os_error()),
        ));
    }

    let mut flags = libc::MS_BIND | libc::MS_REMOUNT | libc::MS_NOSUID;
    if layer.read_only {
        flags |= libc::MS_RDONLY | libc::MS_NODEV;
    }
    let rc = unsafe { libc::mount(std::ptr::null(), dst.as_ptr(), std::ptr::null(), flags, std::ptr::null()) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        let _ = detach(&target);
        return Err(SetupError::new(
            SetupStep::BindMount,
            format!("remount {}: {}", target.display(), err),
        ));
    }
    Ok(target)
}

pub fn detach(path: &Path) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let rc = unsafe { libc::umount2(c_path.as_ptr(), libc::MNT_DETACH) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    // EINVAL: not a mount point any more
    match err.raw_os_error() {
        Some(libc::EINVAL) | Some(libc::ENOENT) => Ok(()),
        _ => Err(err),
    }
}

/// Mount points at or below `root`, deepest first.
pub fn mounts_under(mountinfo: &str, root: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = mountinfo
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|raw| PathBuf::from(unescape_mountinfo(raw)))
        .filter(|p| p.starts_with(root))
        .collect();
    found.sort_by(|a, b| {
        b.components()
            .count()
            .cmp(&a.components().count())
            .then_with(|| a.cmp(b))
    });
    found.dedup();
    found
}

/// Detach every mount left under `root` (leaked or not yet unmounted).
pub fn detach_all_under(root: &Path) -> io::Result<()> {
    let mountinfo = match fs::read_to_string("/proc/self/mountinfo") {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for mount in mounts_under(&mountinfo, root) {
        detach(&mount)?;
    }
    Ok(())
}

fn unescape_mountinfo(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b)) {
            let value = (bytes[i + 1] - b'0') * 64 + (bytes[i + 2] - b'0') * 8 + (bytes[i + 3] - b'0');
            out.push(value);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkPolicy {
    /// Empty network namespace, not even loopback
    Isolated,
    /// Own network namespace with `lo` up
    LoopbackOnly,
    Host,
}

impl NetworkPolicy {
    pub fn from_mode(mode: &NetworkMode) -> Self {
        match mode {
            NetworkMode::None => NetworkPolicy::Isolated,
            NetworkMode::Allowlist(_) => NetworkPolicy::LoopbackOnly,
            NetworkMode::Full => NetworkPolicy::Host,
        }
    }
}

/// Box identity a process runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

/// Everything the child needs, prepared before fork so the pre-exec path
/// does not allocate.
#[derive(Debug)]
pub struct IsolationPlan {
    root: CString,
    workdir: CString,
    cgroup_procs: CString,
    proc_source: CString,
    proc_target: CString,
    network: NetworkPolicy,
    rlimits: RlimitPlan,
    identity: Identity,
}

impl IsolationPlan {
    pub fn new(box_root: &Path, leaf: &RunCgroup, limits: &LimitSet, identity: Identity) -> SandboxResult<Self> {
        Ok(Self {
            root: cstring(box_root)?,
            workdir: cstring(&Path::new("/").join(WORKDIR))?,
            cgroup_procs: cstring(&leaf.procs_path())?,
            proc_source: cstring(Path::new("proc"))?,
            proc_target: cstring(Path::new("/proc"))?,
            network: NetworkPolicy::from_mode(&limits.network),
            rlimits: RlimitPlan::from_limits(limits),
            identity,
        })
    }

    pub fn unshare_flags(&self) -> libc::c_int {
        let mut flags = libc::CLONE_NEWNS | libc::CLONE_NEWIPC | libc::CLONE_NEWUTS | libc::CLONE_NEWPID;
        if self.network != NetworkPolicy::Host {
            flags |= libc::CLONE_NEWNET;
        }
        flags
    }

    /// Child side of the spawn. Called from `pre_exec`; returns only in the
    /// process that goes on to exec the user command.
    ///
    /// # Safety
    /// Must only run between fork and exec.
    pub unsafe fn enter(&self, report: RawFd) -> io::Result<()> {
        check(report, SetupStep::ProcessGroup, libc::setpgid(0, 0))?;
        self.join_cgroup(report)?;
        check(report, SetupStep::Unshare, libc::unshare(self.unshare_flags()))?;
        check(
            report,
            SetupStep::PrivateMounts,
            libc::mount(
                std::ptr::null(),
                b"/\0".as_ptr().cast(),
                std::ptr::null(),
                libc::MS_REC | libc::MS_PRIVATE,
                std::ptr::null(),
            ),
        )?;
        if self.network == NetworkPolicy::LoopbackOnly {
            loopback_up(report)?;
        }
        check(report, SetupStep::Chroot, libc::chroot(self.root.as_ptr()))?;
        check(report, SetupStep::Chdir, libc::chdir(self.workdir.as_ptr()))?;

        // The new PID namespace applies to our children only: fork once more
        // and let this process wait as a transparent shim.
        let pid = libc::fork();
        if pid < 0 {
            return fail(report, SetupStep::PidNamespaceInit, last_errno());
        }
        if pid > 0 {
            pid_namespace_shim(pid);
        }

        check(
            report,
            SetupStep::MountProc,
            libc::mount(
                self.proc_source.as_ptr(),
                self.proc_target.as_ptr(),
                self.proc_source.as_ptr(),
                libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
                std::ptr::null(),
            ),
        )?;
        check(
            report,
            SetupStep::ParentDeathSignal,
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0),
        )?;
        if let Err(errno) = self.rlimits.apply() {
            return fail(report, SetupStep::Rlimit, errno);
        }
        check(report, SetupStep::DropGroups, libc::setgroups(0, std::ptr::null()))?;
        check(report, SetupStep::SetGid, libc::setgid(self.identity.gid))?;
        check(report, SetupStep::SetUid, libc::setuid(self.identity.uid))?;
        check(report, SetupStep::NoNewPrivs, libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0))?;
        Ok(())
    }

    unsafe fn join_cgroup(&self, report: RawFd) -> io::Result<()> {
        let fd = libc::open(self.cgroup_procs.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
        if fd < 0 {
            return fail(report, SetupStep::JoinCgroup, last_errno());
        }
        let written = libc::write(fd, b"0".as_ptr().cast(), 1);
        let errno = last_errno();
        libc::close(fd);
        if written != 1 {
            return fail(report, SetupStep::JoinCgroup, errno);
        }
        Ok(())
    }
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

unsafe fn check(report: RawFd, step: SetupStep, rc: libc::c_int) -> io::Result<()> {
    if rc < 0 {
        return fail(report, step, last_errno());
    }
    Ok(())
}

unsafe fn fail(report: RawFd, step: SetupStep, errno: i32) -> io::Result<()> {
    let mut msg = [0u8; 5];
    msg[0] = step as u8;
    msg[1..].copy_from_slice(&errno.to_le_bytes());
    libc::write(report, msg.as_ptr().cast(), msg.len());
    Err(io::Error::from_raw_os_error(errno))
}

unsafe fn loopback_up(report: RawFd) -> io::Result<()> {
    let sock = libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0);
    if sock < 0 {
        return fail(report, SetupStep::Loopback, last_errno());
    }
    let mut req: libc::ifreq = std::mem::zeroed();
    req.ifr_name[0] = b'l' as libc::c_char;
    req.ifr_name[1] = b'o' as libc::c_char;

    if libc::ioctl(sock, libc::SIOCGIFFLAGS as _, &mut req) < 0 {
        let errno = last_errno();
        libc::close(sock);
        return fail(report, SetupStep::Loopback, errno);
    }
    req.ifr_ifru.ifru_flags |= libc::IFF_UP as libc::c_short;
    if libc::ioctl(sock, libc::SIOCSIFFLAGS as _, &mut req) < 0 {
        let errno = last_errno();
        libc::close(sock);
        return fail(report, SetupStep::Loopback, errno);
    }
    libc::close(sock);
    Ok(())
}

/// Waits for the namespace init and mirrors how it ended. Closes every fd
/// first so the pipes the engine reads see EOF when the real process exits.
unsafe fn pid_namespace_shim(child: libc::pid_t) -> ! {
    libc::syscall(libc::SYS_close_range, 0u32, u32::MAX, 0u32);
    let mut status = 0;
    loop {
        let rc = libc::waitpid(child, &mut status, 0);
        if rc == child {
            break;
        }
        if rc < 0 && last_errno() != libc::EINTR {
            libc::_exit(1);
        }
    }
    if libc::WIFEXITED(status) {
        libc::_exit(libc::WEXITSTATUS(status));
    }
    if libc::WIFSIGNALED(status) {
        let sig = libc::WTERMSIG(status);
        libc::signal(sig, libc::SIG_DFL);
        libc::kill(libc::getpid(), sig);
        libc::_exit(128 + sig);
    }
    libc::_exit(1)
}

/// Pipe the child reports failed setup steps through.
pub struct ReportPipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl ReportPipe {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe {
            Ok(Self {
                read: OwnedFd::from_raw_fd(fds[0]),
                write: OwnedFd::from_raw_fd(fds[1]),
            })
        }
    }

    pub fn write_fd(&self) -> RawFd {
        use std::os::fd::AsRawFd;
        self.write.as_raw_fd()
    }

    /// Close our write end and read what the child reported, if anything.
    pub fn into_report(self) -> Option<SetupError> {
        use std::io::Read;
        drop(self.write);
        let mut file = fs::File::from(self.read);
        let mut buf = [0u8; 5];
        match file.read_exact(&mut buf) {
            Ok(()) => {
                let errno = i32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
                let step = SetupStep::from_u8(buf[0]).unwrap_or(SetupStep::Spawn);
                Some(SetupError::from_errno(step, errno))
            }
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::BoxCgroup;

    #[test]
    fn test_base_layers_skip_missing_dirs() {
        let layers = base_layers(&[PathBuf::from("/usr"), PathBuf::from("/definitely/not/here")]);
        assert!(layers.iter().any(|l| l.target == Path::new("usr") && l.read_only));
        assert!(!layers.iter().any(|l| l.source == Path::new("/definitely/not/here")));
        let null = layers.iter().find(|l| l.source == Path::new("/dev/null")).unwrap();
        assert_eq!(null.target, Path::new("dev/null"));
        assert!(!null.read_only);
    }

    #[test]
    fn test_runtime_layer_target() {
        let layer = Layer::runtime(Path::new("/opt/runtimes/python-3.12"));
        assert_eq!(layer.target, Path::new("runtime"));
        assert!(layer.read_only);
    }

    #[test]
    fn test_mounts_under_sorted_deepest_first() {
        let mountinfo = "\
36 35 98:0 / / rw - ext4 /dev/root rw
50 36 8:1 /usr /var/lib/isobox/boxes/box-1/usr ro - ext4 /dev/sda1 ro
51 50 8:1 /usr/lib /var/lib/isobox/boxes/box-1/usr/lib ro - ext4 /dev/sda1 ro
52 36 8:1 /opt/rt /var/lib/isobox/boxes/box-1/run\\040time ro - ext4 /dev/sda1 ro
53 36 8:1 /usr /var/lib/isobox/boxes/box-10/usr ro - ext4 /dev/sda1 ro
";
        let found = mounts_under(mountinfo, Path::new("/var/lib/isobox/boxes/box-1"));
        assert_eq!(found.len(), 3);
        assert_eq!(found[0], PathBuf::from("/var/lib/isobox/boxes/box-1/usr/lib"));
        assert!(found.contains(&PathBuf::from("/var/lib/isobox/boxes/box-1/run time")));
        assert!(!found.iter().any(|p| p.starts_with("/var/lib/isobox/boxes/box-10")));
    }

    #[test]
    fn test_unshare_flags_follow_network_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let cg = BoxCgroup::create(tmp.path(), "box-0").unwrap();
        let leaf = cg.leaf(0, 1 << 20, 8).unwrap();
        let identity = Identity { uid: 60001, gid: 60001 };

        let mut limits = LimitSet::run_default();
        let plan = IsolationPlan::new(tmp.path(), &leaf, &limits, identity).unwrap();
        assert_ne!(plan.unshare_flags() & libc::CLONE_NEWNET, 0);
        assert_ne!(plan.unshare_flags() & libc::CLONE_NEWPID, 0);

        limits.network = NetworkMode::Full;
        let plan = IsolationPlan::new(tmp.path(), &leaf, &limits, identity).unwrap();
        assert_eq!(plan.unshare_flags() & libc::CLONE_NEWNET, 0);
        assert_eq!(plan.identity, identity);
    }

    #[test]
    fn test_report_pipe_decodes_step() {
        let pipe = ReportPipe::new().unwrap();
        let result = unsafe { fail(pipe.write_fd(), SetupStep::Chroot, libc::EPERM) };
        assert!(result.is_err());

        let report = pipe.into_report().unwrap();
        assert_eq!(report.step, SetupStep::Chroot);
    }

    #[test]
    fn test_report_pipe_empty_means_success() {
        let pipe = ReportPipe::new().unwrap();
        assert!(pipe.into_report().is_none());
    }
}
