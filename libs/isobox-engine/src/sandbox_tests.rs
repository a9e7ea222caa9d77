//! Kernel-backed sandbox tests. They need root, cgroup v2 with the memory,
//! pids and cpu controllers, and a host with /bin/sh. Run with
//! `cargo test -p isobox-engine -- --ignored`.

use crate::linux::{LinuxSandbox, LinuxSandboxConfig};
use crate::sandbox::{RunRequest, Sandbox, SandboxFile};
use isobox_common::types::{LimitSet, RunOutcome};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const PATH: &str = "/usr/local/bin:/usr/bin:/bin";

fn sandbox(tmp: &TempDir) -> LinuxSandbox {
    let cgroup_root = PathBuf::from(format!("/sys/fs/cgroup/isobox-test-{}", std::process::id()));
    let sandbox = LinuxSandbox::new(LinuxSandboxConfig {
        sandbox_root: tmp.path().join("boxes"),
        cgroup_root,
        system_mounts: ["/bin", "/lib", "/lib64", "/usr", "/sbin"].iter().map(PathBuf::from).collect(),
        base_uid: 60000,
        base_gid: 60000,
    });
    sandbox.prepare_host().unwrap();
    sandbox
}

fn request(command: &str, args: &[&str], stdin: Option<&str>, limits: LimitSet) -> RunRequest {
    RunRequest {
        command: command.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        env: vec![("PATH".to_string(), PATH.to_string())],
        stdin: stdin.map(|s| s.as_bytes().to_vec()),
        limits,
        cancel: None,
    }
}

fn sh(script: &str, limits: LimitSet) -> RunRequest {
    request("/bin/sh", &["-c", script], None, limits)
}

#[tokio::test]
#[ignore] // Requires root and cgroup v2
async fn test_cat_echoes_stdin() {
    let tmp = TempDir::new().unwrap();
    let sandbox = sandbox(&tmp);
    sandbox.init("box-0", 0).await.unwrap();

    let result = sandbox
        .run("box-0", request("/bin/cat", &[], Some("World"), LimitSet::run_default()))
        .await
        .unwrap();

    assert_eq!(result.stdout, "World");
    assert_eq!(result.outcome, RunOutcome::Success);
    assert_eq!(result.exit_code, Some(0));
    assert!(result.signal.is_none());
    sandbox.cleanup("box-0").await.unwrap();
}

#[tokio::test]
#[ignore] // Requires root and cgroup v2
async fn test_sleeping_process_hits_wall_limit() {
    let tmp = TempDir::new().unwrap();
    let sandbox = sandbox(&tmp);
    sandbox.init("box-0", 0).await.unwrap();

    let limits = LimitSet {
        wall_time_ms: 1000,
        ..LimitSet::run_default()
    };
    let started = Instant::now();
    let result = sandbox.run("box-0", request("/bin/sleep", &["10"], None, limits)).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(result.outcome, RunOutcome::Timeout);
    assert_eq!(result.exit_code, None);
    assert_eq!(result.signal.as_deref(), Some("SIGKILL"));
    assert!(result.cpu_time_ms < 500);
    sandbox.cleanup("box-0").await.unwrap();
}

#[tokio::test]
#[ignore] // Requires root and cgroup v2
async fn test_busy_loop_hits_cpu_limit() {
    let tmp = TempDir::new().unwrap();
    let sandbox = sandbox(&tmp);
    sandbox.init("box-0", 0).await.unwrap();

    let limits = LimitSet {
        cpu_time_ms: 1000,
        wall_time_ms: 10_000,
        ..LimitSet::run_default()
    };
    let result = sandbox.run("box-0", sh("while :; do :; done", limits)).await.unwrap();

    assert_eq!(result.outcome, RunOutcome::Timeout);
    assert!(result.cpu_time_ms >= 900);
    sandbox.cleanup("box-0").await.unwrap();
}

#[tokio::test]
#[ignore] // Requires root and cgroup v2
async fn test_fork_bomb_contained() {
    let tmp = TempDir::new().unwrap();
    let sandbox = sandbox(&tmp);
    sandbox.init("box-0", 0).await.unwrap();

    let limits = LimitSet {
        max_processes: 16,
        wall_time_ms: 3000,
        ..LimitSet::run_default()
    };
    let result = sandbox
        .run("box-0", sh("bomb() { bomb | bomb & }; bomb; sleep 5", limits))
        .await
        .unwrap();

    assert_ne!(result.outcome, RunOutcome::Success);
    sandbox.cleanup("box-0").await.unwrap();

    // The host can still spawn processes
    let status = std::process::Command::new("/bin/true").status().unwrap();
    assert!(status.success());
}

#[tokio::test]
#[ignore] // Requires root and cgroup v2
async fn test_memory_hog_is_oom_killed() {
    let tmp = TempDir::new().unwrap();
    let sandbox = sandbox(&tmp);
    sandbox.init("box-0", 0).await.unwrap();

    let limits = LimitSet {
        memory_bytes: 32 * 1024 * 1024,
        ..LimitSet::run_default()
    };
    let result = sandbox
        .run("box-0", sh("head -c 200000000 /dev/zero | tail", limits))
        .await
        .unwrap();

    assert_eq!(result.outcome, RunOutcome::MemoryExceeded);
    sandbox.cleanup("box-0").await.unwrap();
}

#[tokio::test]
#[ignore] // Requires root and cgroup v2
async fn test_output_capped_without_failing() {
    let tmp = TempDir::new().unwrap();
    let sandbox = sandbox(&tmp);
    sandbox.init("box-0", 0).await.unwrap();

    let limits = LimitSet {
        max_output_bytes: 10 * 1024,
        wall_time_ms: 20_000,
        cpu_time_ms: 20_000,
        ..LimitSet::run_default()
    };
    let result = sandbox
        .run("box-0", sh("yes 0123456789 | head -c 100000000", limits))
        .await
        .unwrap();

    assert_eq!(result.stdout.len(), 10 * 1024);
    assert_eq!(result.outcome, RunOutcome::OutputTruncated);
    assert_eq!(result.exit_code, Some(0));
    sandbox.cleanup("box-0").await.unwrap();
}

#[tokio::test]
#[ignore] // Requires root and cgroup v2
async fn test_isolation_guarantees() {
    let tmp = TempDir::new().unwrap();
    let sandbox = sandbox(&tmp);
    sandbox.init("box-3", 3).await.unwrap();

    let check = |script: &str| sh(script, LimitSet::run_default());

    // Own pid namespace: the shell is pid 1's child, not a host pid
    let pid = sandbox.run("box-3", check("echo $$")).await.unwrap();
    assert!(pid.stdout.trim().parse::<u32>().unwrap() <= 3);

    let id = sandbox.run("box-3", check("id -u; id -g")).await.unwrap();
    assert_eq!(id.stdout, "60003\n60003\n");

    // No interfaces besides an unconfigured loopback
    let net = sandbox.run("box-3", check("cat /proc/net/dev | wc -l")).await.unwrap();
    assert!(net.stdout.trim().parse::<u32>().unwrap() <= 3);

    // System layers are read-only, the scratch area is writable
    let ro = sandbox.run("box-3", check("touch /usr/x")).await.unwrap();
    assert_eq!(ro.outcome, RunOutcome::RuntimeError);
    let rw = sandbox.run("box-3", check("echo ok > out.txt && cat out.txt")).await.unwrap();
    assert_eq!(rw.stdout, "ok\n");

    sandbox.cleanup("box-3").await.unwrap();
}

#[tokio::test]
#[ignore] // Requires root and cgroup v2
async fn test_files_visible_and_runs_reuse_box() {
    let tmp = TempDir::new().unwrap();
    let sandbox = sandbox(&tmp);
    sandbox.init("box-0", 0).await.unwrap();
    let names = sandbox
        .write_files(
            "box-0",
            &[SandboxFile {
                name: Some("data/in.txt".to_string()),
                content: b"hello".to_vec(),
            }],
        )
        .await
        .unwrap();
    assert_eq!(names, vec!["data/in.txt"]);

    for _ in 0..3 {
        let result = sandbox
            .run("box-0", sh("cat data/in.txt", LimitSet::run_default()))
            .await
            .unwrap();
        assert_eq!(result.stdout, "hello");
    }
    sandbox.cleanup("box-0").await.unwrap();
}

#[tokio::test]
#[ignore] // Requires root and cgroup v2
async fn test_cleanup_idempotent_and_isolated() {
    let tmp = TempDir::new().unwrap();
    let sandbox = sandbox(&tmp);
    sandbox.init("box-0", 0).await.unwrap();
    sandbox.init("box-1", 1).await.unwrap();

    sandbox.cleanup("box-0").await.unwrap();
    sandbox.cleanup("box-0").await.unwrap();
    assert!(!sandbox.box_root("box-0").exists());

    let other = sandbox
        .run("box-1", request("/bin/cat", &[], Some("still here"), LimitSet::run_default()))
        .await
        .unwrap();
    assert_eq!(other.stdout, "still here");

    // The id is reusable once fully torn down
    sandbox.init("box-0", 0).await.unwrap();
    sandbox.cleanup("box-0").await.unwrap();
    sandbox.cleanup("box-1").await.unwrap();
}
