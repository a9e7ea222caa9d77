//! In-memory `Sandbox` that records every call, for engine tests that need
//! no privileges.

use crate::error::{SandboxError, SandboxResult};
use crate::isolation::Identity;
use crate::sandbox::{BoxInfo, RunRequest, Sandbox, SandboxFile};
use async_trait::async_trait;
use isobox_common::types::{RunOutcome, RunResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

type Behavior = Box<dyn Fn(&RunRequest) -> RunResult + Send + Sync>;

#[derive(Default)]
struct State {
    calls: Vec<(String, String)>,
    runs: Vec<RunRequest>,
    boxes: HashMap<String, HashMap<String, Vec<u8>>>,
    active: usize,
    peak_active: usize,
    cleanup_failures: usize,
}

pub struct RecordingSandbox {
    state: Mutex<State>,
    behavior: Behavior,
    run_delay: Duration,
    fail_writes: bool,
}

pub fn run_result(stdout: &str, outcome: RunOutcome) -> RunResult {
    let success = matches!(outcome, RunOutcome::Success | RunOutcome::OutputTruncated);
    RunResult {
        stdout: stdout.to_string(),
        stderr: String::new(),
        output: stdout.to_string(),
        exit_code: if success {
            Some(0)
        } else if outcome == RunOutcome::RuntimeError {
            Some(1)
        } else {
            None
        },
        signal: match outcome {
            RunOutcome::Timeout | RunOutcome::MemoryExceeded | RunOutcome::SignalKilled => Some("SIGKILL".to_string()),
            _ => None,
        },
        memory_bytes: 1024 * 1024,
        cpu_time_ms: 1,
        wall_time_ms: 2,
        outcome,
    }
}

impl RecordingSandbox {
    /// Behaves like `cat`: every run echoes its stdin.
    pub fn new() -> Self {
        Self::with_behavior(|req| {
            let stdin = req.stdin.clone().unwrap_or_default();
            run_result(&String::from_utf8_lossy(&stdin), RunOutcome::Success)
        })
    }

    pub fn with_behavior<F>(behavior: F) -> Self
    where
        F: Fn(&RunRequest) -> RunResult + Send + Sync + 'static,
    {
        Self {
            state: Mutex::new(State::default()),
            behavior: Box::new(behavior),
            run_delay: Duration::ZERO,
            fail_writes: false,
        }
    }

    pub fn run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }

    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub fn failing_cleanup(self) -> Self {
        self.failing_cleanup_times(usize::MAX)
    }

    /// The next `times` cleanups fail, later ones succeed.
    pub fn failing_cleanup_times(mut self, times: usize) -> Self {
        self.state.get_mut().unwrap().cleanup_failures = times;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn record(&self, op: &str, detail: &str) {
        self.state().calls.push((op.to_string(), detail.to_string()));
    }

    pub fn count(&self, op: &str) -> usize {
        self.state().calls.iter().filter(|(o, _)| o == op).count()
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.state().calls.clone()
    }

    pub fn runs(&self) -> Vec<RunRequest> {
        self.state().runs.clone()
    }

    pub fn files(&self, box_id: &str) -> HashMap<String, Vec<u8>> {
        self.state().boxes.get(box_id).cloned().unwrap_or_default()
    }

    pub fn active(&self) -> usize {
        self.state().active
    }

    pub fn peak_active(&self) -> usize {
        self.state().peak_active
    }
}

#[async_trait]
impl Sandbox for RecordingSandbox {
    async fn init(&self, box_id: &str, slot: usize) -> SandboxResult<BoxInfo> {
        self.record("init", box_id);
        let mut state = self.state();
        if state.boxes.contains_key(box_id) {
            return Err(SandboxError::BoxAllocation {
                box_id: box_id.to_string(),
                reason: "already active".to_string(),
            });
        }
        state.boxes.insert(box_id.to_string(), HashMap::new());
        state.active += 1;
        state.peak_active = state.peak_active.max(state.active);
        let root = PathBuf::from("/boxes").join(box_id);
        Ok(BoxInfo {
            id: box_id.to_string(),
            scratch: root.join("submission"),
            root,
            identity: Identity {
                uid: 60000 + slot as u32,
                gid: 60000 + slot as u32,
            },
            slot,
        })
    }

    async fn mount_runtime(&self, box_id: &str, runtime_root: &Path) -> SandboxResult<()> {
        self.record("mount_runtime", &runtime_root.display().to_string());
        if !self.state().boxes.contains_key(box_id) {
            return Err(SandboxError::UnknownBox(box_id.to_string()));
        }
        Ok(())
    }

    async fn write_files(&self, box_id: &str, files: &[SandboxFile]) -> SandboxResult<Vec<String>> {
        self.record("write_files", box_id);
        if self.fail_writes {
            return Err(SandboxError::InvalidFile {
                name: "main".to_string(),
                reason: "disk full".to_string(),
            });
        }
        let mut state = self.state();
        let stored = state
            .boxes
            .get_mut(box_id)
            .ok_or_else(|| SandboxError::UnknownBox(box_id.to_string()))?;
        let mut names = Vec::new();
        for (i, file) in files.iter().enumerate() {
            let name = file.name.clone().unwrap_or_else(|| format!("generated-{}", i));
            stored.insert(name.clone(), file.content.clone());
            names.push(name);
        }
        Ok(names)
    }

    async fn run(&self, box_id: &str, request: RunRequest) -> SandboxResult<RunResult> {
        self.record("run", &request.command);
        {
            let mut state = self.state();
            if !state.boxes.contains_key(box_id) {
                return Err(SandboxError::UnknownBox(box_id.to_string()));
            }
            state.runs.push(request.clone());
        }

        let mut cancel = request.cancel.clone();
        let cancelled = async {
            match cancel.as_mut() {
                Some(rx) => {
                    if rx.wait_for(|v| *v).await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = cancelled => Ok(run_result("", RunOutcome::SignalKilled)),
            _ = tokio::time::sleep(self.run_delay) => Ok((self.behavior)(&request)),
        }
    }

    async fn cleanup(&self, box_id: &str) -> SandboxResult<()> {
        self.record("cleanup", box_id);
        let mut state = self.state();
        if state.cleanup_failures > 0 {
            state.cleanup_failures -= 1;
            return Err(SandboxError::Cleanup {
                box_id: box_id.to_string(),
                reason: "mount busy".to_string(),
            });
        }
        if state.boxes.remove(box_id).is_some() {
            state.active -= 1;
        }
        Ok(())
    }
}
