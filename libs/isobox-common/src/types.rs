use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A normalized execution request, as delivered by the queue layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub language: String,
    #[serde(default)]
    pub version: Option<String>,
    pub files: Vec<FileRequest>,
    #[serde(default)]
    pub testcases: Vec<Testcase>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Stdin for single-run mode (used only when `testcases` is empty)
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub limits: LimitOverrides,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRequest {
    pub name: Option<String>,
    pub content: String,
    #[serde(default)]
    pub encoding: FileEncoding,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEncoding {
    #[default]
    Utf8,
    Base64,
    Hex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Testcase {
    pub id: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub expected_output: Option<ExpectedOutput>,
}

/// One acceptable stdout, or a list where any member is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpectedOutput {
    One(String),
    AnyOf(Vec<String>),
}

impl ExpectedOutput {
    pub fn candidates(&self) -> &[String] {
        match self {
            ExpectedOutput::One(value) => std::slice::from_ref(value),
            ExpectedOutput::AnyOf(values) => values,
        }
    }
}

/// Per-job limit overrides. Unset fields fall back to the process-wide defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitOverrides {
    pub compile_timeout_ms: Option<u64>,
    pub compile_cpu_time_ms: Option<u64>,
    pub compile_memory_limit_bytes: Option<u64>,
    pub run_timeout_ms: Option<u64>,
    pub run_cpu_time_ms: Option<u64>,
    pub run_memory_limit_bytes: Option<u64>,
    /// Network mode for the run stage
    pub network: Option<NetworkMode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    #[default]
    None,
    Full,
    Allowlist(Vec<String>),
}

/// Limits attached to one stage (compile or run).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSet {
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    pub memory_bytes: u64,
    pub max_processes: u64,
    pub max_open_files: u64,
    pub max_output_bytes: u64,
    #[serde(default)]
    pub network: NetworkMode,
}

impl LimitSet {
    pub fn compile_default() -> Self {
        Self {
            wall_time_ms: 10_000,
            cpu_time_ms: 10_000,
            memory_bytes: 512 * 1024 * 1024,
            max_processes: 128,
            max_open_files: 2048,
            max_output_bytes: 64 * 1024,
            network: NetworkMode::None,
        }
    }

    pub fn run_default() -> Self {
        Self {
            wall_time_ms: 3_000,
            cpu_time_ms: 3_000,
            memory_bytes: 256 * 1024 * 1024,
            max_processes: 64,
            max_open_files: 2048,
            max_output_bytes: 64 * 1024,
            network: NetworkMode::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Timeout,
    MemoryExceeded,
    RuntimeError,
    SignalKilled,
    OutputTruncated,
}

/// Record of one process spawn inside a box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    /// stdout and stderr interleaved in arrival order
    pub output: String,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub memory_bytes: u64,
    pub cpu_time_ms: u64,
    pub wall_time_ms: u64,
    pub outcome: RunOutcome,
}

impl RunResult {
    /// Non-zero exit or a limiter kill. Truncated output alone is not a failure.
    pub fn failed(&self) -> bool {
        !matches!(self.outcome, RunOutcome::Success | RunOutcome::OutputTruncated)
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.outcome)?;
        match (&self.exit_code, &self.signal) {
            (Some(code), _) => write!(f, " (exit {})", code)?,
            (None, Some(signal)) => write!(f, " ({})", signal)?,
            (None, None) => {}
        }
        write!(
            f,
            " wall={}ms cpu={}ms mem={}KiB",
            self.wall_time_ms,
            self.cpu_time_ms,
            self.memory_bytes / 1024
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Ready,
    Primed,
    Executing,
    Executed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Executed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Ready => "READY",
            JobState::Primed => "PRIMED",
            JobState::Executing => "EXECUTING",
            JobState::Executed => "EXECUTED",
            JobState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    /// The compile stage failed, so this testcase never ran
    CompileError,
    /// Not started because the job was cancelled or aborted
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestcaseResult {
    pub id: String,
    pub input: String,
    pub expected_output: Option<ExpectedOutput>,
    pub actual_output: String,
    pub passed: bool,
    pub status: TestStatus,
    pub run: Option<RunResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub language: String,
    pub version: String,
    pub state: JobState,
    pub compile: Option<RunResult>,
    /// Single-run mode result (job had no testcases)
    pub run: Option<RunResult>,
    pub testcases: Vec<TestcaseResult>,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl JobResult {
    pub fn passed_count(&self) -> usize {
        self.testcases.iter().filter(|t| t.passed).count()
    }
}
