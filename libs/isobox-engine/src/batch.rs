//! Compile once, run every testcase against the same primed box.

use crate::compile_cache::CompileCache;
use crate::error::JobError;
use crate::evaluator;
use crate::runtime::RuntimeSpec;
use crate::sandbox::{BoxInfo, RunRequest, Sandbox};
use isobox_common::types::{LimitSet, RunOutcome, RunResult, Testcase, TestcaseResult};
use tokio::sync::watch;

/// Everything needed to drive one primed box through its stages.
pub struct BatchPlan<'a> {
    pub box_info: &'a BoxInfo,
    pub runtime: &'a RuntimeSpec,
    /// Names the files were written under, in submission order
    pub file_names: Vec<String>,
    pub args: &'a [String],
    /// Single-run mode input
    pub stdin: Option<&'a str>,
    pub testcases: &'a [Testcase],
    pub compile_limits: LimitSet,
    pub run_limits: LimitSet,
    pub cancel: Option<watch::Receiver<bool>>,
    /// Set when the compile cache may serve this job
    pub cache_key: Option<String>,
}

impl BatchPlan<'_> {
    fn main_file(&self) -> &str {
        self.file_names.first().map(String::as_str).unwrap_or_default()
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    fn request(&self, command: &str, args: Vec<String>, stdin: Option<&str>, limits: &LimitSet) -> RunRequest {
        RunRequest {
            command: command.to_string(),
            args,
            env: self.runtime.env(),
            stdin: stdin.map(|s| s.as_bytes().to_vec()),
            limits: limits.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub compile: Option<RunResult>,
    pub run: Option<RunResult>,
    /// One entry per testcase, in submission order
    pub testcases: Vec<TestcaseResult>,
    /// Set when the job must end FAILED; results gathered so far are kept
    pub error: Option<JobError>,
}

impl BatchOutcome {
    pub fn compile_failed(&self) -> bool {
        self.compile.as_ref().map(RunResult::failed).unwrap_or(false)
    }
}

pub struct BatchCoordinator<'a, S: Sandbox + ?Sized> {
    sandbox: &'a S,
    cache: Option<&'a CompileCache>,
}

impl<'a, S: Sandbox + ?Sized> BatchCoordinator<'a, S> {
    pub fn new(sandbox: &'a S, cache: Option<&'a CompileCache>) -> Self {
        Self { sandbox, cache }
    }

    pub async fn execute(&self, plan: BatchPlan<'_>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let box_id = plan.box_info.id.as_str();

        if plan.cancelled() {
            outcome.error = Some(JobError::Cancelled);
            outcome.testcases = plan.testcases.iter().map(evaluator::skipped).collect();
            return outcome;
        }

        if let Some(compile) = plan.runtime.compile.as_deref() {
            match self.compile(&plan, compile).await {
                Ok(result) => outcome.compile = Some(result),
                Err(e) => {
                    outcome.error = Some(e);
                    outcome.testcases = plan.testcases.iter().map(evaluator::skipped).collect();
                    return outcome;
                }
            }
            if outcome.compile_failed() {
                tracing::info!(box_id, "compile failed, skipping testcases");
                outcome.testcases = plan.testcases.iter().map(evaluator::compile_failed).collect();
                if plan.cancelled() {
                    outcome.error = Some(JobError::Cancelled);
                }
                return outcome;
            }
        }

        if plan.testcases.is_empty() {
            let args = plan.runtime.run_args(plan.main_file(), plan.args);
            let request = plan.request(&plan.runtime.run, args, plan.stdin, &plan.run_limits);
            match self.sandbox.run(box_id, request).await {
                Ok(result) => outcome.run = Some(result),
                Err(e) => outcome.error = Some(JobError::Setup(e)),
            }
            if outcome.error.is_none() && plan.cancelled() {
                outcome.error = Some(JobError::Cancelled);
            }
            return outcome;
        }

        for (index, testcase) in plan.testcases.iter().enumerate() {
            if plan.cancelled() {
                outcome.error = Some(JobError::Cancelled);
            }
            if outcome.error.is_some() {
                outcome
                    .testcases
                    .extend(plan.testcases[index..].iter().map(evaluator::skipped));
                break;
            }

            let args = plan.runtime.run_args(plan.main_file(), plan.args);
            let request = plan.request(&plan.runtime.run, args, Some(testcase.input.as_str()), &plan.run_limits);
            match self.sandbox.run(box_id, request).await {
                Ok(result) => {
                    let evaluated = evaluator::evaluate_testcase(testcase, result);
                    tracing::debug!(
                        box_id,
                        testcase = %testcase.id,
                        passed = evaluated.passed,
                        "testcase evaluated"
                    );
                    outcome.testcases.push(evaluated);
                }
                Err(e) => {
                    tracing::warn!(box_id, testcase = %testcase.id, error = %e, "run failed");
                    outcome.error = Some(JobError::Setup(e));
                    outcome.testcases.push(evaluator::skipped(testcase));
                }
            }
        }
        if outcome.error.is_none() && plan.cancelled() {
            outcome.error = Some(JobError::Cancelled);
        }
        outcome
    }

    /// Restore from the cache when possible, otherwise invoke the compile
    /// entry point and cache a successful result.
    async fn compile(&self, plan: &BatchPlan<'_>, entry: &str) -> Result<RunResult, JobError> {
        let box_info = plan.box_info;
        let cache = self.cache.zip(plan.cache_key.as_deref());

        if let Some((cache, key)) = cache {
            match cache.restore(key, &box_info.scratch, box_info.identity).await {
                Ok(true) => {
                    tracing::info!(box_id = %box_info.id, key, "compile restored from cache");
                    return Ok(cached_compile());
                }
                Ok(false) => {}
                Err(e) => tracing::warn!(box_id = %box_info.id, error = %e, "cache restore failed"),
            }
        }

        let args = plan.runtime.compile_args(&plan.file_names);
        let request = plan.request(entry, args, None, &plan.compile_limits);
        let result = self.sandbox.run(&box_info.id, request).await?;

        if let Some((cache, key)) = cache {
            if !result.failed() {
                if let Err(e) = cache.store(key, &box_info.scratch).await {
                    tracing::warn!(box_id = %box_info.id, error = %e, "cache store failed");
                }
            }
        }
        Ok(result)
    }
}

fn cached_compile() -> RunResult {
    RunResult {
        stdout: String::new(),
        stderr: String::new(),
        output: String::new(),
        exit_code: Some(0),
        signal: None,
        memory_bytes: 0,
        cpu_time_ms: 0,
        wall_time_ms: 0,
        outcome: RunOutcome::Success,
    }
}
