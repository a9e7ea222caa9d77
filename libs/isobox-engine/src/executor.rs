//! End-to-end job execution: resolve, admit, prime, run, clean up.

use crate::batch::{BatchCoordinator, BatchPlan};
use crate::capacity::{Admission, Capacity, RetiredSlot};
use crate::compile_cache::CompileCache;
use crate::error::{JobError, SandboxError};
use crate::job::JobStateMachine;
use crate::limits::{self, Stage};
use crate::runtime::{RuntimeRegistry, RuntimeSpec};
use crate::sandbox::{BoxInfo, Sandbox, SandboxFile};
use base64::Engine as _;
use chrono::Utc;
use isobox_common::config::EngineConfig;
use isobox_common::types::{FileEncoding, JobRequest, JobResult, JobState, LimitSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

const RECLAIM_BACKOFF: Duration = Duration::from_secs(1);
const RECLAIM_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Turn request files into bytes. The first file is the entry file; a
/// runtime with a fixed default filename gets it when the file is unnamed.
pub fn decode_files(job: &JobRequest, runtime: &RuntimeSpec) -> Result<Vec<SandboxFile>, SandboxError> {
    job.files
        .iter()
        .enumerate()
        .map(|(index, file)| {
            let label = file.name.clone().unwrap_or_else(|| format!("file #{}", index));
            let content = match file.encoding {
                FileEncoding::Utf8 => file.content.as_bytes().to_vec(),
                FileEncoding::Base64 => base64::engine::general_purpose::STANDARD
                    .decode(file.content.trim())
                    .map_err(|e| SandboxError::InvalidFile {
                        name: label.clone(),
                        reason: format!("invalid base64: {}", e),
                    })?,
                FileEncoding::Hex => hex::decode(file.content.trim()).map_err(|e| SandboxError::InvalidFile {
                    name: label.clone(),
                    reason: format!("invalid hex: {}", e),
                })?,
            };
            let name = match (&file.name, runtime.default_file()) {
                (Some(name), _) => Some(name.clone()),
                (None, Some(default)) if index == 0 => Some(default.to_string()),
                (None, _) => None,
            };
            Ok(SandboxFile { name, content })
        })
        .collect()
}

pub struct JobExecutor<S: ?Sized> {
    sandbox: Arc<S>,
    registry: Arc<RuntimeRegistry>,
    capacity: Arc<Capacity>,
    compile_limits: LimitSet,
    run_limits: LimitSet,
    allow_limit_overrides: bool,
    cache: Option<CompileCache>,
}

/// Limits and runtime resolved before a job may queue for admission.
struct Prepared<'a> {
    runtime: &'a RuntimeSpec,
    compile_limits: LimitSet,
    run_limits: LimitSet,
    files: Vec<SandboxFile>,
}

impl<S: Sandbox + ?Sized + 'static> JobExecutor<S> {
    pub fn new(sandbox: Arc<S>, registry: Arc<RuntimeRegistry>, capacity: Arc<Capacity>, config: &EngineConfig) -> Self {
        Self {
            sandbox,
            registry,
            capacity,
            compile_limits: config.compile_limits.clone(),
            run_limits: config.run_limits.clone(),
            allow_limit_overrides: config.allow_limit_overrides,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: CompileCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn capacity(&self) -> &Arc<Capacity> {
        &self.capacity
    }

    /// Run a job to a terminal state. Never fails: every error ends up in
    /// the result as a FAILED job with its reason.
    #[tracing::instrument(skip_all, fields(job_id = %job.id, language = %job.language))]
    pub async fn execute(&self, job: &JobRequest, cancel: Option<watch::Receiver<bool>>) -> JobResult {
        let started = Instant::now();
        let mut machine = JobStateMachine::new(job.id);
        let mut result = JobResult {
            job_id: job.id,
            language: job.language.clone(),
            version: job.version.clone().unwrap_or_default(),
            state: JobState::Ready,
            compile: None,
            run: None,
            testcases: Vec::new(),
            error: None,
            completed_at: Utc::now(),
        };

        if let Err(e) = self.drive(job, cancel, &mut machine, &mut result).await {
            tracing::warn!(state = %machine.state(), error = %e, "job failed");
            machine.fail();
            result.error = Some(e.to_string());
        }

        result.state = machine.state();
        result.completed_at = Utc::now();
        tracing::info!(
            state = %result.state,
            passed = result.passed_count(),
            total = result.testcases.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "job finished"
        );
        tracing::debug!(history = ?machine.history(), "job state history");
        result
    }

    fn prepare<'a>(&'a self, job: &JobRequest) -> Result<Prepared<'a>, JobError> {
        let runtime = self
            .registry
            .resolve(&job.language, job.version.as_deref())
            .ok_or_else(|| JobError::UnknownRuntime {
                language: job.language.clone(),
                version: job.version.clone().unwrap_or_else(|| "latest".to_string()),
            })?;

        let compile_limits = limits::resolve(
            &self.compile_limits,
            Stage::Compile,
            &job.limits,
            self.allow_limit_overrides,
        );
        let run_limits = limits::resolve(&self.run_limits, Stage::Run, &job.limits, self.allow_limit_overrides);
        limits::validate(&compile_limits)?;
        limits::validate(&run_limits)?;

        let files = decode_files(job, runtime)?;
        Ok(Prepared {
            runtime,
            compile_limits,
            run_limits,
            files,
        })
    }

    async fn admit(&self, memory: u64, cancel: &mut Option<watch::Receiver<bool>>) -> Result<Admission, JobError> {
        let Some(rx) = cancel.as_mut() else {
            return Ok(self.capacity.admit(memory).await?);
        };
        tokio::select! {
            admission = self.capacity.admit(memory) => Ok(admission?),
            Ok(_) = rx.wait_for(|v| *v) => Err(JobError::Cancelled),
        }
    }

    async fn drive(
        &self,
        job: &JobRequest,
        mut cancel: Option<watch::Receiver<bool>>,
        machine: &mut JobStateMachine,
        result: &mut JobResult,
    ) -> Result<(), JobError> {
        let prepared = self.prepare(job)?;
        result.language = prepared.runtime.language.clone();
        result.version = prepared.runtime.version.clone();

        let memory = if prepared.runtime.compile.is_some() {
            prepared.compile_limits.memory_bytes.max(prepared.run_limits.memory_bytes)
        } else {
            prepared.run_limits.memory_bytes
        };
        let admission = self.admit(memory, &mut cancel).await?;
        let box_id = admission.box_id.clone();
        tracing::debug!(%box_id, slot = admission.slot, "admitted");

        let outcome = match self.prime(&admission, &prepared).await {
            Ok((info, file_names)) => {
                let started = machine
                    .transition(JobState::Primed)
                    .and_then(|()| machine.transition(JobState::Executing));
                match started {
                    Ok(()) => {
                        self.run_batch(job, &prepared, &info, file_names, cancel, machine, result)
                            .await
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(JobError::Setup(e)),
        };

        self.release(admission).await;
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_batch(
        &self,
        job: &JobRequest,
        prepared: &Prepared<'_>,
        info: &BoxInfo,
        file_names: Vec<String>,
        cancel: Option<watch::Receiver<bool>>,
        machine: &mut JobStateMachine,
        result: &mut JobResult,
    ) -> Result<(), JobError> {
        let cache_key = self.cache.as_ref().and(prepared.runtime.compile.as_ref()).map(|_| {
            let keyed: Vec<(String, Vec<u8>)> = file_names
                .iter()
                .cloned()
                .zip(prepared.files.iter().map(|f| f.content.clone()))
                .collect();
            CompileCache::key(prepared.runtime, &keyed)
        });
        let plan = BatchPlan {
            box_info: info,
            runtime: prepared.runtime,
            file_names,
            args: &job.args,
            stdin: job.stdin.as_deref(),
            testcases: &job.testcases,
            compile_limits: prepared.compile_limits.clone(),
            run_limits: prepared.run_limits.clone(),
            cancel,
            cache_key,
        };
        let batch = BatchCoordinator::new(self.sandbox.as_ref(), self.cache.as_ref())
            .execute(plan)
            .await;

        result.compile = batch.compile;
        result.run = batch.run;
        result.testcases = batch.testcases;
        match batch.error {
            Some(e) => Err(e),
            None => machine.transition(JobState::Executed),
        }
    }

    async fn prime(&self, admission: &Admission, prepared: &Prepared<'_>) -> Result<(BoxInfo, Vec<String>), SandboxError> {
        let box_id = admission.box_id.as_str();
        let info = self.sandbox.init(box_id, admission.slot).await?;
        self.sandbox.mount_runtime(box_id, &prepared.runtime.root).await?;
        let names = self.sandbox.write_files(box_id, &prepared.files).await?;
        Ok((info, names))
    }

    /// Cleanup errors never reach the caller. A box that cannot be torn
    /// down takes its slot out of circulation until a retry succeeds.
    async fn release(&self, admission: Admission) {
        match self.sandbox.cleanup(&admission.box_id).await {
            Ok(()) => drop(admission),
            Err(e) => {
                tracing::warn!(box_id = %admission.box_id, error = %e, "cleanup failed");
                let retired = admission.retire();
                tokio::spawn(reclaim(Arc::clone(&self.sandbox), retired));
            }
        }
    }
}

/// Retry teardown of a retired box with backoff; success reinstates its slot.
async fn reclaim<S: Sandbox + ?Sized>(sandbox: Arc<S>, retired: RetiredSlot) {
    let mut delay = RECLAIM_BACKOFF;
    loop {
        tokio::time::sleep(delay).await;
        if retired.is_closed() {
            tracing::debug!(box_id = %retired.box_id, "capacity closed, giving up on retired box");
            return;
        }
        match sandbox.cleanup(&retired.box_id).await {
            Ok(()) => {
                retired.reinstate();
                return;
            }
            Err(e) => {
                delay = (delay * 2).min(RECLAIM_BACKOFF_MAX);
                tracing::warn!(
                    box_id = %retired.box_id,
                    error = %e,
                    retry_in_secs = delay.as_secs(),
                    "retired box still not torn down"
                );
            }
        }
    }
}
