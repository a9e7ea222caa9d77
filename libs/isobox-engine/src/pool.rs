use crate::error::SandboxResult;
use crate::sandbox::{BoxInfo, RunRequest, Sandbox, SandboxFile};
use async_trait::async_trait;
use isobox_common::types::RunResult;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Keeps boxes initialized ahead of demand. A box is either idle here or
/// checked out by exactly one owner. Releasing a box always tears it down and
/// builds a fresh one, so nothing from the previous job survives.
pub struct PooledSandbox<S> {
    inner: S,
    idle: Mutex<HashMap<String, BoxInfo>>,
    checked_out: Mutex<HashMap<String, usize>>,
    draining: AtomicBool,
}

impl<S: Sandbox> PooledSandbox<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            idle: Mutex::new(HashMap::new()),
            checked_out: Mutex::new(HashMap::new()),
            draining: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn idle(&self) -> std::sync::MutexGuard<'_, HashMap<String, BoxInfo>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn checked_out(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        self.checked_out.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn idle_count(&self) -> usize {
        self.idle().len()
    }

    /// Initialize `box_id` and park it as idle.
    pub async fn prime(&self, box_id: &str, slot: usize) -> SandboxResult<()> {
        let info = self.inner.init(box_id, slot).await?;
        self.idle().insert(box_id.to_string(), info);
        tracing::debug!(box_id, "box primed");
        Ok(())
    }

    /// Tear down every idle box and stop re-priming.
    pub async fn drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
        let ids: Vec<String> = self.idle().drain().map(|(id, _)| id).collect();
        for id in ids {
            if let Err(e) = self.inner.cleanup(&id).await {
                tracing::warn!(box_id = %id, error = %e, "failed to drain pooled box");
            }
        }
    }
}

#[async_trait]
impl<S: Sandbox> Sandbox for PooledSandbox<S> {
    async fn init(&self, box_id: &str, slot: usize) -> SandboxResult<BoxInfo> {
        let primed = self.idle().remove(box_id);
        let info = match primed {
            Some(info) => info,
            None => self.inner.init(box_id, slot).await?,
        };
        self.checked_out().insert(box_id.to_string(), slot);
        Ok(info)
    }

    async fn mount_runtime(&self, box_id: &str, runtime_root: &Path) -> SandboxResult<()> {
        self.inner.mount_runtime(box_id, runtime_root).await
    }

    async fn write_files(&self, box_id: &str, files: &[SandboxFile]) -> SandboxResult<Vec<String>> {
        self.inner.write_files(box_id, files).await
    }

    async fn run(&self, box_id: &str, request: RunRequest) -> SandboxResult<RunResult> {
        self.inner.run(box_id, request).await
    }

    async fn cleanup(&self, box_id: &str) -> SandboxResult<()> {
        self.idle().remove(box_id);
        let slot = self.checked_out().remove(box_id);
        self.inner.cleanup(box_id).await?;

        if let Some(slot) = slot {
            if !self.draining.load(Ordering::SeqCst) {
                if let Err(e) = self.prime(box_id, slot).await {
                    tracing::warn!(box_id, error = %e, "failed to re-prime box");
                }
            }
        }
        Ok(())
    }
}
