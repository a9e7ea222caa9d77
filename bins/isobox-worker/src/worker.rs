use isobox_common::redis;
use isobox_common::types::JobRequest;
use isobox_engine::{JobExecutor, Sandbox};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// BLPOP timeout; shutdown is observed between polls.
const POP_TIMEOUT_SECS: f64 = 2.0;
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Pop, execute end to end, publish. One job at a time.
#[instrument(skip(executor, conn, shutdown))]
pub async fn run<S: Sandbox + ?Sized + 'static>(
    worker_id: usize,
    executor: Arc<JobExecutor<S>>,
    mut conn: ::redis::aio::ConnectionManager,
    shutdown: watch::Receiver<bool>,
) {
    info!("worker started");
    while !*shutdown.borrow() {
        match redis::pop_job(&mut conn, POP_TIMEOUT_SECS).await {
            Ok(Some(job)) => process(&executor, &mut conn, job).await,
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    info!("worker stopped");
}

async fn process<S: Sandbox + ?Sized + 'static>(
    executor: &JobExecutor<S>,
    conn: &mut ::redis::aio::ConnectionManager,
    job: JobRequest,
) {
    let job_id = job.id;
    info!(
        job_id = %job_id,
        language = %job.language,
        version = job.version.as_deref().unwrap_or("latest"),
        files = job.files.len(),
        testcases = job.testcases.len(),
        "received job"
    );

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let watcher = tokio::spawn(watch_cancel(conn.clone(), job_id, cancel_tx));
    let result = executor.execute(&job, Some(cancel_rx)).await;
    watcher.abort();

    for testcase in &result.testcases {
        debug!(
            job_id = %job_id,
            testcase = %testcase.id,
            status = ?testcase.status,
            passed = testcase.passed,
            "testcase result"
        );
    }

    match redis::store_result(conn, &result).await {
        Ok(()) => info!(job_id = %job_id, state = %result.state, "result published"),
        Err(e) => error!(job_id = %job_id, error = %e, "failed to publish result"),
    }
}

/// Flip `cancel` once the job's cancel key appears.
async fn watch_cancel(mut conn: ::redis::aio::ConnectionManager, job_id: Uuid, cancel: watch::Sender<bool>) {
    let mut ticker = tokio::time::interval(CANCEL_POLL_INTERVAL);
    loop {
        ticker.tick().await;
        match redis::is_job_cancelled(&mut conn, &job_id).await {
            Ok(true) => {
                info!(job_id = %job_id, "cancellation requested");
                let _ = cancel.send(true);
                return;
            }
            Ok(false) => {}
            Err(e) => warn!(job_id = %job_id, error = %e, "cancel poll failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_cancel_key_flips_watch() {
        let client = ::redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let mut conn = ::redis::aio::ConnectionManager::new(client).await.unwrap();
        let job_id = Uuid::new_v4();

        let (tx, mut rx) = watch::channel(false);
        let watcher = tokio::spawn(watch_cancel(conn.clone(), job_id, tx));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!*rx.borrow());

        redis::cancel_job(&mut conn, &job_id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|v| *v))
            .await
            .unwrap()
            .unwrap();
        watcher.await.unwrap();
    }
}
