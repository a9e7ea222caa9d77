mod worker;

use anyhow::Context;
use isobox_common::config::EngineConfig;
use isobox_engine::capacity;
use isobox_engine::compile_cache::CompileCache;
use isobox_engine::{Capacity, JobExecutor, LinuxSandbox, LinuxSandboxConfig, PooledSandbox, RuntimeRegistry, Sandbox};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("isobox worker booting...");

    let config = EngineConfig::load().context("failed to load engine config")?;
    let registry = RuntimeRegistry::load(&config.runtimes_manifest)
        .with_context(|| format!("failed to load runtimes from {}", config.runtimes_manifest.display()))?;
    if registry.is_empty() {
        warn!("no runtimes registered, every job will fail");
    }
    let runtimes: Vec<String> = registry.list().iter().map(|r| r.id()).collect();
    info!(?runtimes, "runtimes loaded");

    let linux = LinuxSandbox::new(LinuxSandboxConfig::from(&config));
    linux
        .prepare_host()
        .context("failed to prepare sandbox host (root and cgroup v2 required)")?;
    let reclaimed = linux.reclaim_stale().await;
    if reclaimed > 0 {
        info!(reclaimed, "reclaimed stale boxes");
    }

    let cache = config
        .compile_cache
        .as_ref()
        .map(CompileCache::new)
        .transpose()
        .context("failed to open compile cache")?;

    let client = redis::Client::open(config.redis_url.as_str())?;
    let conn = redis::aio::ConnectionManager::new(client).await?;
    info!(redis_url = %config.redis_url, "connected to Redis");

    let capacity = Capacity::new(config.max_concurrent_jobs, config.host_memory_budget_bytes);
    let registry = Arc::new(registry);

    if config.pool.enabled {
        let pool = Arc::new(PooledSandbox::new(linux));
        for slot in 0..config.max_concurrent_jobs {
            if let Err(e) = pool.prime(&capacity::box_id(slot), slot).await {
                warn!(slot, error = %e, "failed to prime box");
            }
        }
        info!(idle = pool.idle_count(), "box pool primed");
        serve(Arc::clone(&pool), registry, capacity, cache, &config, conn).await;
        pool.drain().await;
    } else {
        serve(Arc::new(linux), registry, capacity, cache, &config, conn).await;
    }

    info!("worker shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Run the worker pool until Ctrl-C, then let in-flight jobs finish.
async fn serve<S: Sandbox + 'static>(
    sandbox: Arc<S>,
    registry: Arc<RuntimeRegistry>,
    capacity: Arc<Capacity>,
    cache: Option<CompileCache>,
    config: &EngineConfig,
    conn: redis::aio::ConnectionManager,
) {
    let mut executor = JobExecutor::new(sandbox, registry, Arc::clone(&capacity), config);
    if let Some(cache) = cache.clone() {
        executor = executor.with_cache(cache);
    }
    let executor = Arc::new(executor);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let workers = config.workers();
    let mut tasks = JoinSet::new();
    for worker_id in 0..workers {
        tasks.spawn(worker::run(
            worker_id,
            Arc::clone(&executor),
            conn.clone(),
            shutdown_rx.clone(),
        ));
    }
    if let Some(cache) = cache {
        let interval = Duration::from_secs(config.compile_cache.as_ref().map_or(300, |c| c.gc_interval_secs));
        tasks.spawn(collect_garbage(cache, interval, shutdown_rx.clone()));
    }
    info!(workers, ceiling = capacity.ceiling(), "worker pool started");

    signal::ctrl_c().await.expect("failed to install CTRL+C signal handler");
    warn!("received shutdown signal, finishing in-flight jobs...");
    let _ = shutdown_tx.send(true);

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "worker task panicked");
        }
    }
    capacity.close();
}

async fn collect_garbage(cache: CompileCache, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => match cache.gc().await {
                Ok(0) => {}
                Ok(evicted) => info!(evicted, dir = %cache.dir().display(), "compile cache collected"),
                Err(e) => warn!(error = %e, "compile cache gc failed"),
            },
            _ = shutdown.changed() => break,
        }
    }
}
