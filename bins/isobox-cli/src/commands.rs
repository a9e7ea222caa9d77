// CLI commands for running and managing isobox jobs
use anyhow::{bail, Context, Result};
use isobox_common::config::EngineConfig;
use isobox_common::redis;
use isobox_common::types::{JobRequest, JobResult};
use isobox_engine::compile_cache::CompileCache;
use isobox_engine::sandbox::validate_box_id;
use isobox_engine::{Capacity, JobExecutor, LinuxSandbox, LinuxSandboxConfig, RuntimeRegistry, Sandbox};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

fn load_job(path: &Path) -> Result<JobRequest> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse job request {}", path.display()))
}

fn parse_job_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("'{}' is not a job id", raw))
}

fn load_config() -> Result<EngineConfig> {
    EngineConfig::load().context("Failed to load engine config")
}

async fn connect(config: &EngineConfig) -> Result<::redis::aio::ConnectionManager> {
    let client = ::redis::Client::open(config.redis_url.as_str())?;
    ::redis::aio::ConnectionManager::new(client)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))
}

fn print_result(result: &JobResult, pretty: bool) -> Result<()> {
    let json = if pretty {
        serde_json::to_string_pretty(result)?
    } else {
        serde_json::to_string(result)?
    };
    println!("{}", json);
    Ok(())
}

/// Run a job on this host with a single box slot. Ctrl-C cancels it.
pub async fn run_local(path: &Path, pretty: bool) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let job = load_job(path)?;
    let config = load_config()?;
    let registry = RuntimeRegistry::load(&config.runtimes_manifest)?;
    let sandbox = LinuxSandbox::new(LinuxSandboxConfig::from(&config));
    sandbox
        .prepare_host()
        .context("Failed to prepare sandbox host (run as root on a cgroup v2 host)")?;

    let capacity = Capacity::new(1, config.host_memory_budget_bytes);
    let mut executor = JobExecutor::new(Arc::new(sandbox), Arc::new(registry), capacity, &config);
    if let Some(cache) = &config.compile_cache {
        executor = executor.with_cache(CompileCache::new(cache)?);
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("⚠️  Cancelling...");
            let _ = cancel_tx.send(true);
        }
    });

    let result = executor.execute(&job, Some(cancel_rx)).await;
    print_result(&result, pretty)
}

pub async fn submit(path: &Path) -> Result<()> {
    let job = load_job(path)?;
    let config = load_config()?;
    let mut conn = connect(&config).await?;

    redis::push_job(&mut conn, &job).await.context("Failed to enqueue job")?;
    println!("✅ Submitted job {}", job.id);
    println!("\n💡 Fetch the result with: isobox result {} --wait", job.id);
    Ok(())
}

pub async fn fetch_result(raw_id: &str, wait: bool, timeout_secs: u64) -> Result<()> {
    let job_id = parse_job_id(raw_id)?;
    let config = load_config()?;
    let mut conn = connect(&config).await?;
    let deadline = Instant::now() + Duration::from_secs(timeout_secs);

    loop {
        if let Some(result) = redis::get_result(&mut conn, &job_id).await? {
            return print_result(&result, true);
        }
        let status = redis::get_status(&mut conn, &job_id).await?;
        if !wait {
            match status {
                Some(state) => println!("⏳ Job {} is {}", job_id, state),
                None => println!("❌ Unknown job {}", job_id),
            }
            return Ok(());
        }
        if status.is_none() {
            bail!("Unknown job {}", job_id);
        }
        if Instant::now() >= deadline {
            bail!("Timed out after {}s waiting for job {}", timeout_secs, job_id);
        }
        tokio::time::sleep(RESULT_POLL_INTERVAL).await;
    }
}

pub async fn cancel(raw_id: &str) -> Result<()> {
    let job_id = parse_job_id(raw_id)?;
    let config = load_config()?;
    let mut conn = connect(&config).await?;

    redis::cancel_job(&mut conn, &job_id).await?;
    println!("🛑 Cancellation requested for job {}", job_id);
    Ok(())
}

#[derive(Serialize)]
struct RuntimeRow<'a> {
    language: &'a str,
    version: &'a str,
    compiled: bool,
    aliases: &'a [String],
}

pub fn list_runtimes(json: bool) -> Result<()> {
    let config = load_config()?;
    let registry = RuntimeRegistry::load(&config.runtimes_manifest)?;
    let rows: Vec<RuntimeRow> = registry
        .list()
        .into_iter()
        .map(|r| RuntimeRow {
            language: &r.language,
            version: &r.version,
            compiled: r.compile.is_some(),
            aliases: &r.aliases,
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No runtimes registered in {}", config.runtimes_manifest.display());
        return Ok(());
    }

    println!("📋 Registered Runtimes:\n");
    println!("{:<12} {:<12} {:<10} {:<20}", "Language", "Version", "Compiled", "Aliases");
    println!("{}", "─".repeat(56));
    for row in &rows {
        println!(
            "{:<12} {:<12} {:<10} {:<20}",
            row.language,
            row.version,
            if row.compiled { "yes" } else { "no" },
            row.aliases.join(", ")
        );
    }
    println!("\n✅ Total: {} runtime(s)", rows.len());
    Ok(())
}

pub async fn cleanup(box_ids: &[String], all: bool) -> Result<()> {
    let config = load_config()?;
    let sandbox = LinuxSandbox::new(LinuxSandboxConfig::from(&config));

    if all {
        let reclaimed = sandbox.reclaim_stale().await;
        println!("🗑️  Reclaimed {} box(es)", reclaimed);
        return Ok(());
    }
    if box_ids.is_empty() {
        bail!("Name at least one box id, or pass --all");
    }

    let mut failed = 0;
    for box_id in box_ids {
        validate_box_id(box_id)?;
        match sandbox.cleanup(box_id).await {
            Ok(()) => println!("🗑️  Removed {}", box_id),
            Err(e) => {
                failed += 1;
                println!("❌ {}: {}", box_id, e);
            }
        }
    }
    if failed > 0 {
        bail!("{} box(es) could not be removed", failed);
    }
    Ok(())
}
