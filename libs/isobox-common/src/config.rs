use crate::types::LimitSet;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config/engine.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Process-wide engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sandbox_root: PathBuf,
    pub cgroup_root: PathBuf,
    pub runtimes_manifest: PathBuf,
    pub redis_url: String,
    /// Admission ceiling: boxes that may be primed at the same time
    pub max_concurrent_jobs: usize,
    pub worker_count: Option<usize>,
    pub host_memory_budget_bytes: u64,
    pub base_uid: u32,
    pub base_gid: u32,
    pub system_mounts: Vec<PathBuf>,
    pub compile_limits: LimitSet,
    pub run_limits: LimitSet,
    pub allow_limit_overrides: bool,
    pub pool: PoolConfig,
    pub compile_cache: Option<CompileCacheConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileCacheConfig {
    pub dir: PathBuf,
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,
}

fn default_cache_entries() -> usize {
    500
}

fn default_gc_interval() -> u64 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sandbox_root: PathBuf::from("/var/lib/isobox/boxes"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup/isobox"),
            runtimes_manifest: PathBuf::from("config/runtimes.json"),
            redis_url: "redis://localhost:6379".to_string(),
            max_concurrent_jobs: 8,
            worker_count: None,
            host_memory_budget_bytes: 8 * 1024 * 1024 * 1024,
            base_uid: 60000,
            base_gid: 60000,
            system_mounts: ["/bin", "/lib", "/lib64", "/usr", "/sbin"]
                .iter()
                .map(PathBuf::from)
                .collect(),
            compile_limits: LimitSet::compile_default(),
            run_limits: LimitSet::run_default(),
            allow_limit_overrides: false,
            pool: PoolConfig::default(),
            compile_cache: None,
        }
    }
}

impl EngineConfig {
    /// Load from `ISOBOX_CONFIG` (or the default path), then apply env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("ISOBOX_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_file(Path::new(&path))?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Missing file means defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("REDIS_URL") {
            self.redis_url = url;
        }
        if let Some(value) = lookup("ISOBOX_WORKERS") {
            let workers = value.parse::<usize>().map_err(|_| ConfigError::InvalidEnv {
                key: "ISOBOX_WORKERS",
                value: value.clone(),
            })?;
            self.worker_count = Some(workers);
        }
        if let Some(dir) = lookup("ISOBOX_SANDBOX_ROOT") {
            self.sandbox_root = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("ISOBOX_CGROUP_ROOT") {
            self.cgroup_root = PathBuf::from(dir);
        }
        if let Some(path) = lookup("ISOBOX_RUNTIMES") {
            self.runtimes_manifest = PathBuf::from(path);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid("max_concurrent_jobs must be at least 1".into()));
        }
        if self.worker_count == Some(0) {
            return Err(ConfigError::Invalid("worker_count must be at least 1".into()));
        }
        for limits in [&self.compile_limits, &self.run_limits] {
            if limits.memory_bytes > self.host_memory_budget_bytes {
                return Err(ConfigError::Invalid(format!(
                    "default memory limit {} exceeds host budget {}",
                    limits.memory_bytes, self.host_memory_budget_bytes
                )));
            }
        }
        if !self.sandbox_root.is_absolute() || !self.cgroup_root.is_absolute() {
            return Err(ConfigError::Invalid("sandbox_root and cgroup_root must be absolute".into()));
        }
        Ok(())
    }

    pub fn workers(&self) -> usize {
        self.worker_count.unwrap_or(self.max_concurrent_jobs)
    }
}
