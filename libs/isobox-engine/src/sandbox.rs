use crate::error::{SandboxError, SandboxResult};
use crate::isolation::Identity;
use async_trait::async_trait;
use isobox_common::types::{LimitSet, RunResult};
use std::path::{Component, Path, PathBuf};
use tokio::sync::watch;

/// A file to materialize in the box's writable area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxFile {
    /// Relative path; a random name is generated when absent
    pub name: Option<String>,
    pub content: Vec<u8>,
}

/// A primed box as seen by its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoxInfo {
    pub id: String,
    pub root: PathBuf,
    /// Host path of the writable working directory
    pub scratch: PathBuf,
    pub identity: Identity,
    pub slot: usize,
}

/// One process spawn inside a box.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
    pub limits: LimitSet,
    /// Flips to `true` to force-kill the run
    pub cancel: Option<watch::Receiver<bool>>,
}

/// Lifecycle of an isolated box. `run` may be called any number of times
/// between `init` and `cleanup`; `cleanup` is idempotent.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn init(&self, box_id: &str, slot: usize) -> SandboxResult<BoxInfo>;

    /// Bind the runtime's installed files read-only at `/runtime`.
    async fn mount_runtime(&self, box_id: &str, runtime_root: &Path) -> SandboxResult<()>;

    /// Returns the name each file was written under, in input order.
    async fn write_files(&self, box_id: &str, files: &[SandboxFile]) -> SandboxResult<Vec<String>>;

    async fn run(&self, box_id: &str, request: RunRequest) -> SandboxResult<RunResult>;

    async fn cleanup(&self, box_id: &str) -> SandboxResult<()>;
}

/// Box ids become directory and cgroup names.
pub fn validate_box_id(box_id: &str) -> SandboxResult<()> {
    let valid = !box_id.is_empty()
        && box_id.len() <= 64
        && box_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SandboxError::BoxAllocation {
            box_id: box_id.to_string(),
            reason: "invalid box id".to_string(),
        })
    }
}

/// A file name must stay inside the writable area: relative, no `..`,
/// nothing empty.
pub fn validate_file_name(name: &str) -> SandboxResult<PathBuf> {
    let invalid = |reason: &str| SandboxError::InvalidFile {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() || name.contains('\0') {
        return Err(invalid("empty or contains NUL"));
    }
    let path = Path::new(name);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return Err(invalid("absolute paths are not allowed")),
            Component::ParentDir => return Err(invalid("parent directory references are not allowed")),
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(invalid("empty path"));
    }
    Ok(clean)
}

/// Random file name for unnamed inputs, unique within `dir`.
pub fn generate_file_name(dir: &Path) -> String {
    loop {
        let name = uuid::Uuid::new_v4().simple().to_string();
        if !dir.join(&name).exists() {
            return name;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_names() {
        assert_eq!(validate_file_name("main.py").unwrap(), PathBuf::from("main.py"));
        assert_eq!(validate_file_name("./src/lib.rs").unwrap(), PathBuf::from("src/lib.rs"));
        assert!(validate_file_name("").is_err());
        assert!(validate_file_name("/etc/passwd").is_err());
        assert!(validate_file_name("../escape").is_err());
        assert!(validate_file_name("src/../../escape").is_err());
        assert!(validate_file_name(".").is_err());
    }

    #[test]
    fn test_box_ids() {
        validate_box_id("box-3").unwrap();
        assert!(validate_box_id("").is_err());
        assert!(validate_box_id("../box").is_err());
        assert!(validate_box_id("a/b").is_err());
    }

    #[test]
    fn test_generated_names_are_unique() {
        let tmp = tempfile::tempdir().unwrap();
        let a = generate_file_name(tmp.path());
        let b = generate_file_name(tmp.path());
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }
}
