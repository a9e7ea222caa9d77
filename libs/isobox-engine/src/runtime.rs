//! Runtime registry: what the package layer installed, and how to invoke it.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// PATH inside every box.
pub const BOX_PATH: &str = "/runtime/bin:/usr/local/bin:/usr/bin:/bin";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read runtime manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse runtime manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("duplicate runtime {0}")]
    Duplicate(String),
}

/// How entry points receive the submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Invocation {
    /// Compile gets every file name, run gets the main file then job args
    SourceArgument,
    /// The main file is written under a fixed name the entry points expect
    DefaultFile { name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSpec {
    pub language: String,
    pub version: String,
    /// Host directory bound read-only at /runtime
    pub root: PathBuf,
    pub run: String,
    #[serde(default)]
    pub compile: Option<String>,
    pub invocation: Invocation,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl RuntimeSpec {
    pub fn id(&self) -> String {
        format!("{}-{}", self.language, self.version)
    }

    pub fn default_file(&self) -> Option<&str> {
        match &self.invocation {
            Invocation::DefaultFile { name } => Some(name),
            Invocation::SourceArgument => None,
        }
    }

    pub fn compile_args(&self, file_names: &[String]) -> Vec<String> {
        match self.invocation {
            Invocation::SourceArgument => file_names.to_vec(),
            Invocation::DefaultFile { .. } => Vec::new(),
        }
    }

    pub fn run_args(&self, main_file: &str, job_args: &[String]) -> Vec<String> {
        match self.invocation {
            Invocation::SourceArgument => std::iter::once(main_file.to_string())
                .chain(job_args.iter().cloned())
                .collect(),
            Invocation::DefaultFile { .. } => job_args.to_vec(),
        }
    }

    /// Environment of every process this runtime spawns.
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env: BTreeMap<String, String> = [
            ("PATH", BOX_PATH),
            ("HOME", "/submission"),
            ("TMPDIR", "/tmp"),
            ("LANG", "C.UTF-8"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        env.extend(self.env.clone());
        env.into_iter().collect()
    }

    fn answers_to(&self, language: &str) -> bool {
        self.language.eq_ignore_ascii_case(language) || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(language))
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    runtimes: Vec<RuntimeSpec>,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeRegistry {
    runtimes: Vec<RuntimeSpec>,
}

impl RuntimeRegistry {
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let content = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest: Manifest = serde_json::from_str(&content).map_err(|source| RegistryError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_specs(manifest.runtimes)
    }

    pub fn from_specs(runtimes: Vec<RuntimeSpec>) -> Result<Self, RegistryError> {
        let mut seen = std::collections::HashSet::new();
        for runtime in &runtimes {
            if !seen.insert(runtime.id()) {
                return Err(RegistryError::Duplicate(runtime.id()));
            }
        }
        Ok(Self { runtimes })
    }

    /// `None` or `"latest"` picks the highest registered version.
    pub fn resolve(&self, language: &str, version: Option<&str>) -> Option<&RuntimeSpec> {
        let candidates = self.runtimes.iter().filter(|r| r.answers_to(language));
        match version {
            None | Some("latest") => candidates.max_by(|a, b| compare_versions(&a.version, &b.version)),
            Some(wanted) => candidates.into_iter().find(|r| r.version == wanted),
        }
    }

    /// Sorted by language, newest version first.
    pub fn list(&self) -> Vec<&RuntimeSpec> {
        let mut all: Vec<&RuntimeSpec> = self.runtimes.iter().collect();
        all.sort_by(|a, b| {
            a.language
                .cmp(&b.language)
                .then_with(|| compare_versions(&b.version, &a.version))
        });
        all
    }

    pub fn is_empty(&self) -> bool {
        self.runtimes.is_empty()
    }
}

/// Dot-separated versions compared component-wise, numerically when both
/// components are numbers.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(language: &str, version: &str) -> RuntimeSpec {
        RuntimeSpec {
            language: language.to_string(),
            version: version.to_string(),
            root: PathBuf::from(format!("/opt/runtimes/{}-{}", language, version)),
            run: "/runtime/bin/run".to_string(),
            compile: None,
            invocation: Invocation::SourceArgument,
            env: BTreeMap::new(),
            aliases: vec![],
        }
    }

    #[test]
    fn test_latest_is_numeric_max() {
        let registry =
            RuntimeRegistry::from_specs(vec![spec("python", "3.9.1"), spec("python", "3.12.0"), spec("python", "3.10.4")])
                .unwrap();
        assert_eq!(registry.resolve("python", None).unwrap().version, "3.12.0");
        assert_eq!(registry.resolve("python", Some("latest")).unwrap().version, "3.12.0");
        assert_eq!(registry.resolve("python", Some("3.9.1")).unwrap().version, "3.9.1");
        assert!(registry.resolve("python", Some("2.7")).is_none());
        assert!(registry.resolve("ruby", None).is_none());
    }

    #[test]
    fn test_aliases() {
        let mut py = spec("python", "3.12.0");
        py.aliases = vec!["py".to_string(), "python3".to_string()];
        let registry = RuntimeRegistry::from_specs(vec![py]).unwrap();
        assert!(registry.resolve("PY", None).is_some());
        assert!(registry.resolve("python3", None).is_some());
    }

    #[test]
    fn test_duplicates_rejected() {
        let err = RuntimeRegistry::from_specs(vec![spec("go", "1.22"), spec("go", "1.22")]).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(_)));
    }

    #[test]
    fn test_invocation_conventions() {
        let files = vec!["main.c".to_string(), "util.c".to_string()];
        let args = vec!["-v".to_string()];

        let source = spec("c", "13");
        assert_eq!(source.compile_args(&files), files);
        assert_eq!(source.run_args("main.c", &args), vec!["main.c", "-v"]);

        let mut java = spec("java", "21");
        java.invocation = Invocation::DefaultFile {
            name: "Main.java".to_string(),
        };
        assert!(java.compile_args(&files).is_empty());
        assert_eq!(java.run_args("Main.java", &args), vec!["-v"]);
        assert_eq!(java.default_file(), Some("Main.java"));
    }

    #[test]
    fn test_env_overrides_base() {
        let mut rt = spec("node", "20.11.0");
        rt.env.insert("NODE_OPTIONS".into(), "--max-old-space-size=256".into());
        rt.env.insert("HOME".into(), "/tmp".into());
        let env: BTreeMap<_, _> = rt.env().into_iter().collect();
        assert_eq!(env["PATH"], BOX_PATH);
        assert_eq!(env["HOME"], "/tmp");
        assert_eq!(env["NODE_OPTIONS"], "--max-old-space-size=256");
    }

    #[test]
    fn test_load_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtimes.json");
        std::fs::write(
            &path,
            r#"{"runtimes": [
                {"language": "java", "version": "21.0.2", "root": "/opt/rt/java", "run": "/runtime/bin/run",
                 "compile": "/runtime/bin/compile", "invocation": {"default_file": {"name": "Main.java"}}},
                {"language": "python", "version": "3.12.1", "root": "/opt/rt/python", "run": "/runtime/bin/run",
                 "invocation": "source_argument", "aliases": ["py"]}
            ]}"#,
        )
        .unwrap();

        let registry = RuntimeRegistry::load(&path).unwrap();
        let listed: Vec<String> = registry.list().iter().map(|r| r.id()).collect();
        assert_eq!(listed, vec!["java-21.0.2", "python-3.12.1"]);
        assert!(registry.resolve("java", None).unwrap().compile.is_some());
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Less);
        assert_eq!(compare_versions("2", "2"), Ordering::Equal);
    }

    #[test]
    fn test_shipped_manifest_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/runtimes.json");
        let registry = RuntimeRegistry::load(&path).unwrap();
        assert_eq!(registry.resolve("py", None).unwrap().language, "python");
        assert_eq!(registry.resolve("java", None).unwrap().default_file(), Some("Main.java"));
    }
}
