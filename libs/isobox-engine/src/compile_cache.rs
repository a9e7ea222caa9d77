//! Content-addressed store of compiled scratch areas.
//!
//! Layout: `<dir>/<key>/files/...` holds the scratch area as it was after a
//! successful compile, `<dir>/<key>/last_used` holds the last hit time.
//! Cached files are root owned and read-only; restore hard links them so a
//! box can replace them but never write through to the cache.

use crate::isolation::Identity;
use crate::runtime::RuntimeSpec;
use isobox_common::config::CompileCacheConfig;
use sha2::{Digest, Sha256};
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const FILES: &str = "files";
const LAST_USED: &str = "last_used";
const TMP_PREFIX: &str = ".tmp-";
/// Interrupted stores older than this are swept by GC.
const STALE_TMP: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct CompileCache {
    dir: PathBuf,
    max_entries: usize,
}

impl CompileCache {
    pub fn new(config: &CompileCacheConfig) -> io::Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        Ok(Self {
            dir: config.dir.clone(),
            max_entries: config.max_entries,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Hex SHA-256 over everything that determines compile output: the
    /// runtime, its compile entry point (and that script's bytes when the
    /// host can read it) and the submitted files sorted by name.
    pub fn key(runtime: &RuntimeSpec, files: &[(String, Vec<u8>)]) -> String {
        let mut hasher = Sha256::new();
        let mut field = |bytes: &[u8]| {
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        };

        field(runtime.language.as_bytes());
        field(runtime.version.as_bytes());
        let compile = runtime.compile.as_deref().unwrap_or_default();
        field(compile.as_bytes());
        if let Some(script) = host_entry_point(runtime, compile) {
            if let Ok(content) = std::fs::read(script) {
                field(&content);
            }
        }

        let mut sorted: Vec<&(String, Vec<u8>)> = files.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, content) in sorted {
            field(name.as_bytes());
            field(content);
        }

        hex::encode(hasher.finalize())
    }

    fn entry(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// Populate `scratch` from the entry for `key`. Returns false on a miss.
    pub async fn restore(&self, key: &str, scratch: &Path, identity: Identity) -> io::Result<bool> {
        let entry = self.entry(key);
        let scratch = scratch.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let files = entry.join(FILES);
            if !files.is_dir() {
                return Ok(false);
            }
            link_tree(&files, &scratch, identity)?;
            touch(&entry)?;
            Ok(true)
        })
        .await
        .map_err(io::Error::other)?
    }

    /// Copy `scratch` into the cache under `key`. A concurrent store of the
    /// same key wins; ours is discarded.
    pub async fn store(&self, key: &str, scratch: &Path) -> io::Result<()> {
        let entry = self.entry(key);
        let tmp = self
            .dir
            .join(format!("{}{}", TMP_PREFIX, uuid::Uuid::new_v4().simple()));
        let scratch = scratch.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let result = copy_tree(&scratch, &tmp.join(FILES)).and_then(|_| touch(&tmp));
            if let Err(e) = result {
                let _ = std::fs::remove_dir_all(&tmp);
                return Err(e);
            }
            if std::fs::rename(&tmp, &entry).is_err() {
                std::fs::remove_dir_all(&tmp)?;
            }
            Ok(())
        })
        .await
        .map_err(io::Error::other)?
    }

    /// Keep the `max_entries` most recently used entries. Returns how many
    /// were evicted.
    pub async fn gc(&self) -> io::Result<usize> {
        let dir = self.dir.clone();
        let max_entries = self.max_entries;
        tokio::task::spawn_blocking(move || {
            let mut entries = Vec::new();
            for item in std::fs::read_dir(&dir)? {
                let item = item?;
                let path = item.path();
                let name = item.file_name().to_string_lossy().into_owned();
                if name.starts_with(TMP_PREFIX) {
                    let stale = item
                        .metadata()
                        .and_then(|m| m.modified())
                        .map(|t| t.elapsed().unwrap_or_default() > STALE_TMP)
                        .unwrap_or(true);
                    if stale {
                        let _ = std::fs::remove_dir_all(&path);
                    }
                    continue;
                }
                if !item.file_type()?.is_dir() {
                    continue;
                }
                entries.push((last_used(&path), name, path));
            }

            if entries.len() <= max_entries {
                return Ok(0);
            }
            entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
            let mut evicted = 0;
            for (_, name, path) in entries.into_iter().skip(max_entries) {
                match std::fs::remove_dir_all(&path) {
                    Ok(()) => evicted += 1,
                    Err(e) => tracing::warn!(entry = %name, error = %e, "failed to evict cache entry"),
                }
            }
            Ok(evicted)
        })
        .await
        .map_err(io::Error::other)?
    }
}

/// `/runtime/bin/compile` resolved against the runtime's host root.
fn host_entry_point(runtime: &RuntimeSpec, entry: &str) -> Option<PathBuf> {
    let relative = Path::new(entry).strip_prefix("/runtime").ok()?;
    Some(runtime.root.join(relative))
}

fn touch(entry: &Path) -> io::Result<()> {
    let stamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::fs::write(entry.join(LAST_USED), stamp.to_string())
}

fn last_used(entry: &Path) -> u128 {
    std::fs::read_to_string(entry.join(LAST_USED))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

/// Regular files and directories only; anything the compile stage left
/// behind as a symlink or device is dropped.
fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dst)?;
    std::fs::set_permissions(dst, std::fs::Permissions::from_mode(0o755))?;
    for item in std::fs::read_dir(src)? {
        let item = item?;
        let kind = item.file_type()?;
        let target = dst.join(item.file_name());
        if kind.is_dir() {
            copy_tree(&item.path(), &target)?;
        } else if kind.is_file() {
            std::fs::copy(item.path(), &target)?;
            let mode = item.metadata()?.mode() & 0o555;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode | 0o444))?;
        }
    }
    Ok(())
}

fn link_tree(src: &Path, dst: &Path, identity: Identity) -> io::Result<()> {
    if !dst.exists() {
        std::fs::create_dir(dst)?;
        std::os::unix::fs::chown(dst, Some(identity.uid), Some(identity.gid))?;
    }
    for item in std::fs::read_dir(src)? {
        let item = item?;
        let target = dst.join(item.file_name());
        if item.file_type()?.is_dir() {
            link_tree(&item.path(), &target, identity)?;
            continue;
        }
        match std::fs::symlink_metadata(&target) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&target)?,
            Ok(_) => std::fs::remove_file(&target)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        if std::fs::hard_link(item.path(), &target).is_err() {
            std::fs::copy(item.path(), &target)?;
        }
    }
    Ok(())
}
