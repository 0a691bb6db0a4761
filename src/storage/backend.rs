//! Storage backend contract and implementations.
//!
//! Payload bytes live behind `StorageBackend` so the image lifecycle code
//! never touches the filesystem directly. `FsBackend` is the production
//! implementation; `MemoryBackend` backs the test suite and counts writes so
//! idempotency is observable.

use async_trait::async_trait;
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

/// Contract consumed by the image lifecycle code.
///
/// Paths are relative, `/`-separated keys. Implementations must tolerate
/// deletes of missing files and list missing directories as empty, since the
/// thumbnail cleanup pass probes paths that may never have been written.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Write `content` at `path`, creating parent directories as needed.
    /// Returns the path the content was stored under.
    async fn save(&self, path: &str, content: &[u8]) -> io::Result<String>;

    /// Read the full content stored at `path`.
    async fn read(&self, path: &str) -> io::Result<Vec<u8>>;

    /// Delete the file at `path`. Deleting a missing file is not an error.
    async fn delete(&self, path: &str) -> io::Result<()>;

    /// Whether a file exists at `path`.
    async fn exists(&self, path: &str) -> io::Result<bool>;

    /// Non-recursive listing of `path`: (directory names, file names).
    /// A missing directory lists as empty.
    async fn list_dir(&self, path: &str) -> io::Result<(Vec<String>, Vec<String>)>;

    /// Local path a file stored at `path` would occupy.
    fn disk_path(&self, path: &str) -> PathBuf;
}

/// Reject empty, absolute, and traversing paths before they touch the disk.
fn ensure_path_safe(path: &str) -> io::Result<()> {
    if path.is_empty()
        || path.starts_with('/')
        || path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("unsafe storage path `{path}`"),
        ));
    }
    Ok(())
}

/// Filesystem-backed storage rooted at a base directory.
pub struct FsBackend {
    base: PathBuf,
}

impl FsBackend {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn full_path(&self, path: &str) -> io::Result<PathBuf> {
        ensure_path_safe(path)?;
        Ok(self.base.join(path))
    }
}

#[async_trait]
impl StorageBackend for FsBackend {
    async fn save(&self, path: &str, content: &[u8]) -> io::Result<String> {
        let target = self.full_path(path)?;
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "path has no parent"))?;
        fs::create_dir_all(&parent).await?;

        // Write to a temp file and rename so a partial write never lands at
        // the final path.
        let tmp = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        if let Err(err) = fs::write(&tmp, content).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(err);
        }
        if let Err(err) = fs::rename(&tmp, &target).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&target).await?;
                fs::rename(&tmp, &target).await?;
            } else {
                let _ = fs::remove_file(&tmp).await;
                return Err(err);
            }
        }
        Ok(path.to_string())
    }

    async fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        fs::read(self.full_path(path)?).await
    }

    async fn delete(&self, path: &str) -> io::Result<()> {
        let target = self.full_path(path)?;
        match fs::remove_file(&target).await {
            Ok(_) => {
                debug!("removed {}", target.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("{} already missing", target.display());
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn exists(&self, path: &str) -> io::Result<bool> {
        fs::try_exists(self.full_path(path)?).await
    }

    async fn list_dir(&self, path: &str) -> io::Result<(Vec<String>, Vec<String>)> {
        let target = self.full_path(path)?;
        let mut entries = match fs::read_dir(&target).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok((Vec::new(), Vec::new())),
            Err(err) => return Err(err),
        };

        let mut dirs = Vec::new();
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await?.is_dir() {
                dirs.push(name);
            } else {
                files.push(name);
            }
        }
        dirs.sort();
        files.sort();
        Ok((dirs, files))
    }

    fn disk_path(&self, path: &str) -> PathBuf {
        self.base.join(path)
    }
}

/// In-memory storage used by the test suite.
///
/// `save_calls` and `delete_calls` count every invocation so tests can
/// assert that an operation wrote or deleted exactly once.
#[derive(Default)]
pub struct MemoryBackend {
    files: Mutex<HashMap<String, Vec<u8>>>,
    pub save_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.files.lock().unwrap().keys().cloned().collect();
        paths.sort();
        paths
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn save(&self, path: &str, content: &[u8]) -> io::Result<String> {
        ensure_path_safe(path)?;
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_vec());
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        Ok(path.to_string())
    }

    async fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("no file at `{path}`")))
    }

    async fn delete(&self, path: &str) -> io::Result<()> {
        self.files.lock().unwrap().remove(path);
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn exists(&self, path: &str) -> io::Result<bool> {
        Ok(self.contains(path))
    }

    async fn list_dir(&self, path: &str) -> io::Result<(Vec<String>, Vec<String>)> {
        ensure_path_safe(path)?;
        let prefix = format!("{path}/");
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        for key in self.files.lock().unwrap().keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                match rest.split_once('/') {
                    Some((dir, _)) => {
                        if !dirs.contains(&dir.to_string()) {
                            dirs.push(dir.to_string());
                        }
                    }
                    None => files.push(rest.to_string()),
                }
            }
        }
        dirs.sort();
        files.sort();
        Ok((dirs, files))
    }

    fn disk_path(&self, path: &str) -> PathBuf {
        PathBuf::from("memory://").join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path());

        let stored = backend.save("avatar/alice/cat.png", b"png-bytes").await.unwrap();
        assert_eq!(stored, "avatar/alice/cat.png");
        assert!(backend.exists("avatar/alice/cat.png").await.unwrap());
        assert_eq!(backend.read("avatar/alice/cat.png").await.unwrap(), b"png-bytes");

        backend.delete("avatar/alice/cat.png").await.unwrap();
        assert!(!backend.exists("avatar/alice/cat.png").await.unwrap());
        // second delete is a no-op
        backend.delete("avatar/alice/cat.png").await.unwrap();
    }

    #[tokio::test]
    async fn fs_backend_lists_dirs_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path());
        backend.save("a/k/cat.png", b"x").await.unwrap();
        backend.save("a/k/100/cat.png", b"x").await.unwrap();
        backend.save("a/k/200/cat.png", b"x").await.unwrap();

        let (dirs, files) = backend.list_dir("a/k").await.unwrap();
        assert_eq!(dirs, vec!["100", "200"]);
        assert_eq!(files, vec!["cat.png"]);

        let (dirs, files) = backend.list_dir("a/missing").await.unwrap();
        assert!(dirs.is_empty() && files.is_empty());
    }

    #[tokio::test]
    async fn fs_backend_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path());
        assert!(backend.save("../escape.png", b"x").await.is_err());
        assert!(backend.read("/etc/passwd").await.is_err());
        assert!(backend.read("a//b").await.is_err());
    }

    #[tokio::test]
    async fn memory_backend_counts_saves_and_lists() {
        let backend = MemoryBackend::new();
        backend.save("f/k/img.png", b"1").await.unwrap();
        backend.save("f/k/100/img.png", b"2").await.unwrap();
        assert_eq!(backend.save_calls.load(Ordering::SeqCst), 2);

        let (dirs, files) = backend.list_dir("f/k").await.unwrap();
        assert_eq!(dirs, vec!["100"]);
        assert_eq!(files, vec!["img.png"]);
    }
}
