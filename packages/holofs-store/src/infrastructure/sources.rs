//! Mounted-source adapters

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncReadExt;
use tracing::debug;
use walkdir::WalkDir;

use crate::domain::SourceProvider;
use crate::error::{Result, StorageError};

fn oversized(relative_path: &str, len: u64, max_bytes: usize) -> StorageError {
    StorageError::untrusted(format!(
        "{}: {} bytes exceeds limit of {}",
        relative_path, len, max_bytes
    ))
}

/// A directory on the local disk, exposed read-only
///
/// Only regular files inside the root are visible. Symbolic links are
/// neither listed nor read.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    id: String,
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a source-relative path without leaving the root
    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let candidate = Path::new(relative);
        let escapes = candidate
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if relative.is_empty() || escapes {
            return Err(StorageError::invalid_path(relative, "escapes source root"));
        }
        Ok(self.root.join(candidate))
    }
}

#[async_trait]
impl SourceProvider for DirectorySource {
    async fn list(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        let id = self.id.clone();

        let listed = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            if !root.is_dir() {
                return Err(StorageError::source_unavailable(
                    &id,
                    format!("{} is not a directory", root.display()),
                ));
            }

            let mut files = Vec::new();
            for entry in WalkDir::new(&root).follow_links(false) {
                let entry = entry.map_err(|e| StorageError::source_unavailable(&id, &e))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let parts: Vec<String> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                files.push(parts.join("/"));
            }
            files.sort();
            Ok(files)
        })
        .await
        .map_err(|e| StorageError::source_unavailable(&self.id, e))??;

        debug!(source_id = %self.id, files = listed.len(), "Listed directory source");
        Ok(listed)
    }

    async fn read(&self, relative_path: &str, max_bytes: usize) -> Result<Vec<u8>> {
        let path = self.resolve(relative_path)?;
        let meta = match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::not_found(relative_path))
            }
            Err(e) => return Err(StorageError::source_unavailable(&self.id, &e).with_source(e)),
        };
        if meta.file_type().is_symlink() {
            return Err(StorageError::untrusted(format!(
                "{}: symbolic links are not followed",
                relative_path
            )));
        }
        // Listing only reports regular files
        if !meta.is_file() {
            return Err(StorageError::not_found(relative_path));
        }

        // A symlinked parent directory can still point outside the root
        let (root, real) = tokio::try_join!(
            tokio::fs::canonicalize(&self.root),
            tokio::fs::canonicalize(&path)
        )
        .map_err(|e| StorageError::source_unavailable(&self.id, &e).with_source(e))?;
        if !real.starts_with(&root) {
            return Err(StorageError::untrusted(format!(
                "{}: resolves outside the source root",
                relative_path
            )));
        }

        if meta.len() > max_bytes as u64 {
            return Err(oversized(relative_path, meta.len(), max_bytes));
        }
        let file = tokio::fs::File::open(&real)
            .await
            .map_err(|e| StorageError::source_unavailable(&self.id, &e).with_source(e))?;
        let mut bytes = Vec::with_capacity(meta.len() as usize);
        file.take(max_bytes as u64 + 1)
            .read_to_end(&mut bytes)
            .await
            .map_err(|e| StorageError::source_unavailable(&self.id, &e).with_source(e))?;
        // The file grew after the size check
        if bytes.len() > max_bytes {
            return Err(oversized(relative_path, bytes.len() as u64, max_bytes));
        }
        Ok(bytes)
    }

    async fn probe(&self) -> bool {
        tokio::fs::metadata(&self.root)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
    }
}

/// In-memory source with switchable reachability
#[derive(Debug, Default)]
pub struct StaticSource {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    unreachable: AtomicBool,
}

impl StaticSource {
    pub fn new<K, V>(files: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        Self {
            files: RwLock::new(
                files
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
            unreachable: AtomicBool::new(false),
        }
    }

    pub fn insert(&self, path: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.files.write().insert(path.into(), content.into());
    }

    pub fn remove(&self, path: &str) -> bool {
        self.files.write().remove(path).is_some()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(StorageError::source_unavailable("static", "marked unreachable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SourceProvider for StaticSource {
    async fn list(&self) -> Result<Vec<String>> {
        self.check_reachable()?;
        Ok(self.files.read().keys().cloned().collect())
    }

    async fn read(&self, relative_path: &str, max_bytes: usize) -> Result<Vec<u8>> {
        self.check_reachable()?;
        let files = self.files.read();
        let bytes = files
            .get(relative_path)
            .ok_or_else(|| StorageError::not_found(relative_path))?;
        if bytes.len() > max_bytes {
            return Err(oversized(relative_path, bytes.len() as u64, max_bytes));
        }
        Ok(bytes.clone())
    }
}
