//! Domain layer for the HOLOFS artifact store
//!
//! # Core Principles
//!
//! 1. **Content addressing**: a blob is identified by its [`ContentHash`]
//! 2. **Append-only chains**: every write to a path appends a [`Version`];
//!    old versions stay addressable
//! 3. **Copy-on-write mounts**: mounted sources are overlaid read-only and
//!    copied into the store on first write
//!
//! # Domain Models
//!
//! - `Version`: one committed state of an artifact
//! - `Provenance`: who produced a version
//! - `MountedSource`: a registered read-only overlay
//! - `DirEntry`: one row of a directory listing
//! - `SearchHit`: one matching line of a content search
//!
//! # Port Traits
//!
//! - `ArtifactStore`: primary storage abstraction
//! - `SourceProvider`: read interface of an external mounted source

pub mod hash;
pub mod path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{ErrorKind, Result, StorageError};

pub use hash::ContentHash;
pub use path::VirtualPath;

// ═══════════════════════════════════════════════════════════════════════════
// Domain Models
// ═══════════════════════════════════════════════════════════════════════════

/// Logical artifact identity (the artifact's normalized virtual path)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(String);

impl ArtifactId {
    pub fn for_path(path: &VirtualPath) -> Self {
        Self(path.as_str().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The path this artifact lives at
    pub fn path(&self) -> Result<VirtualPath> {
        VirtualPath::parse(&self.0)
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Origin of a committed version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Provenance {
    /// Written directly by a caller
    External,
    /// Copied in from a mounted source on first write
    Mount { source_id: String },
    /// Copied from version `sequence` of another path
    Copy { from: VirtualPath, sequence: u64 },
    /// Produced by a pipeline stage of a processing session
    Stage { session_id: String, stage: String },
    /// Path deleted; `renamed_to` is set when the content moved
    Tombstone { renamed_to: Option<VirtualPath> },
}

impl Provenance {
    pub fn stage(session_id: impl Into<String>, stage: impl Into<String>) -> Self {
        Self::Stage {
            session_id: session_id.into(),
            stage: stage.into(),
        }
    }

    /// Stage label when this version came out of a pipeline stage
    pub fn produced_by_stage(&self) -> Option<&str> {
        match self {
            Provenance::Stage { stage, .. } => Some(stage),
            _ => None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Provenance::Stage { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Provenance::Tombstone { .. })
    }
}

/// One committed state of an artifact
///
/// Versions are indexed by `(artifact_id, sequence)`. Sequence numbers start
/// at 1 and are dense per artifact. `parent` is the version the content was
/// derived from; it is `sequence - 1` on a linear chain and lower when a
/// writer branched from an older version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub artifact_id: ArtifactId,
    pub sequence: u64,
    pub content_hash: ContentHash,
    pub parent: Option<u64>,
    pub provenance: Provenance,
    pub timestamp: DateTime<Utc>,
    pub size: usize,
}

impl Version {
    /// True when this version does not extend its immediate predecessor
    pub fn is_branch(&self) -> bool {
        match self.parent {
            Some(parent) => parent + 1 != self.sequence,
            None => false,
        }
    }
}

/// A registered read-only overlay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountedSource {
    pub source_id: String,
    pub root_path: VirtualPath,
    pub read_only: bool,
    pub mounted_at: DateTime<Utc>,
}

/// Reachability of a mounted source at probe time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountStatus {
    pub source: MountedSource,
    pub reachable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryOrigin {
    Native,
    Mounted { source_id: String },
}

/// One row of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub path: VirtualPath,
    pub kind: EntryKind,
    pub origin: EntryOrigin,
}

/// One line matched by `ArtifactStore::search`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub path: VirtualPath,
    /// 1-based
    pub line_number: usize,
    pub line: String,
}

/// Logical persisted layout of one artifact's version chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainExport {
    pub path: VirtualPath,
    pub current: u64,
    pub versions: Vec<Version>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Untrusted input validation
// ═══════════════════════════════════════════════════════════════════════════

/// Validate bytes read from a mounted source before they enter the store
pub fn validate_untrusted(path: &VirtualPath, bytes: &[u8], max_bytes: usize) -> Result<()> {
    if bytes.len() > max_bytes {
        return Err(StorageError::untrusted(format!(
            "{}: {} bytes exceeds limit of {}",
            path,
            bytes.len(),
            max_bytes
        )));
    }
    if bytes.contains(&0) {
        return Err(StorageError::untrusted(format!("{}: contains NUL bytes", path)));
    }
    std::str::from_utf8(bytes).map_err(|e| {
        StorageError::untrusted(format!("{}: not valid UTF-8 ({})", path, e))
    })?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait: SourceProvider
// ═══════════════════════════════════════════════════════════════════════════

/// Read interface of an external source mounted into the namespace
///
/// Paths are relative to the source root and `/`-separated. Everything a
/// provider returns is treated as untrusted.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// All file paths in the source
    async fn list(&self) -> Result<Vec<String>>;

    /// Raw bytes of one file
    ///
    /// Fails with `UntrustedContent` instead of buffering more than
    /// `max_bytes`.
    async fn read(&self, relative_path: &str, max_bytes: usize) -> Result<Vec<u8>>;

    /// Whether the source currently answers
    async fn probe(&self) -> bool {
        self.list().await.is_ok()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait: ArtifactStore
// ═══════════════════════════════════════════════════════════════════════════

/// Versioned, content-addressed artifact storage
///
/// # Core Operations
///
/// 1. **Writes**: `put`, `commit`, `append`, `copy`, `materialize`
/// 2. **Reads**: `get`, `head`, `versions`, `exists`, `export_chain`, `search`
/// 3. **Namespace**: `mount`, `unmount`, `list`, `list_entries`, `delete`, `rename`
/// 4. **Health**: `mounts`, `probe_mounts`
///
/// A deleted path ends in a tombstone version: it disappears from `get`,
/// `head`, `exists` and listings (including any mounted file of the same
/// name) while `versions` keeps the whole chain and earlier sequences stay
/// readable. Writing to the path again revives it.
///
/// Writes to one path are serialized; reads never wait on writers and always
/// observe a fully-formed version.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `content` as the next version of `path`
    ///
    /// Re-putting the content of the current version is a no-op that returns
    /// the current version.
    async fn put(&self, path: &str, content: &[u8]) -> Result<Version> {
        self.commit(path, content, Provenance::External, None).await
    }

    /// General write: explicit provenance and branch point
    ///
    /// `parent = None` derives from the current version.
    ///
    /// # Errors
    ///
    /// - `InvalidPath` if `path` does not normalize
    /// - `NotFound` if `parent` names a version that does not exist
    async fn commit(
        &self,
        path: &str,
        content: &[u8],
        provenance: Provenance,
        parent: Option<u64>,
    ) -> Result<Version>;

    /// Content of `version`, or of the current version when `None`
    ///
    /// Falls through to mounted sources for paths with no native chain.
    async fn get(&self, path: &str, version: Option<u64>) -> Result<Arc<[u8]>>;

    /// `get` decoded as UTF-8
    async fn get_text(&self, path: &str, version: Option<u64>) -> Result<String> {
        let bytes = self.get(path, version).await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| StorageError::serialization(format!("{}: not UTF-8 ({})", path, e)))
    }

    /// Current version of a native path
    async fn head(&self, path: &str) -> Result<Version>;

    /// Whole chain, ascending by sequence
    async fn versions(&self, path: &str) -> Result<Vec<Version>>;

    /// True if `path` resolves natively or through a mount
    async fn exists(&self, path: &str) -> bool;

    /// Copy a mounted artifact into the store (no-op for native paths)
    async fn materialize(&self, path: &str) -> Result<Version>;

    /// Start a chain at `to` with the current content of `from`
    async fn copy(&self, from: &str, to: &str) -> Result<Version>;

    /// Append bytes to the current content
    async fn append(&self, path: &str, content: &[u8]) -> Result<Version>;

    /// Hide `path` behind a tombstone version
    ///
    /// # Errors
    ///
    /// `NotFound` if `path` has no live content, natively or through a mount
    async fn delete(&self, path: &str) -> Result<Version>;

    /// Move the current content of `from` to `to`
    ///
    /// Returns the new version at `to`; `from` ends in a tombstone that
    /// records the destination. The two paths are updated one after the
    /// other, not atomically.
    async fn rename(&self, from: &str, to: &str) -> Result<Version>;

    /// Overlay a read-only source at `root_path`
    ///
    /// # Errors
    ///
    /// Returns `AlreadyMounted` if `source_id` is active
    async fn mount(
        &self,
        source_id: &str,
        root_path: &str,
        provider: Arc<dyn SourceProvider>,
    ) -> Result<()>;

    /// Remove an overlay
    ///
    /// # Errors
    ///
    /// Returns `NotMounted` if `source_id` is not active
    async fn unmount(&self, source_id: &str) -> Result<()>;

    /// Immediate children of `dir_path`, lexicographic
    async fn list(&self, dir_path: &str) -> Result<Vec<VirtualPath>> {
        Ok(self
            .list_entries(dir_path)
            .await?
            .into_iter()
            .map(|entry| entry.path)
            .collect())
    }

    /// Immediate children with kind and origin; native shadows mounted
    async fn list_entries(&self, dir_path: &str) -> Result<Vec<DirEntry>>;

    /// Every file below `dir_path`, sorted
    async fn walk_files(&self, dir_path: &str) -> Result<Vec<VirtualPath>> {
        let mut files = Vec::new();
        let mut pending = vec![VirtualPath::parse(dir_path)?];
        while let Some(dir) = pending.pop() {
            let entries = self.list_entries(dir.as_str()).await?;
            for entry in entries.into_iter().rev() {
                match entry.kind {
                    EntryKind::File => files.push(entry.path),
                    EntryKind::Directory => pending.push(entry.path),
                }
            }
        }
        files.sort();
        Ok(files)
    }

    /// Lines of current content matching `pattern`, for every file below `dir_path`
    ///
    /// Files that are not valid UTF-8, or that a mounted source refuses as
    /// untrusted, are skipped.
    async fn search(&self, dir_path: &str, pattern: &Regex) -> Result<Vec<SearchHit>> {
        let mut hits = Vec::new();
        for path in self.walk_files(dir_path).await? {
            let text = match self.get_text(path.as_str(), None).await {
                Ok(text) => text,
                Err(e) if matches!(e.kind, ErrorKind::Serialization | ErrorKind::UntrustedContent) => {
                    continue
                }
                Err(e) => return Err(e),
            };
            hits.extend(
                text.lines()
                    .enumerate()
                    .filter(|(_, line)| pattern.is_match(line))
                    .map(|(idx, line)| SearchHit {
                        path: path.clone(),
                        line_number: idx + 1,
                        line: line.to_string(),
                    }),
            );
        }
        Ok(hits)
    }

    /// Registered sources
    fn mounts(&self) -> Vec<MountedSource>;

    /// Probe every registered source
    async fn probe_mounts(&self) -> Vec<MountStatus>;

    /// Chain of `path` in its logical persisted form
    async fn export_chain(&self, path: &str) -> Result<ChainExport> {
        let versions = self.versions(path).await?;
        let current = versions.last().map(|v| v.sequence).unwrap_or(0);
        Ok(ChainExport {
            path: VirtualPath::parse(path)?,
            current,
            versions,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
