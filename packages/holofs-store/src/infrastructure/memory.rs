//! In-memory `ArtifactStore` adapter
//!
//! Versions live in an arena keyed by `(artifact_id, sequence)`; each chain
//! keeps only an atomic head pointer. A writer holds the chain's write lock,
//! inserts the new version into the arena and then publishes it by bumping the
//! head with `Release` ordering. Readers load the head with `Acquire` and look
//! the version up, so they never wait on a writer and never see a version
//! before it is complete.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::{
    validate_untrusted, ArtifactId, ArtifactStore, ContentHash, DirEntry, EntryKind, EntryOrigin,
    MountStatus, MountedSource, Provenance, SourceProvider, Version, VirtualPath,
};
use crate::error::{ErrorKind, Result, StorageError};

/// Store tuning
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Upper bound for content read from mounted sources
    pub max_artifact_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_artifact_bytes: 8 * 1024 * 1024,
        }
    }
}

struct Chain {
    path: VirtualPath,
    head: AtomicU64,
    write_lock: Mutex<()>,
}

impl Chain {
    fn new(path: VirtualPath) -> Self {
        Self {
            path,
            head: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }
}

#[derive(Clone)]
struct Mount {
    info: MountedSource,
    provider: Arc<dyn SourceProvider>,
}

/// Process-local artifact store
pub struct InMemoryArtifactStore {
    config: StoreConfig,
    blobs: DashMap<ContentHash, Arc<[u8]>>,
    arena: DashMap<(ArtifactId, u64), Version>,
    chains: DashMap<ArtifactId, Arc<Chain>>,
    mounts: RwLock<BTreeMap<String, Mount>>,
}

impl Default for InMemoryArtifactStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl InMemoryArtifactStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            blobs: DashMap::new(),
            arena: DashMap::new(),
            chains: DashMap::new(),
            mounts: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of distinct blobs held
    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    /// Number of paths with live native content
    pub fn artifact_count(&self) -> usize {
        self.chains.iter().filter(|chain| self.is_live(chain)).count()
    }

    fn chain(&self, id: &ArtifactId) -> Option<Arc<Chain>> {
        self.chains.get(id).map(|chain| Arc::clone(chain.value()))
    }

    fn chain_for_write(&self, raw: &str) -> Result<(Arc<Chain>, ArtifactId)> {
        let path = VirtualPath::parse(raw)?;
        if path.is_root() {
            return Err(StorageError::invalid_path(raw, "root is a directory"));
        }
        let id = ArtifactId::for_path(&path);
        let chain = self
            .chains
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Chain::new(path)))
            .value()
            .clone();
        Ok((chain, id))
    }

    fn version_at(&self, id: &ArtifactId, sequence: u64) -> Option<Version> {
        self.arena
            .get(&(id.clone(), sequence))
            .map(|entry| entry.value().clone())
    }

    fn blob(&self, hash: &ContentHash) -> Result<Arc<[u8]>> {
        self.blobs
            .get(hash)
            .map(|blob| Arc::clone(blob.value()))
            .ok_or_else(|| StorageError::not_found(format!("blob {}", hash.short())))
    }

    /// Published head version of a native chain, unless it is a tombstone
    fn native_head(&self, id: &ArtifactId) -> Option<Version> {
        let chain = self.chain(id)?;
        match chain.head() {
            0 => None,
            head => self
                .version_at(id, head)
                .filter(|version| !version.provenance.is_tombstone()),
        }
    }

    fn is_live(&self, chain: &Chain) -> bool {
        match chain.head() {
            0 => false,
            head => self
                .version_at(&ArtifactId::for_path(&chain.path), head)
                .map_or(false, |version| !version.provenance.is_tombstone()),
        }
    }

    /// Native chain ending in a tombstone
    fn is_deleted(&self, id: &ArtifactId) -> bool {
        self.chain(id)
            .map_or(false, |chain| chain.head() > 0 && !self.is_live(&chain))
    }

    async fn tombstone(&self, raw: &str, renamed_to: Option<VirtualPath>) -> Result<Version> {
        let (chain, id) = self.chain_for_write(raw)?;
        let _guard = chain.write_lock.lock().await;
        self.import_if_mounted(&chain, &id).await?;
        if self.native_head(&id).is_none() {
            return Err(StorageError::not_found(chain.path.as_str()));
        }
        self.install(&chain, &id, b"", Provenance::Tombstone { renamed_to }, None)
    }

    /// Mounts whose root covers `path`, deepest root first
    fn covering_mounts(&self, path: &VirtualPath) -> Vec<(Mount, String)> {
        let mounts = self.mounts.read();
        let mut covering: Vec<(Mount, String)> = mounts
            .values()
            .filter_map(|mount| {
                let rest = path.strip_prefix(&mount.info.root_path)?;
                if rest.is_empty() {
                    None
                } else {
                    Some((mount.clone(), rest.to_string()))
                }
            })
            .collect();
        covering.sort_by(|a, b| {
            b.0.info
                .root_path
                .as_str()
                .len()
                .cmp(&a.0.info.root_path.as_str().len())
        });
        covering
    }

    fn mount_snapshot(&self) -> Vec<Mount> {
        self.mounts.read().values().cloned().collect()
    }

    /// Read `path` through the overlays, validating what comes back
    async fn read_mounted(&self, path: &VirtualPath) -> Result<Option<(String, Vec<u8>)>> {
        for (mount, relative) in self.covering_mounts(path) {
            let source_id = mount.info.source_id.clone();
            match mount.provider.read(&relative, self.config.max_artifact_bytes).await {
                Ok(bytes) => {
                    validate_untrusted(path, &bytes, self.config.max_artifact_bytes)?;
                    return Ok(Some((source_id, bytes)));
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) if e.kind == ErrorKind::UntrustedContent => {
                    warn!(source_id = %source_id, path = %path, error = %e, "Rejected mounted content");
                    return Err(e);
                }
                Err(e) => {
                    warn!(source_id = %source_id, path = %path, error = %e, "Mounted source read failed");
                    return Err(StorageError::source_unavailable(source_id, &e.message).with_source(e));
                }
            }
        }
        Ok(None)
    }

    /// Copy-on-write: import mounted content as the first version
    async fn import_if_mounted(&self, chain: &Chain, id: &ArtifactId) -> Result<Option<Version>> {
        if chain.head() > 0 {
            return Ok(None);
        }
        match self.read_mounted(&chain.path).await? {
            Some((source_id, bytes)) => {
                let version = self.install(chain, id, &bytes, Provenance::Mount { source_id }, None)?;
                info!(
                    path = %chain.path,
                    hash = %version.content_hash.short(),
                    "Imported mounted artifact"
                );
                Ok(Some(version))
            }
            None => Ok(None),
        }
    }

    /// Append a version to a chain; caller holds the chain's write lock
    fn install(
        &self,
        chain: &Chain,
        id: &ArtifactId,
        content: &[u8],
        provenance: Provenance,
        parent: Option<u64>,
    ) -> Result<Version> {
        let head = chain.head();
        if let Some(parent) = parent {
            if parent == 0 || parent > head {
                return Err(StorageError::version_not_found(&chain.path, parent));
            }
        }

        let hash = ContentHash::compute(content);
        if head > 0 && parent.map_or(true, |p| p == head) && !provenance.is_tombstone() {
            if let Some(current) = self.version_at(id, head) {
                if current.content_hash == hash && !current.provenance.is_tombstone() {
                    debug!(path = %chain.path, sequence = head, "Identical content, keeping head");
                    return Ok(current);
                }
            }
        }

        self.blobs
            .entry(hash)
            .or_insert_with(|| Arc::from(content));

        let sequence = head + 1;
        let version = Version {
            artifact_id: id.clone(),
            sequence,
            content_hash: hash,
            parent: parent.or(if head > 0 { Some(head) } else { None }),
            provenance,
            timestamp: Utc::now(),
            size: content.len(),
        };
        self.arena.insert((id.clone(), sequence), version.clone());
        chain.head.store(sequence, Ordering::Release);

        debug!(
            path = %chain.path,
            sequence,
            hash = %hash.short(),
            branch = version.is_branch(),
            "Committed version"
        );
        Ok(version)
    }

    fn has_native_descendant(&self, dir: &VirtualPath) -> bool {
        self.chains
            .iter()
            .any(|chain| chain.path != *dir && chain.path.starts_with(dir) && self.is_live(&chain))
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn commit(
        &self,
        path: &str,
        content: &[u8],
        provenance: Provenance,
        parent: Option<u64>,
    ) -> Result<Version> {
        let (chain, id) = self.chain_for_write(path)?;
        let _guard = chain.write_lock.lock().await;
        self.import_if_mounted(&chain, &id).await?;
        self.install(&chain, &id, content, provenance, parent)
    }

    async fn get(&self, path: &str, version: Option<u64>) -> Result<Arc<[u8]>> {
        let path = VirtualPath::parse(path)?;
        let id = ArtifactId::for_path(&path);

        if let Some(chain) = self.chain(&id) {
            let head = chain.head();
            if head > 0 {
                let sequence = version.unwrap_or(head);
                if sequence == 0 || sequence > head {
                    return Err(StorageError::version_not_found(&path, sequence));
                }
                let found = self
                    .version_at(&id, sequence)
                    .ok_or_else(|| StorageError::version_not_found(&path, sequence))?;
                // A deleted path does not fall through to its mount
                if found.provenance.is_tombstone() {
                    return Err(StorageError::not_found(format!("{} (deleted)", path)));
                }
                return self.blob(&found.content_hash);
            }
        }

        if let Some(sequence) = version {
            return Err(StorageError::version_not_found(&path, sequence));
        }
        match self.read_mounted(&path).await? {
            Some((_, bytes)) => Ok(Arc::from(bytes)),
            None => Err(StorageError::not_found(path.as_str())),
        }
    }

    async fn head(&self, path: &str) -> Result<Version> {
        let path = VirtualPath::parse(path)?;
        self.native_head(&ArtifactId::for_path(&path))
            .ok_or_else(|| StorageError::not_found(path.as_str()))
    }

    async fn versions(&self, path: &str) -> Result<Vec<Version>> {
        let path = VirtualPath::parse(path)?;
        let id = ArtifactId::for_path(&path);
        let head = self.chain(&id).map(|chain| chain.head()).unwrap_or(0);
        if head == 0 {
            return Err(StorageError::not_found(path.as_str()));
        }
        (1..=head)
            .map(|sequence| {
                self.version_at(&id, sequence)
                    .ok_or_else(|| StorageError::version_not_found(&path, sequence))
            })
            .collect()
    }

    async fn exists(&self, path: &str) -> bool {
        let Ok(path) = VirtualPath::parse(path) else {
            return false;
        };
        let id = ArtifactId::for_path(&path);
        if path.is_root() || self.native_head(&id).is_some() {
            return true;
        }
        if self.has_native_descendant(&path) {
            return true;
        }
        if self.is_deleted(&id) {
            return false;
        }
        if matches!(self.read_mounted(&path).await, Ok(Some(_))) {
            return true;
        }
        match path.parent() {
            Some(parent) => self
                .list_entries(parent.as_str())
                .await
                .map(|entries| entries.iter().any(|entry| entry.path == path))
                .unwrap_or(false),
            None => false,
        }
    }

    async fn materialize(&self, path: &str) -> Result<Version> {
        let (chain, id) = self.chain_for_write(path)?;
        let _guard = chain.write_lock.lock().await;
        if let Some(head) = self.native_head(&id) {
            return Ok(head);
        }
        self.import_if_mounted(&chain, &id)
            .await?
            .ok_or_else(|| StorageError::not_found(chain.path.as_str()))
    }

    async fn copy(&self, from: &str, to: &str) -> Result<Version> {
        let source = self.materialize(from).await?;
        let from_path = VirtualPath::parse(from)?;
        let content = self.blob(&source.content_hash)?;
        let version = self
            .commit(
                to,
                &content,
                Provenance::Copy {
                    from: from_path.clone(),
                    sequence: source.sequence,
                },
                None,
            )
            .await?;
        info!(from = %from_path, to = %to, sequence = version.sequence, "Copied artifact");
        Ok(version)
    }

    async fn append(&self, path: &str, content: &[u8]) -> Result<Version> {
        let (chain, id) = self.chain_for_write(path)?;
        let _guard = chain.write_lock.lock().await;
        self.import_if_mounted(&chain, &id).await?;

        let mut combined = match self.native_head(&id) {
            Some(head) => self.blob(&head.content_hash)?.to_vec(),
            None => Vec::new(),
        };
        combined.extend_from_slice(content);
        self.install(&chain, &id, &combined, Provenance::External, None)
    }

    async fn delete(&self, path: &str) -> Result<Version> {
        let version = self.tombstone(path, None).await?;
        info!(path = %version.artifact_id, sequence = version.sequence, "Deleted artifact");
        Ok(version)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<Version> {
        let from_path = VirtualPath::parse(from)?;
        let to_path = VirtualPath::parse(to)?;
        if from_path == to_path {
            return Err(StorageError::invalid_path(to, "rename onto itself"));
        }

        let source = self.materialize(from_path.as_str()).await?;
        let content = self.blob(&source.content_hash)?;
        let moved = self
            .commit(
                to_path.as_str(),
                &content,
                Provenance::Copy {
                    from: from_path.clone(),
                    sequence: source.sequence,
                },
                None,
            )
            .await?;
        self.tombstone(from_path.as_str(), Some(to_path.clone())).await?;
        info!(from = %from_path, to = %to_path, sequence = moved.sequence, "Renamed artifact");
        Ok(moved)
    }

    async fn mount(
        &self,
        source_id: &str,
        root_path: &str,
        provider: Arc<dyn SourceProvider>,
    ) -> Result<()> {
        let root_path = VirtualPath::parse(root_path)?;
        let mut mounts = self.mounts.write();
        if mounts.contains_key(source_id) {
            return Err(StorageError::already_mounted(source_id));
        }
        mounts.insert(
            source_id.to_string(),
            Mount {
                info: MountedSource {
                    source_id: source_id.to_string(),
                    root_path: root_path.clone(),
                    read_only: true,
                    mounted_at: Utc::now(),
                },
                provider,
            },
        );
        info!(source_id, root = %root_path, "Mounted source");
        Ok(())
    }

    async fn unmount(&self, source_id: &str) -> Result<()> {
        match self.mounts.write().remove(source_id) {
            Some(mount) => {
                info!(source_id, root = %mount.info.root_path, "Unmounted source");
                Ok(())
            }
            None => Err(StorageError::not_mounted(source_id)),
        }
    }

    async fn list_entries(&self, dir_path: &str) -> Result<Vec<DirEntry>> {
        let dir = VirtualPath::parse(dir_path)?;
        let mut entries: BTreeMap<VirtualPath, DirEntry> = BTreeMap::new();

        let mut native = Vec::new();
        let mut deleted = BTreeSet::new();
        for chain in self.chains.iter() {
            if self.is_live(&chain) {
                native.push(chain.path.clone());
            } else if chain.head() > 0 {
                deleted.insert(chain.path.clone());
            }
        }
        for path in native {
            if let Some((child, is_dir)) = path.child_of(&dir) {
                let kind = if is_dir { EntryKind::Directory } else { EntryKind::File };
                entries.entry(child.clone()).or_insert(DirEntry {
                    path: child,
                    kind,
                    origin: EntryOrigin::Native,
                });
            }
        }

        let mut covered = dir.is_root() || !entries.is_empty();
        for mount in self.mount_snapshot() {
            let root = &mount.info.root_path;
            let origin = EntryOrigin::Mounted {
                source_id: mount.info.source_id.clone(),
            };

            if dir.starts_with(root) {
                covered = true;
                let files = match mount.provider.list().await {
                    Ok(files) => files,
                    Err(e) => {
                        warn!(source_id = %mount.info.source_id, error = %e, "Skipping unreachable source in listing");
                        continue;
                    }
                };
                for file in files {
                    let Ok(full) = root.join(&file) else {
                        warn!(source_id = %mount.info.source_id, file = %file, "Skipping invalid source path");
                        continue;
                    };
                    if deleted.contains(&full) {
                        continue;
                    }
                    if let Some((child, is_dir)) = full.child_of(&dir) {
                        let kind = if is_dir { EntryKind::Directory } else { EntryKind::File };
                        entries.entry(child.clone()).or_insert(DirEntry {
                            path: child,
                            kind,
                            origin: origin.clone(),
                        });
                    }
                }
            } else if let Some((child, _)) = root.child_of(&dir) {
                covered = true;
                entries.entry(child.clone()).or_insert(DirEntry {
                    path: child,
                    kind: EntryKind::Directory,
                    origin,
                });
            }
        }

        if !covered {
            return Err(StorageError::not_found(dir.as_str()));
        }
        Ok(entries.into_values().collect())
    }

    fn mounts(&self) -> Vec<MountedSource> {
        self.mounts
            .read()
            .values()
            .map(|mount| mount.info.clone())
            .collect()
    }

    async fn probe_mounts(&self) -> Vec<MountStatus> {
        let mut statuses = Vec::new();
        for mount in self.mount_snapshot() {
            let reachable = mount.provider.probe().await;
            if !reachable {
                warn!(source_id = %mount.info.source_id, "Mounted source unreachable");
            }
            statuses.push(MountStatus {
                source: mount.info,
                reachable,
            });
        }
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::infrastructure::StaticSource;

    fn archive() -> Arc<StaticSource> {
        Arc::new(StaticSource::new([
            ("calls/a.txt", "Alice: hello"),
            ("calls/b.txt", "Bob: hi"),
            ("notes.txt", "n"),
        ]))
    }

    #[tokio::test]
    async fn test_put_get_and_versions() {
        let store = InMemoryArtifactStore::default();
        let v1 = store.put("/t/a.txt", b"one").await.unwrap();
        let v2 = store.put("/t/a.txt", b"two").await.unwrap();

        assert_eq!(v1.sequence, 1);
        assert_eq!(v1.parent, None);
        assert_eq!(v2.sequence, 2);
        assert_eq!(v2.parent, Some(1));

        assert_eq!(&*store.get("/t/a.txt", None).await.unwrap(), b"two");
        assert_eq!(&*store.get("/t/a.txt", Some(1)).await.unwrap(), b"one");
        assert_eq!(store.versions("/t/a.txt").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_put_identical_is_noop() {
        let store = InMemoryArtifactStore::default();
        let v1 = store.put("/a", b"same").await.unwrap();
        let again = store.put("/a", b"same").await.unwrap();
        assert_eq!(v1, again);
        assert_eq!(store.versions("/a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_blobs_are_shared() {
        let store = InMemoryArtifactStore::default();
        store.put("/a", b"shared").await.unwrap();
        store.put("/b", b"shared").await.unwrap();
        assert_eq!(store.blob_count(), 1);
        assert_eq!(store.artifact_count(), 2);
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = InMemoryArtifactStore::default();
        assert!(store.get("/nope", None).await.unwrap_err().is_not_found());

        store.put("/a", b"x").await.unwrap();
        let err = store.get("/a", Some(9)).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.get("/a", Some(0)).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_invalid_path() {
        let store = InMemoryArtifactStore::default();
        let err = store.put("relative", b"x").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidPath);
        let err = store.put("/", b"x").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidPath);
    }

    #[tokio::test]
    async fn test_commit_with_parent_branches() {
        let store = InMemoryArtifactStore::default();
        store.put("/a", b"1").await.unwrap();
        store.put("/a", b"2").await.unwrap();

        let branch = store
            .commit("/a", b"1b", Provenance::stage("s", "repair"), Some(1))
            .await
            .unwrap();
        assert_eq!(branch.sequence, 3);
        assert_eq!(branch.parent, Some(1));
        assert!(branch.is_branch());
        assert_eq!(store.head("/a").await.unwrap().sequence, 3);

        let err = store
            .commit("/a", b"x", Provenance::External, Some(7))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_mount_twice_and_unmount() {
        let store = InMemoryArtifactStore::default();
        store.mount("archive", "/mnt/archive", archive()).await.unwrap();

        let err = store.mount("archive", "/other", archive()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyMounted);

        store.unmount("archive").await.unwrap();
        let err = store.unmount("archive").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotMounted);
    }

    #[tokio::test]
    async fn test_mounted_read_and_copy_on_write() {
        let store = InMemoryArtifactStore::default();
        store.mount("archive", "/mnt", archive()).await.unwrap();

        assert_eq!(&*store.get("/mnt/calls/a.txt", None).await.unwrap(), b"Alice: hello");
        assert!(store.head("/mnt/calls/a.txt").await.is_err());
        assert!(store.get("/mnt/calls/a.txt", Some(1)).await.is_err());

        let written = store.put("/mnt/calls/a.txt", b"Alice: hello!").await.unwrap();
        assert_eq!(written.sequence, 2);

        let chain = store.versions("/mnt/calls/a.txt").await.unwrap();
        assert_eq!(
            chain[0].provenance,
            Provenance::Mount {
                source_id: "archive".to_string()
            }
        );
        assert_eq!(&*store.get("/mnt/calls/a.txt", Some(1)).await.unwrap(), b"Alice: hello");
    }

    #[tokio::test]
    async fn test_materialize() {
        let store = InMemoryArtifactStore::default();
        store.mount("archive", "/mnt", archive()).await.unwrap();

        let v = store.materialize("/mnt/notes.txt").await.unwrap();
        assert_eq!(v.sequence, 1);
        let again = store.materialize("/mnt/notes.txt").await.unwrap();
        assert_eq!(v, again);

        assert!(store.materialize("/mnt/missing.txt").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_shadows_mounted() {
        let store = InMemoryArtifactStore::default();
        store.mount("archive", "/mnt", archive()).await.unwrap();
        store.put("/mnt/notes.txt", b"local").await.unwrap();
        store.put("/mnt/zeta.txt", b"z").await.unwrap();

        let entries = store.list_entries("/mnt").await.unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/mnt/calls", "/mnt/notes.txt", "/mnt/zeta.txt"]);

        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert_eq!(
            entries[0].origin,
            EntryOrigin::Mounted {
                source_id: "archive".to_string()
            }
        );
        assert_eq!(entries[1].origin, EntryOrigin::Native);

        let root = store.list("/").await.unwrap();
        assert_eq!(root, vec![VirtualPath::parse("/mnt").unwrap()]);

        assert!(store.list("/elsewhere").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_walk_files() {
        let store = InMemoryArtifactStore::default();
        store.mount("archive", "/mnt", archive()).await.unwrap();
        let files = store.walk_files("/mnt").await.unwrap();
        let files: Vec<&str> = files.iter().map(|p| p.as_str()).collect();
        assert_eq!(files, vec!["/mnt/calls/a.txt", "/mnt/calls/b.txt", "/mnt/notes.txt"]);
    }

    #[tokio::test]
    async fn test_exists() {
        let store = InMemoryArtifactStore::default();
        store.mount("archive", "/mnt", archive()).await.unwrap();
        store.put("/native/x.txt", b"x").await.unwrap();

        assert!(store.exists("/native/x.txt").await);
        assert!(store.exists("/native").await);
        assert!(store.exists("/mnt/calls/a.txt").await);
        assert!(store.exists("/mnt/calls").await);
        assert!(!store.exists("/mnt/none.txt").await);
        assert!(!store.exists("bad").await);
    }

    #[tokio::test]
    async fn test_copy_and_append() {
        let store = InMemoryArtifactStore::default();
        store.put("/a", b"Alice: hi").await.unwrap();

        let copied = store.copy("/a", "/b").await.unwrap();
        assert_eq!(copied.sequence, 1);
        assert!(matches!(copied.provenance, Provenance::Copy { sequence: 1, .. }));
        assert_eq!(store.blob_count(), 1);

        let appended = store.append("/b", b"\nBob: yo").await.unwrap();
        assert_eq!(appended.sequence, 2);
        assert_eq!(&*store.get("/b", None).await.unwrap(), b"Alice: hi\nBob: yo");
    }

    #[tokio::test]
    async fn test_untrusted_mounted_content_rejected() {
        let store = InMemoryArtifactStore::new(StoreConfig {
            max_artifact_bytes: 4,
        });
        store.mount("archive", "/mnt", archive()).await.unwrap();
        let err = store.get("/mnt/calls/a.txt", None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::UntrustedContent);
        assert!(store.materialize("/mnt/calls/a.txt").await.is_err());
        assert_eq!(store.artifact_count(), 0);
    }

    #[tokio::test]
    async fn test_probe_mounts() {
        let store = InMemoryArtifactStore::default();
        let source = archive();
        store.mount("archive", "/mnt", source.clone()).await.unwrap();

        let statuses = store.probe_mounts().await;
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].reachable);

        source.set_reachable(false);
        assert!(!store.probe_mounts().await[0].reachable);
        let err = store.get("/mnt/notes.txt", None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SourceUnavailable);
    }

    #[tokio::test]
    async fn test_export_chain() {
        let store = InMemoryArtifactStore::default();
        store.put("/a", b"1").await.unwrap();
        store.put("/a", b"2").await.unwrap();

        let export = store.export_chain("/a").await.unwrap();
        assert_eq!(export.current, 2);
        assert_eq!(export.versions.len(), 2);

        let json = serde_json::to_string(&export).unwrap();
        assert!(json.contains("\"current\":2"));
    }

    #[tokio::test]
    async fn test_delete_leaves_tombstone() {
        let store = InMemoryArtifactStore::default();
        store.put("/calls/a.txt", b"Alice: one").await.unwrap();
        store.put("/calls/b.txt", b"Bob: two").await.unwrap();

        let tombstone = store.delete("/calls/a.txt").await.unwrap();
        assert_eq!(tombstone.sequence, 2);
        assert!(tombstone.provenance.is_tombstone());

        assert!(store.get("/calls/a.txt", None).await.unwrap_err().is_not_found());
        assert!(store.get("/calls/a.txt", Some(2)).await.unwrap_err().is_not_found());
        assert!(store.head("/calls/a.txt").await.unwrap_err().is_not_found());
        assert!(!store.exists("/calls/a.txt").await);
        assert_eq!(&*store.get("/calls/a.txt", Some(1)).await.unwrap(), b"Alice: one");
        assert_eq!(store.versions("/calls/a.txt").await.unwrap().len(), 2);
        assert_eq!(
            store.list("/calls").await.unwrap(),
            vec![VirtualPath::parse("/calls/b.txt").unwrap()]
        );
        assert_eq!(store.artifact_count(), 1);

        assert!(store.delete("/calls/a.txt").await.unwrap_err().is_not_found());
        assert!(store.delete("/calls/none.txt").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_write_after_delete_revives_path() {
        let store = InMemoryArtifactStore::default();
        store.put("/a", b"").await.unwrap();
        let tombstone = store.delete("/a").await.unwrap();
        assert_eq!(tombstone.sequence, 2);

        // Same (empty) content as the tombstone is still a new version
        let revived = store.put("/a", b"").await.unwrap();
        assert_eq!(revived.sequence, 3);
        assert_eq!(revived.parent, Some(2));
        assert!(store.exists("/a").await);

        store.delete("/a").await.unwrap();
        let appended = store.append("/a", b"fresh").await.unwrap();
        assert_eq!(&*store.get("/a", None).await.unwrap(), b"fresh");
        assert_eq!(appended.sequence, 5);
    }

    #[tokio::test]
    async fn test_delete_hides_mounted_file() {
        let store = InMemoryArtifactStore::default();
        store.mount("archive", "/mnt", archive()).await.unwrap();

        store.delete("/mnt/notes.txt").await.unwrap();
        let chain = store.versions("/mnt/notes.txt").await.unwrap();
        assert_eq!(chain.len(), 2);
        assert!(matches!(chain[0].provenance, Provenance::Mount { .. }));

        assert!(store.get("/mnt/notes.txt", None).await.unwrap_err().is_not_found());
        assert!(!store.exists("/mnt/notes.txt").await);
        assert!(store.materialize("/mnt/notes.txt").await.unwrap_err().is_not_found());
        let files = store.walk_files("/mnt").await.unwrap();
        let files: Vec<&str> = files.iter().map(|p| p.as_str()).collect();
        assert_eq!(files, vec!["/mnt/calls/a.txt", "/mnt/calls/b.txt"]);
    }

    #[tokio::test]
    async fn test_rename_moves_content() {
        let store = InMemoryArtifactStore::default();
        store.put("/inbox/a.txt", b"Alice: v1").await.unwrap();
        store.put("/inbox/a.txt", b"Alice: v2").await.unwrap();

        let moved = store.rename("/inbox/a.txt", "/done/a.txt").await.unwrap();
        assert_eq!(moved.sequence, 1);
        assert_eq!(
            moved.provenance,
            Provenance::Copy {
                from: VirtualPath::parse("/inbox/a.txt").unwrap(),
                sequence: 2
            }
        );
        assert_eq!(&*store.get("/done/a.txt", None).await.unwrap(), b"Alice: v2");
        assert_eq!(store.blob_count(), 3);

        let old = store.versions("/inbox/a.txt").await.unwrap();
        assert_eq!(old.len(), 3);
        assert_eq!(
            old[2].provenance,
            Provenance::Tombstone {
                renamed_to: Some(VirtualPath::parse("/done/a.txt").unwrap())
            }
        );
        assert!(!store.exists("/inbox/a.txt").await);
        assert!(store.list("/inbox").await.unwrap_err().is_not_found());

        let err = store.rename("/done/a.txt", "/done/a.txt").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidPath);
        assert!(store.rename("/inbox/a.txt", "/x").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_search_matches_current_lines() {
        let store = InMemoryArtifactStore::default();
        store.mount("archive", "/mnt", archive()).await.unwrap();
        store.put("/mnt/calls/b.txt", b"Bob: hi\nBob: hello again").await.unwrap();
        store.put("/mnt/calls/bin.dat", &[0xff, 0xfe]).await.unwrap();

        let pattern = regex::Regex::new(r"(?i)\bhello\b").unwrap();
        let hits = store.search("/mnt", &pattern).await.unwrap();
        let found: Vec<(&str, usize)> = hits
            .iter()
            .map(|hit| (hit.path.as_str(), hit.line_number))
            .collect();
        assert_eq!(found, vec![("/mnt/calls/a.txt", 1), ("/mnt/calls/b.txt", 2)]);
        assert_eq!(hits[1].line, "Bob: hello again");

        store.delete("/mnt/calls/a.txt").await.unwrap();
        assert_eq!(store.search("/mnt/calls", &pattern).await.unwrap().len(), 1);
        assert!(store.search("/nowhere", &pattern).await.unwrap_err().is_not_found());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_dense_sequences() {
        let store = Arc::new(InMemoryArtifactStore::default());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.put("/shared", format!("w{}", i).as_bytes()).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let versions = store.versions("/shared").await.unwrap();
        assert_eq!(versions.len(), 16);
        for (idx, version) in versions.iter().enumerate() {
            assert_eq!(version.sequence, idx as u64 + 1);
        }
    }
}
