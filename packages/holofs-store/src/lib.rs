//! HOLOFS - versioned, content-addressed artifact store
//!
//! ## Core Principles
//!
//! 1. **Content identity**: an artifact's blob is named by its SHA-256 hash
//! 2. **Version chains**: every write appends `(artifact_id, sequence)`; the
//!    current pointer always advances to the latest committed version
//! 3. **Read-only overlays**: external sources are mounted into the namespace
//!    and copied into the store on first write
//!
//! ## Usage
//!
//! ```rust,ignore
//! use holofs_store::{ArtifactStore, DirectorySource, InMemoryArtifactStore};
//! use std::sync::Arc;
//!
//! let store = InMemoryArtifactStore::default();
//! store.mount("archive", "/mnt/archive", Arc::new(DirectorySource::new("archive", "./calls"))).await?;
//!
//! // Mounted content reads through until first write
//! let raw = store.get_text("/mnt/archive/call-01.txt", None).await?;
//!
//! // First write copies the mounted artifact in as version 1
//! let v = store.put("/mnt/archive/call-01.txt", cleaned.as_bytes()).await?;
//! assert_eq!(v.sequence, 2);
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    validate_untrusted, ArtifactId, ArtifactStore, ChainExport, ContentHash, DirEntry, EntryKind,
    EntryOrigin, MountStatus, MountedSource, Provenance, SearchHit, SourceProvider, Version,
    VirtualPath,
};
pub use infrastructure::{DirectorySource, InMemoryArtifactStore, StaticSource, StoreConfig};
