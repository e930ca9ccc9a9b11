//! Infrastructure layer - Storage and source adapters
//!
//! - `memory`: in-memory `ArtifactStore` over a version arena
//! - `sources`: `SourceProvider` adapters for mounting

pub mod memory;
pub mod sources;

pub use memory::{InMemoryArtifactStore, StoreConfig};
pub use sources::{DirectorySource, StaticSource};
