//! Integration tests for the artifact store
//!
//! - Idempotent put (property)
//! - Directory mounts with copy-on-write
//! - Directory mounts never leave their root
//! - Concurrent readers during writes

use holofs_store::{
    ArtifactStore, DirectorySource, EntryKind, ErrorKind, InMemoryArtifactStore, Provenance,
    StoreConfig, VirtualPath,
};
use proptest::prelude::*;
use std::sync::Arc;
use tempfile::TempDir;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #[test]
    fn prop_identical_put_yields_same_version(
        name in "[a-z]{1,8}",
        content in proptest::collection::vec(any::<u8>(), 0..256),
        repeats in 1usize..5,
    ) {
        let rt = runtime();
        rt.block_on(async {
            let store = InMemoryArtifactStore::default();
            let path = format!("/prop/{}", name);

            let first = store.put(&path, &content).await.unwrap();
            for _ in 0..repeats {
                let again = store.put(&path, &content).await.unwrap();
                prop_assert_eq!(&again, &first);
            }
            prop_assert_eq!(store.versions(&path).await.unwrap().len(), 1);
            Ok(())
        })?;
    }

    #[test]
    fn prop_sequences_are_dense(contents in proptest::collection::vec("[a-c]{1,3}", 1..20)) {
        let rt = runtime();
        rt.block_on(async {
            let store = InMemoryArtifactStore::default();
            for content in &contents {
                store.put("/dense", content.as_bytes()).await.unwrap();
            }
            let versions = store.versions("/dense").await.unwrap();
            for (idx, version) in versions.iter().enumerate() {
                prop_assert_eq!(version.sequence, idx as u64 + 1);
                if idx > 0 {
                    prop_assert_ne!(version.content_hash, versions[idx - 1].content_hash);
                }
            }
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn test_directory_mount_copy_on_write() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("2024")).unwrap();
    std::fs::write(dir.path().join("2024/call.txt"), "Alice: hello [?]").unwrap();

    let store = InMemoryArtifactStore::default();
    store
        .mount(
            "disk",
            "/mnt/disk",
            Arc::new(DirectorySource::new("disk", dir.path())),
        )
        .await
        .unwrap();

    let entries = store.list_entries("/mnt/disk").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, EntryKind::Directory);

    let text = store.get_text("/mnt/disk/2024/call.txt", None).await.unwrap();
    assert_eq!(text, "Alice: hello [?]");

    let v = store
        .commit(
            "/mnt/disk/2024/call.txt",
            b"Alice: hello",
            Provenance::stage("s-1", "formatting"),
            None,
        )
        .await
        .unwrap();
    assert_eq!(v.sequence, 2);
    assert_eq!(v.provenance.produced_by_stage(), Some("formatting"));

    // The source itself is never written
    let on_disk = std::fs::read_to_string(dir.path().join("2024/call.txt")).unwrap();
    assert_eq!(on_disk, "Alice: hello [?]");

    // Native content outlives the mount
    store.unmount("disk").await.unwrap();
    assert_eq!(
        store.get_text("/mnt/disk/2024/call.txt", None).await.unwrap(),
        "Alice: hello"
    );
    assert_eq!(
        store.list("/mnt/disk/2024").await.unwrap(),
        vec![VirtualPath::parse("/mnt/disk/2024/call.txt").unwrap()]
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_directory_mount_stays_inside_root() {
    let outside = TempDir::new().unwrap();
    std::fs::write(outside.path().join("secret.txt"), "Eve: secret outside root").unwrap();

    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("call.txt"), "Alice: hi").unwrap();
    std::fs::write(dir.path().join("huge.txt"), "x".repeat(4096)).unwrap();
    std::os::unix::fs::symlink(outside.path().join("secret.txt"), dir.path().join("link.txt"))
        .unwrap();

    let store = InMemoryArtifactStore::new(StoreConfig {
        max_artifact_bytes: 1024,
    });
    store
        .mount("disk", "/mnt", Arc::new(DirectorySource::new("disk", dir.path())))
        .await
        .unwrap();

    assert_eq!(
        store.list("/mnt").await.unwrap(),
        vec![
            VirtualPath::parse("/mnt/call.txt").unwrap(),
            VirtualPath::parse("/mnt/huge.txt").unwrap(),
        ]
    );
    let err = store.get_text("/mnt/link.txt", None).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::UntrustedContent);
    assert!(!store.exists("/mnt/link.txt").await);

    let err = store.materialize("/mnt/huge.txt").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::UntrustedContent);
    assert_eq!(store.get_text("/mnt/call.txt", None).await.unwrap(), "Alice: hi");
    assert_eq!(store.artifact_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_always_see_complete_versions() {
    let store = Arc::new(InMemoryArtifactStore::default());
    store.put("/live", b"v0:v0").await.unwrap();

    let writer = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            for i in 1..200 {
                let body = format!("v{}:v{}", i, i);
                store.put("/live", body.as_bytes()).await.unwrap();
            }
        })
    };

    let mut readers = Vec::new();
    for _ in 0..4 {
        let store = Arc::clone(&store);
        readers.push(tokio::spawn(async move {
            for _ in 0..200 {
                let text = store.get_text("/live", None).await.unwrap();
                let (left, right) = text.split_once(':').unwrap();
                assert_eq!(left, right);
            }
        }));
    }

    writer.await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }
    assert_eq!(store.head("/live").await.unwrap().sequence, 200);
}
