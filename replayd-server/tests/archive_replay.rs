//! Offline archive replay against a real archive directory.

use replayd_core::arena::MemoryArena;
use replayd_core::cache::{OnDiskResourceCache, ResourceCache};
use replayd_server::archive::{ArchiveOptions, PAYLOAD_FILE, replay_archive};
use replayd_server::vm::PayloadContextFactory;
use std::fs;
use std::sync::Arc;

#[test]
fn replays_an_exported_archive_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join(PAYLOAD_FILE), b"instruction-stream").unwrap();
    {
        // Exported caches ride in the same directory as the payload.
        let cache = OnDiskResourceCache::open(dir.path(), false).unwrap();
        assert!(cache.store(&"tex/1".into(), b"texels"));
    }
    let postback = dir.path().join("postback");

    let arena = Arc::new(MemoryArena::reserve(&[64 * 1024]).unwrap());
    let factory = PayloadContextFactory::new(arena);
    replay_archive(
        &ArchiveOptions {
            archive_dir: dir.path().to_path_buf(),
            postback_dir: Some(postback.clone()),
        },
        &factory,
    )
    .unwrap();

    assert!(postback.join("replay_finished").exists());
}

#[test]
fn archive_without_a_payload_fails_and_posts_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let postback = dir.path().join("postback");

    let arena = Arc::new(MemoryArena::reserve(&[64 * 1024]).unwrap());
    let factory = PayloadContextFactory::new(arena);
    let outcome = replay_archive(
        &ArchiveOptions {
            archive_dir: dir.path().to_path_buf(),
            postback_dir: Some(postback.clone()),
        },
        &factory,
    );

    assert!(outcome.is_err());
    assert!(!postback.exists());
}
