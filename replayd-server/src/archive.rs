//! Offline archive replay.
//!
//! An archive directory is a self-contained export of one replay: a
//! `payload.bin` holding the instruction stream and an on-disk resource
//! cache pre-seeded with everything the replay touches. No server, no
//! client: the payload is replayed once and the outcome is written to
//! the postback directory.

use crate::prewarm::SharedReplayState;
use crate::service::{ArchiveReplayService, ReplayService};
use crate::session::Session;
use replayd_core::cache::{OnDiskResourceCache, ResourceCache};
use replayd_core::context::ContextFactory;
use replayd_core::crash::CrashHandler;
use replayd_core::error::{ReplayError, Result};
use replayd_core::loader::{CachedLoader, PassThroughLoader, ResourceLoader, ResourceProvider};
use replayd_core::types::{InterpretMode, StateId};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Name of the instruction-stream file inside an archive directory.
pub const PAYLOAD_FILE: &str = "payload.bin";

/// Where the archive lives and where the outcome goes.
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    /// Directory holding `payload.bin` and the exported cache.
    pub archive_dir: PathBuf,
    /// Directory receiving the finished marker and any crash report;
    /// `None` discards them.
    pub postback_dir: Option<PathBuf>,
}

/// Replay an archive directory once.
pub fn replay_archive(opts: &ArchiveOptions, factory: &dyn ContextFactory) -> Result<()> {
    let payload_path = opts.archive_dir.join(PAYLOAD_FILE);
    if !payload_path.is_file() {
        return Err(ReplayError::ArchiveLayout {
            path: opts.archive_dir.clone(),
            entry: PAYLOAD_FILE.into(),
        });
    }

    let service = Arc::new(ArchiveReplayService::new(
        payload_path,
        opts.postback_dir.clone(),
    ));

    // The exported cache is read in place and never cleaned up.
    let cache: Option<Arc<dyn ResourceCache>> =
        match OnDiskResourceCache::open(&opts.archive_dir, false) {
            Ok(cache) => Some(Arc::new(cache)),
            Err(e) => {
                warn!(error = %e, "archive has no usable resource cache");
                None
            }
        };

    let provider: Arc<dyn ResourceProvider> = Arc::clone(&service) as _;
    let loader: Box<dyn ResourceLoader> = match &cache {
        Some(cache) => Box::new(CachedLoader::new(
            Arc::clone(cache),
            Some(Box::new(PassThroughLoader::new(provider))),
        )),
        None => Box::new(PassThroughLoader::new(provider)),
    };

    let crash = CrashHandler::new();
    let session = Session::new(
        Arc::clone(&service) as _,
        factory.create_context(loader)?,
        cache,
        SharedReplayState::new(),
        crash,
    );

    info!(archive = %opts.archive_dir.display(), "replaying archive");
    let state = StateId::from(ArchiveReplayService::PAYLOAD_ID);
    let outcome = session.replay_once(&state, InterpretMode::Terminating);
    if let Err(e) = service.send_replay_finished() {
        warn!(error = %e, "failed to write the finished marker");
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedFactory;
    use std::fs;

    #[test]
    fn missing_payload_is_a_layout_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = replay_archive(
            &ArchiveOptions {
                archive_dir: dir.path().to_path_buf(),
                postback_dir: None,
            },
            &ScriptedFactory::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ReplayError::ArchiveLayout { .. }));
    }

    #[test]
    fn replays_the_payload_and_posts_back() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(PAYLOAD_FILE), b"stream").unwrap();
        let postback = dir.path().join("postback");

        let factory = ScriptedFactory::new();
        replay_archive(
            &ArchiveOptions {
                archive_dir: dir.path().to_path_buf(),
                postback_dir: Some(postback.clone()),
            },
            &factory,
        )
        .unwrap();

        assert_eq!(factory.initialize_count(ArchiveReplayService::PAYLOAD_ID), 1);
        assert!(postback.join("replay_finished").exists());
    }

    #[test]
    fn failed_cleanup_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(PAYLOAD_FILE), b"stream").unwrap();

        let factory = ScriptedFactory::new();
        factory.fail_cleanup_of(ArchiveReplayService::PAYLOAD_ID);
        let outcome = replay_archive(
            &ArchiveOptions {
                archive_dir: dir.path().to_path_buf(),
                postback_dir: None,
            },
            &factory,
        );
        assert!(matches!(outcome, Err(ReplayError::ContextCleanup { .. })));
    }
}
