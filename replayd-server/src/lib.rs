//! replayd server - the replay orchestrator.
//!
//! This crate provides the session-orchestration layer of the daemon:
//! - Wire protocol and framing for the REPLAY/PREWARM request stream
//! - The per-connection session loop and prewarm state machine
//! - The shared device lock serializing arena and crash-handler access
//! - Cache lifecycle management with watchdog cleanup of on-disk caches
//! - The TCP server and the offline archive runner

#![warn(missing_docs)]

pub mod archive;
pub mod cache_manager;
pub mod prewarm;
pub mod protocol;
pub mod server;
pub mod service;
pub mod session;
pub mod testing;
pub mod vm;
#[cfg(unix)]
pub mod watchdog;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::archive::{ArchiveOptions, replay_archive};
    pub use crate::cache_manager::{CacheKind, CreatedCache, DiskCacheOptions, create_cache};
    pub use crate::prewarm::{PrewarmRecord, SharedReplayState};
    pub use crate::protocol::{Frame, Request};
    pub use crate::server::{Server, ServerConfig};
    pub use crate::service::{ArchiveReplayService, ReplayService, SocketReplayService};
    pub use crate::session::Session;
    pub use crate::vm::PayloadContextFactory;
}
