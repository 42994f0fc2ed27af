//! Resource-cache lifecycle.
//!
//! Decides which cache implementation backs the process and arranges for
//! on-disk cache files to be cleaned up after the server exits. Cache
//! trouble is never fatal: every failure path falls back to the
//! in-memory cache with a warning.

use replayd_core::arena::MemoryArena;
use replayd_core::cache::{InMemoryResourceCache, OnDiskResourceCache, ResourceCache};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// On-disk cache configuration, straight from the CLI.
#[derive(Debug, Clone, Default)]
pub struct DiskCacheOptions {
    /// Use an on-disk cache at all.
    pub enabled: bool,
    /// Delete the cache files when the server exits.
    pub clean_up: bool,
    /// Cache directory; `None` allocates a temp directory (which is
    /// always cleaned up, chosen or not).
    pub path: Option<PathBuf>,
    /// Spawn the cleanup watchdog process. Disabled by tests and by
    /// embedders whose binary cannot be re-executed.
    pub spawn_watchdog: bool,
}

impl DiskCacheOptions {
    /// Server defaults: disk cache off, watchdog on when it is needed.
    pub fn new() -> Self {
        Self {
            spawn_watchdog: true,
            ..Self::default()
        }
    }
}

/// Which implementation was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    /// In-memory LRU (the fallback for every failure path).
    InMemory,
    /// On-disk index/data pair.
    OnDisk,
}

/// The selected cache and where it lives.
pub struct CreatedCache {
    /// The process-wide cache handle.
    pub cache: Arc<dyn ResourceCache>,
    /// The selected implementation.
    pub kind: CacheKind,
    /// Directory backing an on-disk cache.
    pub path: Option<PathBuf>,
}

fn in_memory(arena: &MemoryArena) -> CreatedCache {
    CreatedCache {
        cache: Arc::new(InMemoryResourceCache::with_capacity(arena.size())),
        kind: CacheKind::InMemory,
        path: None,
    }
}

/// Select and construct the process-wide resource cache.
#[cfg(unix)]
pub fn create_cache(opts: &DiskCacheOptions, arena: &MemoryArena) -> CreatedCache {
    if !opts.enabled {
        return in_memory(arena);
    }

    let mut clean_up = opts.clean_up;
    let mut used_temp_dir = false;
    let path = match &opts.path {
        Some(path) => path.clone(),
        None => {
            // A directory the caller did not choose must never be left
            // behind, whatever the cleanup flag says.
            used_temp_dir = true;
            clean_up = true;
            match allocate_temp_dir() {
                Some(path) => path,
                None => {
                    warn!(
                        "no disk cache path given and no temp directory available, \
                         falling back to in-memory cache"
                    );
                    return in_memory(arena);
                }
            }
        }
    };

    let cache = match OnDiskResourceCache::open(&path, clean_up) {
        Ok(cache) => cache,
        Err(e) => {
            warn!(error = %e, "on-disk cache creation failed, falling back to in-memory cache");
            return in_memory(arena);
        }
    };
    info!(path = %path.display(), "on-disk cache created");

    if clean_up {
        info!("on-disk cache files will be cleaned up when the server exits");
        if opts.spawn_watchdog {
            if let Err(e) = crate::watchdog::spawn_cleaner(&path, used_temp_dir) {
                warn!(error = %e, "could not spawn cache cleanup watchdog");
            }
        }
    }

    CreatedCache {
        cache: Arc::new(cache),
        kind: CacheKind::OnDisk,
        path: Some(path),
    }
}

/// On-disk caching is not supported on this platform.
#[cfg(not(unix))]
pub fn create_cache(opts: &DiskCacheOptions, arena: &MemoryArena) -> CreatedCache {
    if opts.enabled {
        warn!("on-disk cache not supported on this platform, using in-memory cache");
    }
    in_memory(arena)
}

#[cfg(unix)]
fn allocate_temp_dir() -> Option<PathBuf> {
    match tempfile::Builder::new().prefix("replayd-cache.").tempdir() {
        // The watchdog owns deletion; detach the handle.
        Ok(dir) => Some(dir.keep()),
        Err(e) => {
            warn!(error = %e, "failed to create temp cache directory");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replayd_core::types::ResourceId;

    fn arena() -> MemoryArena {
        MemoryArena::reserve(&[64 * 1024]).unwrap()
    }

    fn opts() -> DiskCacheOptions {
        // Watchdog off: tests must not re-execute the test binary.
        DiskCacheOptions {
            spawn_watchdog: false,
            ..DiskCacheOptions::default()
        }
    }

    #[test]
    fn disabled_gives_in_memory() {
        let created = create_cache(&opts(), &arena());
        assert_eq!(created.kind, CacheKind::InMemory);
        assert!(created.path.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn enabled_with_path_gives_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let created = create_cache(
            &DiskCacheOptions {
                enabled: true,
                path: Some(dir.path().to_path_buf()),
                ..opts()
            },
            &arena(),
        );
        assert_eq!(created.kind, CacheKind::OnDisk);
        assert!(created.cache.store(&ResourceId::from("r"), b"data"));
        assert!(created.cache.contains(&ResourceId::from("r")));
    }

    #[cfg(unix)]
    #[test]
    fn enabled_without_path_allocates_a_temp_dir() {
        let created = create_cache(
            &DiskCacheOptions {
                enabled: true,
                ..opts()
            },
            &arena(),
        );
        assert_eq!(created.kind, CacheKind::OnDisk);
        let path = created.path.clone().unwrap();
        assert!(path.exists());
        // No watchdog in tests; remove the detached directory ourselves.
        drop(created);
        crate::watchdog::remove_tree(&path);
    }

    #[cfg(unix)]
    #[test]
    fn unwritable_path_falls_back_to_in_memory() {
        let created = create_cache(
            &DiskCacheOptions {
                enabled: true,
                path: Some(PathBuf::from("/proc/replayd-unwritable")),
                ..opts()
            },
            &arena(),
        );
        assert_eq!(created.kind, CacheKind::InMemory);
        assert!(created.cache.store(&ResourceId::from("r"), b"data"));
    }
}
