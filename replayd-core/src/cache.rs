//! Resource caches.
//!
//! Two implementations back the daemon: an in-memory LRU bounded by a
//! byte budget derived from the arena, and an on-disk cache kept as a
//! `resources.index` / `resources.data` pair so an exported archive can
//! be replayed offline with the same code path.
//!
//! Caches are shared by every concurrent connection and are internally
//! synchronized; callers never take the device lock to use them.

use crate::error::{ReplayError, Result};
use crate::types::ResourceId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File name of the on-disk cache index.
pub const INDEX_FILE: &str = "resources.index";
/// File name of the on-disk cache data blob.
pub const DATA_FILE: &str = "resources.data";

/// A process-wide store of replay resources.
pub trait ResourceCache: Send + Sync {
    /// Store a resource. Returns false if the resource was rejected
    /// (for example because it exceeds the cache budget); rejection is
    /// never an error, the pass-through path still works.
    fn store(&self, id: &ResourceId, data: &[u8]) -> bool;

    /// Load a resource if present.
    fn load(&self, id: &ResourceId) -> Option<Vec<u8>>;

    /// True if the resource is present.
    fn contains(&self, id: &ResourceId) -> bool;

    /// Destructively remove all cached resources, including any backing
    /// files.
    fn purge(&self);
}

// =============================================================================
// In-memory cache
// =============================================================================

#[derive(Default)]
struct InMemoryInner {
    entries: HashMap<ResourceId, Vec<u8>>,
    // Least-recently-used id at the front.
    order: VecDeque<ResourceId>,
    used: usize,
}

/// An LRU cache bounded by a byte budget.
///
/// The budget is conventionally the arena size: resources the interpreter
/// could never map into the arena are not worth holding.
pub struct InMemoryResourceCache {
    capacity: usize,
    inner: Mutex<InMemoryInner>,
}

impl InMemoryResourceCache {
    /// Create a cache with the given byte budget.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(InMemoryInner::default()),
        }
    }

    /// The configured byte budget.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently held.
    pub fn used(&self) -> usize {
        self.inner.lock().used
    }
}

impl InMemoryInner {
    fn touch(&mut self, id: &ResourceId) {
        if let Some(pos) = self.order.iter().position(|e| e == id) {
            self.order.remove(pos);
            self.order.push_back(id.clone());
        }
    }

    fn evict_until(&mut self, budget: usize) {
        while self.used > budget {
            let Some(victim) = self.order.pop_front() else {
                break;
            };
            if let Some(data) = self.entries.remove(&victim) {
                self.used -= data.len();
                debug!(resource = %victim, "evicted from in-memory cache");
            }
        }
    }
}

impl ResourceCache for InMemoryResourceCache {
    fn store(&self, id: &ResourceId, data: &[u8]) -> bool {
        if data.len() > self.capacity {
            return false;
        }
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.remove(id) {
            inner.used -= old.len();
            if let Some(pos) = inner.order.iter().position(|e| e == id) {
                inner.order.remove(pos);
            }
        }
        inner.used += data.len();
        inner.entries.insert(id.clone(), data.to_vec());
        inner.order.push_back(id.clone());
        let budget = self.capacity;
        inner.evict_until(budget);
        true
    }

    fn load(&self, id: &ResourceId) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        let data = inner.entries.get(id).cloned()?;
        inner.touch(id);
        Some(data)
    }

    fn contains(&self, id: &ResourceId) -> bool {
        self.inner.lock().entries.contains_key(id)
    }

    fn purge(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
        inner.used = 0;
    }
}

// =============================================================================
// On-disk cache
// =============================================================================

/// Location of one resource inside the data file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Span {
    offset: u64,
    size: u64,
}

struct OnDiskInner {
    index: HashMap<ResourceId, Span>,
    data: File,
    data_len: u64,
}

/// A cache rooted at a directory holding a `resources.index` /
/// `resources.data` pair.
///
/// The index is a JSON map rewritten atomically (write-then-rename) on
/// every store, so a cache directory is always reopenable even after an
/// ungraceful exit; at worst the tail of the data file is orphaned.
pub struct OnDiskResourceCache {
    root: PathBuf,
    purge_on_drop: bool,
    inner: Mutex<OnDiskInner>,
}

impl OnDiskResourceCache {
    /// Open (or create) a cache rooted at `root`. An existing index is
    /// loaded, so a previously written cache or an exported archive can
    /// be served directly.
    pub fn open(root: impl Into<PathBuf>, purge_on_drop: bool) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| ReplayError::CacheOpen {
            path: root.clone(),
            cause: e.to_string(),
        })?;

        let index_path = root.join(INDEX_FILE);
        let index: HashMap<ResourceId, Span> = match fs::read(&index_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| ReplayError::CacheOpen {
                path: index_path.clone(),
                cause: format!("corrupt index: {e}"),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(ReplayError::CacheOpen {
                    path: index_path,
                    cause: e.to_string(),
                });
            }
        };

        let data_path = root.join(DATA_FILE);
        let data = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&data_path)
            .map_err(|e| ReplayError::CacheOpen {
                path: data_path.clone(),
                cause: e.to_string(),
            })?;
        let data_len = data
            .metadata()
            .map_err(|e| ReplayError::CacheIo {
                path: data_path,
                cause: e.to_string(),
            })?
            .len();

        Ok(Self {
            root,
            purge_on_drop,
            inner: Mutex::new(OnDiskInner {
                index,
                data,
                data_len,
            }),
        })
    }

    /// The cache directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of indexed resources.
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// True if no resources are indexed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write_index(&self, index: &HashMap<ResourceId, Span>) -> Result<()> {
        let tmp = self.root.join(format!("{INDEX_FILE}.tmp"));
        let bytes = serde_json::to_vec(index).map_err(|e| ReplayError::CacheIo {
            path: tmp.clone(),
            cause: e.to_string(),
        })?;
        fs::write(&tmp, bytes).map_err(|e| ReplayError::CacheIo {
            path: tmp.clone(),
            cause: e.to_string(),
        })?;
        fs::rename(&tmp, self.root.join(INDEX_FILE)).map_err(|e| ReplayError::CacheIo {
            path: tmp,
            cause: e.to_string(),
        })
    }

    fn try_store(&self, id: &ResourceId, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let offset = inner.data_len;
        inner.data.write_all(data).map_err(|e| ReplayError::CacheIo {
            path: self.root.join(DATA_FILE),
            cause: e.to_string(),
        })?;
        inner.data_len += data.len() as u64;
        inner.index.insert(
            id.clone(),
            Span {
                offset,
                size: data.len() as u64,
            },
        );
        self.write_index(&inner.index)
    }
}

impl ResourceCache for OnDiskResourceCache {
    fn store(&self, id: &ResourceId, data: &[u8]) -> bool {
        match self.try_store(id, data) {
            Ok(()) => true,
            Err(e) => {
                warn!(resource = %id, error = %e, "on-disk cache store failed");
                false
            }
        }
    }

    fn load(&self, id: &ResourceId) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        let span = *inner.index.get(id)?;
        let mut buf = vec![0u8; span.size as usize];
        let read = (|| -> std::io::Result<()> {
            inner.data.seek(SeekFrom::Start(span.offset))?;
            inner.data.read_exact(&mut buf)
        })();
        match read {
            Ok(()) => Some(buf),
            Err(e) => {
                warn!(resource = %id, error = %e, "on-disk cache read failed");
                None
            }
        }
    }

    fn contains(&self, id: &ResourceId) -> bool {
        self.inner.lock().index.contains_key(id)
    }

    fn purge(&self) {
        let mut inner = self.inner.lock();
        inner.index.clear();
        inner.data_len = 0;
        // Racing with an external cleaner is fine, missing files are
        // already gone.
        purge_cache_files(&self.root);
    }
}

impl Drop for OnDiskResourceCache {
    fn drop(&mut self) {
        if self.purge_on_drop {
            purge_cache_files(&self.root);
        }
    }
}

/// Remove the index/data pair under `root`, skipping entries that have
/// already been removed by someone else.
pub fn purge_cache_files(root: &Path) {
    for name in [INDEX_FILE, DATA_FILE] {
        match fs::remove_file(root.join(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(file = name, error = %e, "failed to remove cache file"),
        }
    }
}
