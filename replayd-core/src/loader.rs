//! Resource loading.
//!
//! A context never talks to the transport or the cache directly; it goes
//! through a [`ResourceLoader`]. Server connections use a [`CachedLoader`]
//! over a [`PassThroughLoader`] when caching is enabled, a bare
//! [`PassThroughLoader`] otherwise. Archive replay uses the same layering
//! over a provider that serves nothing but the payload file: everything
//! else must already sit in the exported cache.

use crate::cache::ResourceCache;
use crate::error::{ReplayError, Result};
use crate::types::{Resource, ResourceId};
use std::sync::Arc;
use tracing::debug;

/// Something that can produce resource bytes on demand, typically the
/// connection back to the controlling client.
pub trait ResourceProvider: Send + Sync {
    /// Fetch the given resources, in order.
    fn fetch_resources(&self, ids: &[ResourceId]) -> Result<Vec<Resource>>;
}

/// Loads resources for a VM context.
pub trait ResourceLoader: Send {
    /// Load a single resource.
    fn fetch_one(&self, id: &ResourceId) -> Result<Vec<u8>>;

    /// Warm whatever cache sits behind this loader. The default loader
    /// has nothing to warm.
    fn prefetch(&self, ids: &[ResourceId]) -> Result<()> {
        let _ = ids;
        Ok(())
    }
}

/// Fetches straight from a provider with no caching at all.
pub struct PassThroughLoader {
    provider: Arc<dyn ResourceProvider>,
}

impl PassThroughLoader {
    /// Create a loader over the given provider.
    pub fn new(provider: Arc<dyn ResourceProvider>) -> Self {
        Self { provider }
    }
}

impl ResourceLoader for PassThroughLoader {
    fn fetch_one(&self, id: &ResourceId) -> Result<Vec<u8>> {
        let mut fetched = self.provider.fetch_resources(std::slice::from_ref(id))?;
        match fetched.pop() {
            Some(resource) => Ok(resource.data),
            None => Err(ReplayError::ResourceNotFound { id: id.clone() }),
        }
    }
}

/// Serves from a cache, pulling misses through an optional fallback
/// loader and caching the result.
pub struct CachedLoader {
    cache: Arc<dyn ResourceCache>,
    fallback: Option<Box<dyn ResourceLoader>>,
}

impl CachedLoader {
    /// Create a loader over `cache`, with `fallback` consulted on miss.
    pub fn new(cache: Arc<dyn ResourceCache>, fallback: Option<Box<dyn ResourceLoader>>) -> Self {
        Self { cache, fallback }
    }
}

impl ResourceLoader for CachedLoader {
    fn fetch_one(&self, id: &ResourceId) -> Result<Vec<u8>> {
        if let Some(data) = self.cache.load(id) {
            debug!(resource = %id, "cache hit");
            return Ok(data);
        }
        let Some(fallback) = &self.fallback else {
            return Err(ReplayError::ResourceNotFound { id: id.clone() });
        };
        let data = fallback.fetch_one(id)?;
        self.cache.store(id, &data);
        Ok(data)
    }

    fn prefetch(&self, ids: &[ResourceId]) -> Result<()> {
        let Some(fallback) = &self.fallback else {
            // Everything that exists is already in the cache.
            return Ok(());
        };
        for id in ids {
            if self.cache.contains(id) {
                continue;
            }
            let data = fallback.fetch_one(id)?;
            self.cache.store(id, &data);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryResourceCache;
    use parking_lot::Mutex;

    struct CountingProvider {
        fetches: Mutex<usize>,
    }

    impl ResourceProvider for CountingProvider {
        fn fetch_resources(&self, ids: &[ResourceId]) -> Result<Vec<Resource>> {
            *self.fetches.lock() += ids.len();
            Ok(ids
                .iter()
                .map(|id| Resource::new(id.clone(), id.as_str().as_bytes().to_vec()))
                .collect())
        }
    }

    #[test]
    fn pass_through_fetches_every_time() {
        let provider = Arc::new(CountingProvider {
            fetches: Mutex::new(0),
        });
        let loader = PassThroughLoader::new(provider.clone());
        loader.fetch_one(&"r1".into()).unwrap();
        loader.fetch_one(&"r1".into()).unwrap();
        assert_eq!(*provider.fetches.lock(), 2);
    }

    #[test]
    fn cached_loader_fetches_misses_once() {
        let provider = Arc::new(CountingProvider {
            fetches: Mutex::new(0),
        });
        let cache = Arc::new(InMemoryResourceCache::with_capacity(1024));
        let loader = CachedLoader::new(
            cache,
            Some(Box::new(PassThroughLoader::new(provider.clone()))),
        );
        assert_eq!(loader.fetch_one(&"r1".into()).unwrap(), b"r1");
        assert_eq!(loader.fetch_one(&"r1".into()).unwrap(), b"r1");
        assert_eq!(*provider.fetches.lock(), 1);
    }

    #[test]
    fn cached_loader_without_fallback_reports_missing() {
        let cache = Arc::new(InMemoryResourceCache::with_capacity(1024));
        cache.store(&"present".into(), b"data");
        let loader = CachedLoader::new(cache, None);
        assert!(loader.fetch_one(&"present".into()).is_ok());
        let err = loader.fetch_one(&"absent".into()).unwrap_err();
        assert!(matches!(err, ReplayError::ResourceNotFound { .. }));
    }

    #[test]
    fn prefetch_skips_cached_entries() {
        let provider = Arc::new(CountingProvider {
            fetches: Mutex::new(0),
        });
        let cache = Arc::new(InMemoryResourceCache::with_capacity(1024));
        cache.store(&"warm".into(), b"w");
        let loader = CachedLoader::new(
            cache.clone(),
            Some(Box::new(PassThroughLoader::new(provider.clone()))),
        );
        loader
            .prefetch(&["warm".into(), "cold".into()])
            .unwrap();
        assert_eq!(*provider.fetches.lock(), 1);
        assert!(cache.contains(&"cold".into()));
    }
}
