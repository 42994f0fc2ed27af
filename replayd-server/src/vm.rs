//! The payload-backed VM context.
//!
//! [`PayloadContext`] implements the orchestration-visible half of the
//! context lifecycle: it resolves a state id to its payload through the
//! connection's resource loader, checks the payload against the arena
//! bounds, warms the cache, and tracks priming. Execution of the opaque
//! instruction stream goes through the embedder's [`Interpreter`]; with
//! none configured the daemon runs in load/validate-only mode.

use replayd_core::arena::MemoryArena;
use replayd_core::cache::ResourceCache;
use replayd_core::context::{ContextFactory, Interpreter, VmContext};
use replayd_core::error::{ReplayError, Result};
use replayd_core::loader::ResourceLoader;
use replayd_core::types::{InterpretMode, ResourceId, StateId};
use std::sync::Arc;
use tracing::debug;

/// Builds a [`PayloadContext`] per connection.
pub struct PayloadContextFactory {
    arena: Arc<MemoryArena>,
    interpreter: Option<Arc<dyn Interpreter>>,
}

impl PayloadContextFactory {
    /// Create a factory over the process arena, with no interpreter
    /// (load/validate-only mode).
    pub fn new(arena: Arc<MemoryArena>) -> Self {
        Self {
            arena,
            interpreter: None,
        }
    }

    /// Attach the embedder's instruction-stream interpreter.
    #[must_use]
    pub fn with_interpreter(mut self, interpreter: Arc<dyn Interpreter>) -> Self {
        self.interpreter = Some(interpreter);
        self
    }
}

impl ContextFactory for PayloadContextFactory {
    fn create_context(&self, loader: Box<dyn ResourceLoader>) -> Result<Box<dyn VmContext>> {
        Ok(Box::new(PayloadContext {
            arena: Arc::clone(&self.arena),
            interpreter: self.interpreter.clone(),
            loader,
            state: StateId::none(),
            payload: Vec::new(),
            primed: false,
        }))
    }
}

/// A context holding one resolved payload at a time.
pub struct PayloadContext {
    arena: Arc<MemoryArena>,
    interpreter: Option<Arc<dyn Interpreter>>,
    loader: Box<dyn ResourceLoader>,
    state: StateId,
    payload: Vec<u8>,
    primed: bool,
}

impl PayloadContext {
    fn payload_id(state: &StateId) -> ResourceId {
        ResourceId::from(state.as_str())
    }
}

impl VmContext for PayloadContext {
    fn initialize(&mut self, state: &StateId) -> Result<()> {
        let payload =
            self.loader
                .fetch_one(&Self::payload_id(state))
                .map_err(|e| ReplayError::ContextInitialize {
                    state: state.clone(),
                    cause: e.to_string(),
                })?;
        if payload.len() > self.arena.size() {
            return Err(ReplayError::ArenaBounds {
                state: state.clone(),
                size: payload.len(),
                capacity: self.arena.size(),
            });
        }
        debug!(state = %state, bytes = payload.len(), "payload resolved");
        self.state = state.clone();
        self.payload = payload;
        self.primed = false;
        Ok(())
    }

    fn prefetch(&mut self, _cache: &dyn ResourceCache) -> Result<()> {
        if self.state.is_empty() {
            return Err(ReplayError::ContextNotInitialized);
        }
        // Pulls the payload through whatever cache backs the loader so a
        // later context initializing the same state hits instead of
        // fetching over the wire.
        self.loader.prefetch(&[Self::payload_id(&self.state)])
    }

    fn interpret(&mut self, mode: InterpretMode) -> Result<()> {
        if self.state.is_empty() {
            return Err(ReplayError::ContextNotInitialized);
        }
        if let Some(interpreter) = &self.interpreter {
            interpreter.execute(&self.state, &self.payload, mode)?;
        }
        self.primed = mode.is_priming();
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        self.state = StateId::none();
        self.payload.clear();
        self.primed = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use replayd_core::cache::InMemoryResourceCache;
    use replayd_core::loader::{CachedLoader, PassThroughLoader, ResourceProvider};
    use replayd_core::types::Resource;

    struct MapProvider(Mutex<Vec<(ResourceId, Vec<u8>)>>);

    impl ResourceProvider for MapProvider {
        fn fetch_resources(&self, ids: &[ResourceId]) -> Result<Vec<Resource>> {
            let map = self.0.lock();
            ids.iter()
                .map(|id| {
                    map.iter()
                        .find(|(k, _)| k == id)
                        .map(|(_, v)| Resource::new(id.clone(), v.clone()))
                        .ok_or_else(|| ReplayError::ResourceNotFound { id: id.clone() })
                })
                .collect()
        }
    }

    fn small_arena() -> Arc<MemoryArena> {
        Arc::new(MemoryArena::reserve(&[4096]).unwrap())
    }

    fn context_over(
        provider: Arc<dyn ResourceProvider>,
        arena: Arc<MemoryArena>,
    ) -> Box<dyn VmContext> {
        let factory = PayloadContextFactory::new(arena);
        factory
            .create_context(Box::new(PassThroughLoader::new(provider)))
            .unwrap()
    }

    #[test]
    fn initialize_resolves_the_payload() {
        let provider = Arc::new(MapProvider(Mutex::new(vec![(
            "frame-1".into(),
            b"cmds".to_vec(),
        )])));
        let mut ctx = context_over(provider, small_arena());
        ctx.initialize(&"frame-1".into()).unwrap();
        ctx.interpret(InterpretMode::Terminating).unwrap();
        ctx.cleanup().unwrap();
    }

    #[test]
    fn missing_payload_fails_initialization() {
        let provider = Arc::new(MapProvider(Mutex::new(Vec::new())));
        let mut ctx = context_over(provider, small_arena());
        let err = ctx.initialize(&"frame-1".into()).unwrap_err();
        assert!(matches!(err, ReplayError::ContextInitialize { .. }));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let provider = Arc::new(MapProvider(Mutex::new(vec![(
            "huge".into(),
            vec![0u8; 8192],
        )])));
        let mut ctx = context_over(provider, small_arena());
        let err = ctx.initialize(&"huge".into()).unwrap_err();
        assert!(matches!(err, ReplayError::ArenaBounds { .. }));
    }

    #[test]
    fn interpret_requires_initialization() {
        let provider = Arc::new(MapProvider(Mutex::new(Vec::new())));
        let mut ctx = context_over(provider, small_arena());
        let err = ctx.interpret(InterpretMode::Terminating).unwrap_err();
        assert!(matches!(err, ReplayError::ContextNotInitialized));
    }

    #[test]
    fn prefetch_warms_the_backing_cache() {
        let provider = Arc::new(MapProvider(Mutex::new(vec![(
            "frame-1".into(),
            b"cmds".to_vec(),
        )])));
        let cache = Arc::new(InMemoryResourceCache::with_capacity(1024));
        let loader = CachedLoader::new(
            cache.clone(),
            Some(Box::new(PassThroughLoader::new(provider))),
        );
        let factory = PayloadContextFactory::new(small_arena());
        let mut ctx = factory.create_context(Box::new(loader)).unwrap();
        ctx.initialize(&"frame-1".into()).unwrap();
        ctx.prefetch(cache.as_ref()).unwrap();
        assert!(cache.contains(&"frame-1".into()));
    }
}
