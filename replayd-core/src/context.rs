//! The VM-context lifecycle.
//!
//! The orchestrator drives every context through the same four calls:
//! `initialize` into a captured state, `prefetch` its resources,
//! `interpret` (to completion, or in priming mode to hold a warm prefix),
//! and `cleanup`. What happens *inside* interpretation is the
//! interpreter's business; the orchestrator only consumes the outcome.

use crate::cache::ResourceCache;
use crate::error::Result;
use crate::loader::ResourceLoader;
use crate::types::{InterpretMode, StateId};

/// One logical replay stream's interpreter state.
pub trait VmContext: Send {
    /// Initialize the context into the given captured state.
    fn initialize(&mut self, state: &StateId) -> Result<()>;

    /// Warm the given cache with the resources the initialized state
    /// will need.
    fn prefetch(&mut self, cache: &dyn ResourceCache) -> Result<()>;

    /// Run the instruction stream. [`InterpretMode::Priming`] stops at
    /// the end of the common prefix and keeps the context warm.
    fn interpret(&mut self, mode: InterpretMode) -> Result<()>;

    /// Tear down the context's hold on shared device state. A failure
    /// here leaves that state untrustworthy; callers treat it as fatal
    /// to the connection.
    fn cleanup(&mut self) -> Result<()>;
}

/// Creates one [`VmContext`] per accepted connection.
///
/// The factory holds the process-wide collaborators (arena, interpreter);
/// the per-connection resource loader is handed in at creation time.
pub trait ContextFactory: Send + Sync {
    /// Create a context over the given loader. Called once when a
    /// connection is accepted.
    fn create_context(&self, loader: Box<dyn ResourceLoader>) -> Result<Box<dyn VmContext>>;
}

/// Executes a decoded payload.
///
/// The daemon treats payload bytes as opaque; the embedder supplies the
/// actual instruction-stream execution through this seam.
pub trait Interpreter: Send + Sync {
    /// Execute `payload` for `state`. In priming mode, run only the
    /// non-terminating prefix.
    fn execute(&self, state: &StateId, payload: &[u8], mode: InterpretMode) -> Result<()>;
}
