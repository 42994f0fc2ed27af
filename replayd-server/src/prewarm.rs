//! The prewarm record and the shared device lock.
//!
//! One record exists per orchestrator. It describes the single standby
//! context kept primed for opportunistic reuse, and it lives inside the
//! same mutex that serializes access to the memory arena and the crash
//! handler, so its fields are only ever visible fully updated.

use crate::service::ReplayService;
use parking_lot::{Mutex, MutexGuard};
use replayd_core::context::VmContext;
use replayd_core::types::StateId;
use std::sync::{Arc, Weak};

/// A session's context handle, shareable with the prewarm record.
pub type SharedContext = Arc<Mutex<Box<dyn VmContext>>>;

/// The process-wide standby bookkeeping.
///
/// The back-references to the standby connection are weak: the record
/// never keeps a torn-down connection alive, and a dead reference is
/// treated as "no standby".
#[derive(Default)]
pub struct PrewarmRecord {
    /// State the standby context has been primed into; empty if none.
    pub primed_state: StateId,
    /// Id to replay when the standby state is replaced.
    pub cleanup_id: StateId,
    /// State the active context currently holds.
    pub current_state: StateId,
    primed_service: Option<Weak<dyn ReplayService>>,
    primed_context: Option<Weak<Mutex<Box<dyn VmContext>>>>,
}

impl PrewarmRecord {
    /// Register a session's context as the process-wide standby,
    /// replacing any previous registration. At most one standby exists
    /// at a time.
    pub fn register_standby(
        &mut self,
        state: StateId,
        cleanup: StateId,
        service: &Arc<dyn ReplayService>,
        context: &SharedContext,
    ) {
        self.current_state = state.clone();
        self.primed_state = state;
        self.cleanup_id = cleanup;
        self.primed_service = Some(Arc::downgrade(service));
        self.primed_context = Some(Arc::downgrade(context));
    }

    /// The standby context, if one is registered and still alive.
    pub fn standby_context(&self) -> Option<SharedContext> {
        if self.primed_state.is_empty() {
            return None;
        }
        self.primed_context.as_ref()?.upgrade()
    }

    /// The standby connection's service, if still alive.
    pub fn standby_service(&self) -> Option<Arc<dyn ReplayService>> {
        self.primed_service.as_ref()?.upgrade()
    }

    /// Restore the empty record.
    pub fn reset(&mut self) {
        *self = PrewarmRecord::default();
    }
}

/// The single lock serializing every connection's access to process-wide
/// device state.
///
/// The arena and the crash handler are singletons referenced by every
/// connection's context, so REPLAY and PREWARM critical sections hold
/// this lock for their entire duration. Lock order is fixed: this lock
/// first, then a context's own mutex.
#[derive(Default)]
pub struct SharedReplayState {
    record: Mutex<PrewarmRecord>,
}

impl SharedReplayState {
    /// Create the shared state for one orchestrator.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Enter a critical section. Blocks until every other connection has
    /// left theirs.
    pub fn lock(&self) -> MutexGuard<'_, PrewarmRecord> {
        self.record.lock()
    }
}
