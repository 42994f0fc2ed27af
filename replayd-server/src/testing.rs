//! Test doubles for orchestration tests.
//!
//! [`ScriptedService`] replaces the transport with a canned request
//! queue and records outbound signals; [`ScriptedFactory`] produces
//! contexts whose lifecycle calls are logged and whose outcomes can be
//! failed per state id. Both are used by this crate's integration tests
//! and are exported for embedders testing their own wiring.

use crate::protocol::Request;
use crate::service::ReplayService;
use parking_lot::Mutex;
use replayd_core::cache::ResourceCache;
use replayd_core::context::{ContextFactory, VmContext};
use replayd_core::crash::CrashReport;
use replayd_core::error::{ReplayError, Result};
use replayd_core::loader::{ResourceLoader, ResourceProvider};
use replayd_core::types::{InterpretMode, Resource, ResourceId, StateId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

// =============================================================================
// Scripted service
// =============================================================================

/// A transport double fed from a canned queue.
#[derive(Default)]
pub struct ScriptedService {
    queue: Mutex<VecDeque<Request>>,
    finished: AtomicUsize,
    prime_now_calls: Mutex<Vec<(StateId, StateId)>>,
    crash_reports: Mutex<Vec<CrashReport>>,
    resources: Mutex<HashMap<ResourceId, Vec<u8>>>,
}

impl ScriptedService {
    /// An empty service: immediate end of stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// A service that will deliver the given requests in order.
    pub fn with_requests(requests: impl IntoIterator<Item = Request>) -> Self {
        Self {
            queue: Mutex::new(requests.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Append a request to the queue.
    pub fn push(&self, request: Request) {
        self.queue.lock().push_back(request);
    }

    /// Make a resource fetchable.
    pub fn provide_resource(&self, id: impl Into<ResourceId>, data: impl Into<Vec<u8>>) {
        self.resources.lock().insert(id.into(), data.into());
    }

    /// How many times the replay-finished signal was sent.
    pub fn finished_count(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    /// Every `prime_now` directive received, in order.
    pub fn prime_now_calls(&self) -> Vec<(StateId, StateId)> {
        self.prime_now_calls.lock().clone()
    }

    /// Crash reports shipped through this service.
    pub fn crash_reports(&self) -> Vec<CrashReport> {
        self.crash_reports.lock().clone()
    }
}

impl ReplayService for ScriptedService {
    fn next_request(&self) -> Option<Request> {
        self.queue.lock().pop_front()
    }

    fn send_replay_finished(&self) -> Result<()> {
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn prime_now(&self, state: StateId, cleanup: StateId) {
        self.prime_now_calls.lock().push((state, cleanup));
    }

    fn send_crash_report(&self, report: &CrashReport) -> Result<()> {
        self.crash_reports.lock().push(report.clone());
        Ok(())
    }
}

impl ResourceProvider for ScriptedService {
    fn fetch_resources(&self, ids: &[ResourceId]) -> Result<Vec<Resource>> {
        let resources = self.resources.lock();
        ids.iter()
            .map(|id| {
                resources
                    .get(id)
                    .map(|data| Resource::new(id.clone(), data.clone()))
                    .ok_or_else(|| ReplayError::ResourceNotFound { id: id.clone() })
            })
            .collect()
    }
}

// =============================================================================
// Scripted contexts
// =============================================================================

/// One observed lifecycle call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextCall {
    /// `initialize` with the given state.
    Initialize(StateId),
    /// `prefetch` while holding the given state.
    Prefetch(StateId),
    /// `interpret` of the given state; true when priming.
    Interpret(StateId, bool),
    /// `cleanup` of the given state.
    Cleanup(StateId),
}

#[derive(Default)]
struct Script {
    calls: Mutex<Vec<ContextCall>>,
    fail_initialize: Mutex<HashSet<StateId>>,
    fail_interpret: Mutex<HashSet<StateId>>,
    fail_cleanup_of: Mutex<HashSet<StateId>>,
}

/// Produces [`VmContext`] doubles sharing one call log.
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    script: Arc<Script>,
}

impl ScriptedFactory {
    /// A factory whose contexts succeed at everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every `initialize` of the given state.
    pub fn fail_initialize(&self, state: impl Into<StateId>) {
        self.script.fail_initialize.lock().insert(state.into());
    }

    /// Fail every `interpret` of the given state.
    pub fn fail_interpret(&self, state: impl Into<StateId>) {
        self.script.fail_interpret.lock().insert(state.into());
    }

    /// Fail `cleanup` whenever the context holds the given state.
    pub fn fail_cleanup_of(&self, state: impl Into<StateId>) {
        self.script.fail_cleanup_of.lock().insert(state.into());
    }

    /// The complete call log, in order, across all contexts.
    pub fn calls(&self) -> Vec<ContextCall> {
        self.script.calls.lock().clone()
    }

    /// How many times `initialize(state)` was observed.
    pub fn initialize_count(&self, state: impl Into<StateId>) -> usize {
        let state = state.into();
        self.calls()
            .iter()
            .filter(|c| matches!(c, ContextCall::Initialize(s) if *s == state))
            .count()
    }

    /// Create a context double directly, bypassing the factory trait.
    pub fn make_context(&self) -> Box<dyn VmContext> {
        Box::new(ScriptedContext {
            script: Arc::clone(&self.script),
            state: StateId::none(),
        })
    }
}

impl ContextFactory for ScriptedFactory {
    fn create_context(&self, _loader: Box<dyn ResourceLoader>) -> Result<Box<dyn VmContext>> {
        Ok(self.make_context())
    }
}

struct ScriptedContext {
    script: Arc<Script>,
    state: StateId,
}

impl ScriptedContext {
    fn log(&self, call: ContextCall) {
        self.script.calls.lock().push(call);
    }
}

impl VmContext for ScriptedContext {
    fn initialize(&mut self, state: &StateId) -> Result<()> {
        self.log(ContextCall::Initialize(state.clone()));
        if self.script.fail_initialize.lock().contains(state) {
            return Err(ReplayError::ContextInitialize {
                state: state.clone(),
                cause: "scripted failure".into(),
            });
        }
        self.state = state.clone();
        Ok(())
    }

    fn prefetch(&mut self, _cache: &dyn ResourceCache) -> Result<()> {
        self.log(ContextCall::Prefetch(self.state.clone()));
        Ok(())
    }

    fn interpret(&mut self, mode: InterpretMode) -> Result<()> {
        self.log(ContextCall::Interpret(self.state.clone(), mode.is_priming()));
        if self.script.fail_interpret.lock().contains(&self.state) {
            return Err(ReplayError::Interpret {
                state: self.state.clone(),
                cause: "scripted failure".into(),
            });
        }
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        self.log(ContextCall::Cleanup(self.state.clone()));
        if self.script.fail_cleanup_of.lock().contains(&self.state) {
            return Err(ReplayError::ContextCleanup {
                cause: format!("scripted failure cleaning {}", self.state),
            });
        }
        self.state = StateId::none();
        Ok(())
    }
}
