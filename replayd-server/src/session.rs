//! The per-connection request loop.
//!
//! Each accepted connection runs one [`Session`] on its own thread. The
//! session classifies requests, drives its VM context through the
//! initialize/prefetch/interpret/cleanup lifecycle, and cooperates with
//! the process-wide prewarm record so repeated replays of the same
//! captured state can skip their expensive common prefix.

use crate::prewarm::{PrewarmRecord, SharedContext, SharedReplayState};
use crate::protocol::Request;
use crate::service::ReplayService;
use parking_lot::Mutex;
use replayd_core::cache::ResourceCache;
use replayd_core::context::VmContext;
use replayd_core::crash::CrashHandler;
use replayd_core::error::Result;
use replayd_core::types::{InterpretMode, StateId};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// One client connection's request loop.
pub struct Session {
    service: Arc<dyn ReplayService>,
    context: SharedContext,
    cache: Option<Arc<dyn ResourceCache>>,
    shared: Arc<SharedReplayState>,
    crash: CrashHandler,
}

impl Session {
    /// Assemble a session around an already-created context.
    pub fn new(
        service: Arc<dyn ReplayService>,
        context: Box<dyn VmContext>,
        cache: Option<Arc<dyn ResourceCache>>,
        shared: Arc<SharedReplayState>,
        crash: CrashHandler,
    ) -> Self {
        Self {
            service,
            context: Arc::new(Mutex::new(context)),
            cache,
            shared,
            crash,
        }
    }

    /// Serve requests until end of stream or a fatal failure.
    pub fn run(&self) {
        self.upload_pending_crashes();
        loop {
            let Some(request) = self.service.next_request() else {
                info!("no more requests");
                break;
            };
            debug!(request = ?request, "got request");
            let keep_going = match request {
                Request::Replay {
                    replay_id,
                    dependent_id,
                } => self.handle_replay(replay_id, dependent_id),
                Request::Prewarm {
                    prerun_id,
                    cleanup_id,
                } => self.handle_prewarm(prerun_id, cleanup_id),
                Request::Unknown => {
                    warn!("ignoring unknown request kind");
                    true
                }
            };
            if !keep_going {
                warn!("connection is in an untrustworthy state, closing");
                return;
            }
        }
    }

    /// Run one replay of `state` outside the request loop. Used by
    /// archive mode, where there is exactly one replay and no client to
    /// keep the connection alive for.
    pub fn replay_once(&self, state: &StateId, mode: InterpretMode) -> Result<()> {
        let _record = self.shared.lock();
        let mut context = self.context.lock();
        context.initialize(state)?;
        if let Some(cache) = &self.cache {
            if let Err(e) = context.prefetch(cache.as_ref()) {
                warn!(error = %e, "prefetch failed, resources will load on demand");
            }
        }
        let outcome = context.interpret(mode);
        let cleaned = context.cleanup();
        if let Err(e) = &cleaned {
            error!(error = %e, "cleanup failed after one-shot replay");
        }
        // An interpretation failure takes precedence, but a failed
        // cleanup is a failure of the run even when interpretation
        // succeeded.
        outcome.and(cleaned)
    }

    /// Handle a REPLAY request. Returns false when the connection must
    /// be torn down.
    fn handle_replay(&self, replay_id: StateId, dependent_id: StateId) -> bool {
        // Serializes the memory arena and the crash handler across every
        // connection for the whole replay.
        let mut record = self.shared.lock();

        if record.current_state != dependent_id {
            debug!(dependent = %dependent_id, "moving into the dependent state");
            if let Err(e) = self.cleanup_state(&mut record) {
                warn!(error = %e, "standby cleanup failed before replay");
            }
            if !dependent_id.is_empty() {
                // One-shot prime: not registered as a future standby.
                if let Err(e) = self.prime_state(&mut record, &dependent_id, &StateId::none()) {
                    error!(state = %dependent_id, error = %e, "priming dependent state failed");
                }
            }
        } else {
            info!(dependent = %dependent_id, "already in the dependent state");
        }

        info!(replay = %replay_id, "running replay");
        {
            let mut context = self.context.lock();
            if let Err(e) = context.initialize(&replay_id) {
                // Recoverable: abandon this request, keep the connection.
                error!(replay = %replay_id, error = %e, "replay context initialization failed");
                return true;
            }
            info!("replay context initialized successfully");
            if let Some(cache) = &self.cache {
                if let Err(e) = context.prefetch(cache.as_ref()) {
                    warn!(error = %e, "prefetch failed, resources will load on demand");
                }
            }
            match context.interpret(InterpretMode::Terminating) {
                Ok(()) => info!(replay = %replay_id, "replay finished successfully"),
                Err(e) => error!(replay = %replay_id, error = %e, "replay failed"),
            }
        }

        // The client is told the replay is over regardless of outcome.
        if let Err(e) = self.service.send_replay_finished() {
            warn!(error = %e, "failed to signal replay finished");
        }

        if let Err(e) = self.context.lock().cleanup() {
            error!(error = %e, "replay cleanup failed");
            return false;
        }
        record.current_state = StateId::none();

        // Advance the registered standby while this connection idles.
        if !record.primed_state.is_empty() && !record.cleanup_id.is_empty() {
            if let Some(standby) = record.standby_service() {
                standby.prime_now(record.primed_state.clone(), record.cleanup_id.clone());
            }
        }
        true
    }

    /// Handle a PREWARM request. Returns false when the connection must
    /// be torn down.
    fn handle_prewarm(&self, prerun_id: StateId, cleanup_id: StateId) -> bool {
        let mut record = self.shared.lock();

        if record.current_state == prerun_id {
            info!(state = %prerun_id, "already primed in the requested state");
            record.cleanup_id = cleanup_id;
            return true;
        }
        if !record.current_state.is_empty() {
            if let Err(e) = self.cleanup_state(&mut record) {
                error!(error = %e, "could not clean up after previous replay");
                return false;
            }
        }
        if let Err(e) = self.prime_state(&mut record, &prerun_id, &cleanup_id) {
            error!(state = %prerun_id, error = %e, "could not prime state");
            return false;
        }
        true
    }

    /// Initialize this session's context into `state`, prefetch, and
    /// interpret in priming mode. A non-empty `cleanup` id registers the
    /// context as the process-wide standby, replacing any previous one.
    fn prime_state(
        &self,
        record: &mut PrewarmRecord,
        state: &StateId,
        cleanup: &StateId,
    ) -> Result<()> {
        info!(state = %state, "priming");
        {
            let mut context = self.context.lock();
            context.initialize(state)?;
            if let Some(cache) = &self.cache {
                if let Err(e) = context.prefetch(cache.as_ref()) {
                    warn!(error = %e, "prefetch failed while priming");
                }
            }
            context.interpret(InterpretMode::Priming)?;
        }
        info!(state = %state, "priming finished successfully");

        if !cleanup.is_empty() {
            record.register_standby(
                state.clone(),
                cleanup.clone(),
                &self.service,
                &self.context,
            );
        }
        Ok(())
    }

    /// Replay the registered cleanup id on the standby context and reset
    /// the prewarm record. A missing or torn-down standby is nothing to
    /// clean. On any failed step the record is left untouched.
    fn cleanup_state(&self, record: &mut PrewarmRecord) -> Result<()> {
        if record.primed_state.is_empty() {
            return Ok(());
        }
        let Some(standby) = record.standby_context() else {
            debug!("standby connection is gone, dropping its registration");
            record.reset();
            return Ok(());
        };
        let cleanup_id = record.cleanup_id.clone();
        {
            let mut context = standby.lock();
            context.initialize(&cleanup_id)?;
            if let Some(cache) = &self.cache {
                if let Err(e) = context.prefetch(cache.as_ref()) {
                    warn!(error = %e, "prefetch failed while cleaning standby state");
                }
            }
            context.interpret(InterpretMode::Terminating)?;
            context.cleanup()?;
        }
        record.reset();
        Ok(())
    }

    fn upload_pending_crashes(&self) {
        for report in self.crash.take_reports() {
            if let Err(e) = self.service.send_crash_report(&report) {
                warn!(error = %e, "failed to upload crash report");
            }
        }
    }
}
