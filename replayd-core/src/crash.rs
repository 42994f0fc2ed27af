//! Panic capture for postback to the controlling client.
//!
//! The daemon runs on machines the developer may not have shell access
//! to (remote test rigs, phones), so a crash during interpretation is
//! captured and shipped back over the connection instead of vanishing
//! into a local log.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

/// A captured crash, ready to be sent to whoever is driving the replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashReport {
    /// Name of the thread that panicked.
    pub thread: String,
    /// The panic message.
    pub message: String,
    /// Source location, when the panic machinery provides one.
    pub location: Option<String>,
}

/// Captures panics process-wide.
///
/// The handler is a singleton-like shared object: every connection's
/// context references the same instance, and reports are drained under
/// the orchestrator's device lock discipline.
#[derive(Clone, Default)]
pub struct CrashHandler {
    pending: Arc<Mutex<Vec<CrashReport>>>,
}

impl CrashHandler {
    /// Create a handler. [`CrashHandler::install`] must be called once
    /// for panics to be captured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the panic hook. The previous hook keeps running so panics
    /// still reach stderr.
    pub fn install(&self) {
        let pending = Arc::clone(&self.pending);
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let message = info
                .payload()
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| info.payload().downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            let report = CrashReport {
                thread: std::thread::current()
                    .name()
                    .unwrap_or("<unnamed>")
                    .to_string(),
                message,
                location: info.location().map(|l| l.to_string()),
            };
            error!(thread = %report.thread, message = %report.message, "captured panic");
            pending.lock().push(report);
            previous(info);
        }));
    }

    /// Record a report directly, for failures that are detected without
    /// unwinding.
    pub fn record(&self, report: CrashReport) {
        self.pending.lock().push(report);
    }

    /// Drain all pending reports, oldest first.
    pub fn take_reports(&self) -> Vec<CrashReport> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// True if a report is waiting to be shipped.
    pub fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_drain() {
        let handler = CrashHandler::new();
        assert!(!handler.has_pending());

        handler.record(CrashReport {
            thread: "replay-0".into(),
            message: "device lost".into(),
            location: None,
        });
        assert!(handler.has_pending());

        let reports = handler.take_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].message, "device lost");
        assert!(!handler.has_pending());
    }

    #[test]
    fn clones_share_state() {
        let handler = CrashHandler::new();
        let alias = handler.clone();
        alias.record(CrashReport {
            thread: "t".into(),
            message: "m".into(),
            location: None,
        });
        assert!(handler.has_pending());
    }
}
