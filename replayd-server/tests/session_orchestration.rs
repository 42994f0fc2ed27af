//! End-to-end tests of the session loop and the prewarm state machine,
//! run against scripted transports and contexts.

use replayd_server::prelude::*;
use replayd_server::service::ReplayService;
use replayd_server::testing::{ContextCall, ScriptedFactory, ScriptedService};
use replayd_core::crash::{CrashHandler, CrashReport};
use replayd_core::types::StateId;
use std::sync::Arc;

fn session(
    service: &Arc<ScriptedService>,
    factory: &ScriptedFactory,
    shared: &Arc<SharedReplayState>,
) -> Session {
    Session::new(
        Arc::clone(service) as Arc<dyn ReplayService>,
        factory.make_context(),
        None,
        Arc::clone(shared),
        CrashHandler::new(),
    )
}

fn replay(replay_id: &str, dependent_id: &str) -> Request {
    Request::Replay {
        replay_id: replay_id.into(),
        dependent_id: dependent_id.into(),
    }
}

fn prewarm(prerun_id: &str, cleanup_id: &str) -> Request {
    Request::Prewarm {
        prerun_id: prerun_id.into(),
        cleanup_id: cleanup_id.into(),
    }
}

#[test]
fn replay_without_dependency_runs_the_lifecycle() {
    let service = Arc::new(ScriptedService::with_requests([replay("r1", "")]));
    let factory = ScriptedFactory::new();
    session(&service, &factory, &SharedReplayState::new()).run();

    assert_eq!(
        factory.calls(),
        vec![
            ContextCall::Initialize("r1".into()),
            ContextCall::Interpret("r1".into(), false),
            ContextCall::Cleanup("r1".into()),
        ]
    );
    assert_eq!(service.finished_count(), 1);
    assert!(service.prime_now_calls().is_empty());
}

#[test]
fn unprimed_dependency_is_primed_one_shot() {
    let service = Arc::new(ScriptedService::with_requests([replay("r1", "s1")]));
    let factory = ScriptedFactory::new();
    let shared = SharedReplayState::new();
    session(&service, &factory, &shared).run();

    assert_eq!(
        factory.calls(),
        vec![
            ContextCall::Initialize("s1".into()),
            ContextCall::Interpret("s1".into(), true),
            ContextCall::Initialize("r1".into()),
            ContextCall::Interpret("r1".into(), false),
            ContextCall::Cleanup("r1".into()),
        ]
    );
    // One-shot primes are not registered for reuse.
    assert!(shared.lock().primed_state.is_empty());
    assert!(service.prime_now_calls().is_empty());
}

#[test]
fn prewarm_registers_a_standby() {
    let service = Arc::new(ScriptedService::with_requests([prewarm("s1", "c1")]));
    let factory = ScriptedFactory::new();
    let shared = SharedReplayState::new();
    session(&service, &factory, &shared).run();

    let record = shared.lock();
    assert_eq!(record.primed_state, StateId::from("s1"));
    assert_eq!(record.cleanup_id, StateId::from("c1"));
    assert_eq!(record.current_state, StateId::from("s1"));
}

#[test]
fn prewarm_of_the_held_state_only_updates_the_cleanup_id() {
    let service = Arc::new(ScriptedService::with_requests([
        prewarm("s1", "c1"),
        prewarm("s1", "c2"),
    ]));
    let factory = ScriptedFactory::new();
    let shared = SharedReplayState::new();
    session(&service, &factory, &shared).run();

    // The second request must not re-run any lifecycle step.
    assert_eq!(factory.initialize_count("s1"), 1);
    assert_eq!(factory.calls().len(), 2);
    assert_eq!(shared.lock().cleanup_id, StateId::from("c2"));
}

#[test]
fn prewarm_of_a_new_state_cleans_the_previous_standby() {
    let service = Arc::new(ScriptedService::with_requests([
        prewarm("s1", "c1"),
        prewarm("s2", "c2"),
    ]));
    let factory = ScriptedFactory::new();
    let shared = SharedReplayState::new();
    session(&service, &factory, &shared).run();

    assert_eq!(
        factory.calls(),
        vec![
            ContextCall::Initialize("s1".into()),
            ContextCall::Interpret("s1".into(), true),
            ContextCall::Initialize("c1".into()),
            ContextCall::Interpret("c1".into(), false),
            ContextCall::Cleanup("c1".into()),
            ContextCall::Initialize("s2".into()),
            ContextCall::Interpret("s2".into(), true),
        ]
    );
    let record = shared.lock();
    assert_eq!(record.primed_state, StateId::from("s2"));
    assert_eq!(record.cleanup_id, StateId::from("c2"));
}

#[test]
fn dependent_replays_reuse_the_standby_across_connections() {
    // Connection B keeps the standby primed; connection A replays frames
    // that depend on it. The expensive dependency must only ever be
    // primed on B, never one-shot on A.
    let factory = ScriptedFactory::new();
    let shared = SharedReplayState::new();

    let standby_service = Arc::new(ScriptedService::new());
    let standby = Session::new(
        Arc::clone(&standby_service) as Arc<dyn ReplayService>,
        factory.make_context(),
        None,
        Arc::clone(&shared),
        CrashHandler::new(),
    );
    let replayer_service = Arc::new(ScriptedService::new());
    let replayer = session(&replayer_service, &factory, &shared);

    standby_service.push(prewarm("s1", "c1"));
    standby.run();

    replayer_service.push(replay("r1", "s1"));
    replayer.run();
    assert_eq!(standby_service.prime_now_calls(), vec![("s1".into(), "c1".into())]);

    // The standby connection re-primes while the replayer idles.
    standby_service.push(prewarm("s1", "c1"));
    standby.run();

    replayer_service.push(replay("r2", "s1"));
    replayer.run();

    assert_eq!(replayer_service.finished_count(), 2);
    // Primed twice on B, and never as a one-shot on A.
    assert_eq!(factory.initialize_count("s1"), 2);
    // The standby was never cleaned up: both replays matched its state.
    assert_eq!(factory.initialize_count("c1"), 0);
    assert_eq!(standby_service.prime_now_calls().len(), 2);
}

#[test]
fn replay_against_a_different_standby_cleans_it_first() {
    let service = Arc::new(ScriptedService::with_requests([
        prewarm("s1", "c1"),
        replay("r1", "s2"),
    ]));
    let factory = ScriptedFactory::new();
    let shared = SharedReplayState::new();
    session(&service, &factory, &shared).run();

    assert_eq!(
        factory.calls(),
        vec![
            ContextCall::Initialize("s1".into()),
            ContextCall::Interpret("s1".into(), true),
            ContextCall::Initialize("c1".into()),
            ContextCall::Interpret("c1".into(), false),
            ContextCall::Cleanup("c1".into()),
            ContextCall::Initialize("s2".into()),
            ContextCall::Interpret("s2".into(), true),
            ContextCall::Initialize("r1".into()),
            ContextCall::Interpret("r1".into(), false),
            ContextCall::Cleanup("r1".into()),
        ]
    );
    // The standby registration was consumed by the cleanup.
    assert!(shared.lock().primed_state.is_empty());
}

#[test]
fn torn_down_standby_is_dropped_without_cleanup() {
    let factory = ScriptedFactory::new();
    let shared = SharedReplayState::new();

    {
        let gone_service = Arc::new(ScriptedService::with_requests([prewarm("s1", "c1")]));
        session(&gone_service, &factory, &shared).run();
    }
    // The standby session is gone; its context was dropped with it.

    let service = Arc::new(ScriptedService::with_requests([replay("r1", "s2")]));
    session(&service, &factory, &shared).run();

    assert_eq!(factory.initialize_count("c1"), 0);
    assert_eq!(service.finished_count(), 1);
}

#[test]
fn initialization_failure_abandons_the_request_only() {
    let service = Arc::new(ScriptedService::with_requests([
        replay("r1", ""),
        replay("r2", ""),
    ]));
    let factory = ScriptedFactory::new();
    factory.fail_initialize("r1");
    session(&service, &factory, &SharedReplayState::new()).run();

    // r1 never reached interpretation or the finished signal; r2 ran.
    assert_eq!(service.finished_count(), 1);
    assert_eq!(factory.initialize_count("r2"), 1);
}

#[test]
fn interpretation_failure_still_signals_finished() {
    let service = Arc::new(ScriptedService::with_requests([
        replay("r1", ""),
        replay("r2", ""),
    ]));
    let factory = ScriptedFactory::new();
    factory.fail_interpret("r1");
    session(&service, &factory, &SharedReplayState::new()).run();

    assert_eq!(service.finished_count(), 2);
}

#[test]
fn cleanup_failure_tears_the_connection_down() {
    let service = Arc::new(ScriptedService::with_requests([
        prewarm("s1", "c1"),
        prewarm("s2", "c2"),
        replay("r1", ""),
    ]));
    let factory = ScriptedFactory::new();
    factory.fail_cleanup_of("c1");
    let shared = SharedReplayState::new();
    session(&service, &factory, &shared).run();

    // The second prewarm died cleaning the first standby; nothing after
    // it may run on this connection.
    assert_eq!(factory.initialize_count("s2"), 0);
    assert_eq!(factory.initialize_count("r1"), 0);
    assert_eq!(service.finished_count(), 0);
    // A failed cleanup leaves the record as it was.
    assert_eq!(shared.lock().primed_state, StateId::from("s1"));
}

#[test]
fn failed_standby_cleanup_before_replay_is_tolerated() {
    let service = Arc::new(ScriptedService::with_requests([
        prewarm("s1", "c1"),
        replay("r1", ""),
    ]));
    let factory = ScriptedFactory::new();
    factory.fail_interpret("c1");
    session(&service, &factory, &SharedReplayState::new()).run();

    // Replay proceeds even though the standby cleanup failed.
    assert_eq!(service.finished_count(), 1);
    assert_eq!(factory.initialize_count("r1"), 1);
}

#[test]
fn unknown_requests_are_ignored() {
    let service = Arc::new(ScriptedService::with_requests([
        Request::Unknown,
        replay("r1", ""),
    ]));
    let factory = ScriptedFactory::new();
    session(&service, &factory, &SharedReplayState::new()).run();
    assert_eq!(service.finished_count(), 1);
}

#[test]
fn pending_crash_reports_are_uploaded_at_session_start() {
    let service = Arc::new(ScriptedService::new());
    let crash = CrashHandler::new();
    crash.record(CrashReport {
        thread: "replay-conn-0".into(),
        message: "interpreter fault".into(),
        location: Some("vm".into()),
    });
    let session = Session::new(
        Arc::clone(&service) as Arc<dyn ReplayService>,
        ScriptedFactory::new().make_context(),
        None,
        SharedReplayState::new(),
        crash.clone(),
    );
    session.run();

    let reports = service.crash_reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].message, "interpreter fault");
    assert!(!crash.has_pending());
}
