//! Integration tests for the ready/loading protocol through the worker.
//!
//! Validates:
//! - FIFO resumption of every step parked before `set_ready`
//! - a single loader per load cycle
//! - idempotent `set_ready` and reset cycles
//! - stale handles and finished steps are ignored

use actor_session::config::WorkerConfig;
use actor_session::models::ids::StepId;
use actor_session::models::status::{CmdStatus, TimeoutAction, Wake};
use actor_session::session::LoadState;
use actor_session::worker::factory::ActorFactory;
use actor_session::worker::{Step, StepContext, Worker};
use serde_json::Value;

use super::test_helpers::{entries, fixed_session, journal, worker, Waiter};

#[test]
fn parked_steps_resume_in_check_order() {
    let mut worker = worker();
    let log = journal();
    let session = fixed_session(&mut worker, 1u32, TimeoutAction::Continue);

    let a = worker.insert_step(Waiter::boxed(session, &log), None);
    let b = worker.insert_step(Waiter::boxed(session, &log), None);
    let c = worker.insert_step(Waiter::boxed(session, &log), None);
    assert_eq!(worker.run_pending(), 3);

    let s = worker.session(session).expect("session live");
    assert!(s.is_loading());
    assert_eq!(s.waiting_len(), 3);
    assert!(worker.step_ref::<Waiter>(a).expect("a parked").loader);
    assert!(!worker.step_ref::<Waiter>(b).expect("b parked").loader);
    assert!(!worker.step_ref::<Waiter>(c).expect("c parked").loader);

    // A's load completes.
    assert!(worker.resume(a, Wake::External(Value::Null)));
    worker.run_pending();

    let ready = Wake::SessionReady(session);
    assert_eq!(
        entries(&log),
        vec![(a, ready.clone()), (b, ready.clone()), (c, ready)]
    );
    assert_eq!(worker.step_count(), 0);
    let s = worker.session(session).expect("session live");
    assert_eq!(s.state(), LoadState::Ready);
    assert_eq!(s.waiting_len(), 0);
}

#[test]
fn late_arrival_reads_ready_session_without_parking() {
    let mut worker = worker();
    let log = journal();
    let session = fixed_session(&mut worker, 1u32, TimeoutAction::Continue);
    worker.set_ready(session);

    let late = worker.insert_step(Waiter::boxed(session, &log), None);
    worker.run_pending();

    assert_eq!(entries(&log), vec![(late, Wake::Start)]);
    assert_eq!(worker.session(session).expect("live").waiting_len(), 0);
}

#[test]
fn double_set_ready_drains_nothing_the_second_time() {
    let mut worker = worker();
    let session = fixed_session(&mut worker, 1u32, TimeoutAction::Continue);

    assert_eq!(worker.set_ready(session), 0);
    assert_eq!(worker.set_ready(session), 0);
    assert_eq!(
        worker.session(session).expect("live").state(),
        LoadState::Ready
    );
}

#[test]
fn second_set_ready_after_drain_returns_no_waiters() {
    let mut worker = worker();
    let log = journal();
    let session = fixed_session(&mut worker, 1u32, TimeoutAction::Continue);
    worker.insert_step(Waiter::boxed(session, &log), None);
    worker.insert_step(Waiter::boxed(session, &log), None);
    worker.run_pending();

    assert_eq!(worker.set_ready(session), 2);
    assert_eq!(worker.set_ready(session), 0);
    assert_eq!(worker.pending_len(), 2);
}

#[test]
fn reset_starts_a_new_single_flight_cycle() {
    let mut worker = worker();
    let log = journal();
    let session = fixed_session(&mut worker, 1u32, TimeoutAction::Continue);
    worker.set_ready(session);

    worker.session_mut(session).expect("live").reset();
    let s = worker.session(session).expect("live");
    assert_eq!(s.state(), LoadState::Unloaded);
    assert_eq!(s.cycle(), 1);

    let loader = worker.insert_step(Waiter::boxed(session, &log), None);
    let follower = worker.insert_step(Waiter::boxed(session, &log), None);
    worker.run_pending();
    assert!(worker.step_ref::<Waiter>(loader).expect("parked").loader);
    assert!(!worker.step_ref::<Waiter>(follower).expect("parked").loader);
}

#[test]
fn duplicate_checks_resume_once_with_dedupe() {
    struct Poller {
        session: actor_session::models::ids::EntityIndex,
    }

    impl Step for Poller {
        fn name(&self) -> &str {
            "poller"
        }

        fn run(&mut self, ctx: &mut StepContext<'_>, _wake: Wake) -> CmdStatus {
            // Checks twice in one turn.
            ctx.is_ready(self.session);
            if ctx.is_ready(self.session) {
                CmdStatus::Completed
            } else {
                CmdStatus::Running
            }
        }
    }

    let mut worker = worker();
    let session = fixed_session(&mut worker, 1u32, TimeoutAction::Continue);
    let id = worker.insert_step(Box::new(Poller { session }), None);
    worker.run_pending();

    assert_eq!(worker.session(session).expect("live").waiting_len(), 1);
    assert_eq!(worker.set_ready(session), 1);
    worker.run_pending();
    assert!(!worker.contains_step(id));
}

#[test]
fn duplicate_checks_enqueue_every_time_without_dedupe() {
    let config = WorkerConfig {
        dedupe_waiters: false,
        ..super::test_helpers::test_config()
    };
    let mut worker = Worker::new(&config, ActorFactory::new());
    let session = fixed_session(&mut worker, 1u32, TimeoutAction::Continue);
    let log = journal();
    let id = worker.insert_step(Waiter::boxed(session, &log), None);
    worker.run_pending();
    worker
        .session_mut(session)
        .expect("live")
        .is_ready(id);

    assert_eq!(worker.set_ready(session), 2);
    worker.run_pending();

    // The first resumption completes the step; the duplicate is skipped.
    assert_eq!(entries(&log), vec![(id, Wake::SessionReady(session))]);
    assert!(!worker.has_pending());
}

#[test]
fn resume_of_finished_step_is_rejected() {
    let mut worker = worker();
    assert!(!worker.resume(StepId(999), Wake::Start));
}

#[test]
fn stale_session_handle_reads_as_absent() {
    let mut worker = worker();
    let log = journal();
    let session = fixed_session(&mut worker, 1u32, TimeoutAction::Continue);
    assert!(worker.discard_session(session));

    let replacement = fixed_session(&mut worker, 1u32, TimeoutAction::Continue);
    assert_eq!(replacement.slot, session.slot);
    assert!(worker.session(session).is_none());
    assert_eq!(worker.set_ready(session), 0);

    // A step holding the stale handle never parks on the replacement.
    worker.insert_step(Waiter::boxed(session, &log), None);
    worker.run_pending();
    assert_eq!(
        worker.session(replacement).expect("live").waiting_len(),
        0
    );
}

#[test]
fn duplicate_session_key_is_rejected() {
    let mut worker = worker();
    fixed_session(&mut worker, "cart", TimeoutAction::Continue);
    let err = worker
        .insert_session(
            actor_session::worker::factory::SessionBlueprint::new(
                "cart",
                super::test_helpers::Fixed::boxed(TimeoutAction::Continue),
            ),
            None,
        )
        .unwrap_err();
    assert_eq!(err.to_string(), "factory: session key cart already registered");
}

#[test]
fn run_pending_honours_turn_limit() {
    let config = WorkerConfig {
        max_turn_resumptions: 2,
        ..super::test_helpers::test_config()
    };
    let mut worker = Worker::new(&config, ActorFactory::new());
    for _ in 0..3 {
        worker.insert_step(Box::new(super::test_helpers::Parked), None);
    }

    assert_eq!(worker.run_pending(), 2);
    assert!(worker.has_pending());
    assert_eq!(worker.run_pending(), 1);
    assert!(!worker.has_pending());
    assert_eq!(worker.step_count(), 3);
}

#[test]
fn step_ids_are_never_reused() {
    let mut worker = worker();
    let first = worker.insert_step(Box::new(super::test_helpers::Parked), None);
    worker.shutdown();
    let second = worker.insert_step(Box::new(super::test_helpers::Parked), None);
    assert!(second > first);
}

#[test]
fn shutdown_drops_everything() {
    let mut worker = worker();
    let log = journal();
    let session = fixed_session(&mut worker, 1u32, TimeoutAction::Continue);
    worker.insert_step(Waiter::boxed(session, &log), None);
    worker.run_pending();

    worker.shutdown();

    assert_eq!(worker.session_count(), 0);
    assert_eq!(worker.step_count(), 0);
    assert!(!worker.has_pending());
    assert_eq!(worker.next_deadline(), None);
    assert!(worker.find_session(&1u32.into()).is_none());
}
