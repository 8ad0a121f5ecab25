//! Integration tests for session deadlines and timeout outcomes.

use std::time::Duration;

use actor_session::models::status::{TimeoutAction, Wake};
use actor_session::session::LoadState;

use super::test_helpers::{entries, fixed_session, journal, millis, secs, worker, Fixed, Waiter};

#[test]
fn deadline_fires_once_at_five_units_not_before() {
    let mut worker = worker();
    let session = fixed_session(&mut worker, 1u32, TimeoutAction::Continue);
    let hits = |w: &actor_session::worker::Worker| {
        w.session(session)
            .and_then(|s| s.kind_ref::<Fixed>())
            .map(|k| k.hits)
    };

    assert_eq!(worker.advance(millis(4_999)), 0);
    assert_eq!(hits(&worker), Some(0));

    assert_eq!(worker.advance(secs(5)), 1);
    assert_eq!(hits(&worker), Some(1));

    // Re-armed for another full timeout, not fired again in between.
    assert_eq!(worker.advance(millis(9_999)), 0);
    assert_eq!(hits(&worker), Some(1));
    assert_eq!(worker.session_deadline(session), Some(secs(10)));
}

#[test]
fn late_advance_fires_each_deadline_once() {
    let mut worker = worker();
    let session = fixed_session(&mut worker, 1u32, TimeoutAction::Continue);

    assert_eq!(worker.advance(secs(7)), 1);
    assert_eq!(
        worker
            .session(session)
            .and_then(|s| s.kind_ref::<Fixed>())
            .map(|k| k.hits),
        Some(1)
    );
    assert_eq!(worker.session_deadline(session), Some(secs(12)));
}

#[test]
fn clock_never_moves_backwards() {
    let mut worker = worker();
    fixed_session(&mut worker, 1u32, TimeoutAction::Continue);
    worker.advance(secs(3));
    worker.advance(secs(1));
    assert_eq!(worker.now(), secs(3));
}

#[test]
fn refresh_postpones_deadline() {
    let mut worker = worker();
    let session = fixed_session(&mut worker, 1u32, TimeoutAction::Continue);

    worker.advance(secs(3));
    assert!(worker.refresh_session(session));
    assert_eq!(worker.session_deadline(session), Some(secs(8)));

    assert_eq!(worker.advance(secs(5)), 0);
    assert_eq!(worker.advance(secs(8)), 1);
}

#[test]
fn lookup_by_key_refreshes_when_configured() {
    let mut worker = worker();
    let session = fixed_session(&mut worker, "cart", TimeoutAction::Continue);

    worker.advance(secs(4));
    assert_eq!(worker.find_session(&"cart".into()), Some(session));
    assert_eq!(worker.session_deadline(session), Some(secs(9)));
}

#[test]
fn lookup_by_key_leaves_deadline_when_refresh_disabled() {
    let config = actor_session::config::WorkerConfig {
        refresh_on_access: false,
        ..super::test_helpers::test_config()
    };
    let mut worker =
        actor_session::worker::Worker::new(&config, actor_session::worker::factory::ActorFactory::new());
    let session = fixed_session(&mut worker, "cart", TimeoutAction::Continue);

    worker.advance(secs(4));
    assert_eq!(worker.find_session(&"cart".into()), Some(session));
    assert_eq!(worker.session_deadline(session), Some(secs(5)));
}

#[test]
fn continue_keeps_waiters_parked() {
    let mut worker = worker();
    let log = journal();
    let session = fixed_session(&mut worker, 1u32, TimeoutAction::Continue);
    let waiter = worker.insert_step(Waiter::boxed(session, &log), None);
    worker.run_pending();

    worker.advance(secs(5));
    worker.run_pending();

    assert!(entries(&log).is_empty());
    assert!(worker.contains_step(waiter));
    let s = worker.session(session).expect("live");
    assert!(s.is_waiting(waiter));
    assert!(s.is_loading());
}

#[test]
fn retry_fails_waiters_and_resets_session() {
    let mut worker = worker();
    let log = journal();
    let session = fixed_session(&mut worker, 1u32, TimeoutAction::Retry);
    let a = worker.insert_step(Waiter::boxed(session, &log), None);
    let b = worker.insert_step(Waiter::boxed(session, &log), None);
    worker.run_pending();

    assert_eq!(worker.advance(secs(5)), 1);
    worker.run_pending();

    let timed_out = Wake::SessionTimedOut(session);
    assert_eq!(entries(&log), vec![(a, timed_out.clone()), (b, timed_out)]);
    let s = worker.session(session).expect("session kept");
    assert_eq!(s.state(), LoadState::Unloaded);
    assert_eq!(s.cycle(), 1);
    assert_eq!(s.waiting_len(), 0);
    assert_eq!(worker.session_deadline(session), Some(secs(10)));

    let snapshot = s
        .kind_ref::<Fixed>()
        .and_then(|k| k.last.clone())
        .expect("hook saw a snapshot");
    assert_eq!(snapshot.state, LoadState::Loading);
    assert_eq!(snapshot.waiting, 2);
}

#[test]
fn release_fails_waiters_and_destroys_session() {
    let mut worker = worker();
    let log = journal();
    let session = fixed_session(&mut worker, "cart", TimeoutAction::Release);
    let waiter = worker.insert_step(Waiter::boxed(session, &log), None);
    worker.run_pending();

    assert_eq!(worker.advance(secs(5)), 1);
    worker.run_pending();

    assert_eq!(entries(&log), vec![(waiter, Wake::SessionTimedOut(session))]);
    assert!(worker.session(session).is_none());
    assert_eq!(worker.session_count(), 0);
    assert!(worker.find_session(&"cart".into()).is_none());
    assert_eq!(worker.session_deadline(session), None);
    assert!(!worker.contains_step(waiter));
}

#[test]
fn discard_cancels_deadline_and_fails_waiters() {
    let mut worker = worker();
    let log = journal();
    let session = fixed_session(&mut worker, 1u32, TimeoutAction::Continue);
    let waiter = worker.insert_step(Waiter::boxed(session, &log), None);
    worker.run_pending();

    assert!(worker.discard_session(session));
    assert!(!worker.discard_session(session));
    worker.run_pending();

    assert_eq!(entries(&log), vec![(waiter, Wake::SessionDiscarded(session))]);
    assert_eq!(worker.advance(secs(60)), 0);
}

#[test]
fn deadlines_fire_in_time_order() {
    let mut worker = worker();
    let long = worker
        .insert_session(
            actor_session::worker::factory::SessionBlueprint::new(
                "long",
                Fixed::boxed(TimeoutAction::Release),
            )
            .with_timeout(secs(9)),
            None,
        )
        .expect("registers");
    let short = fixed_session(&mut worker, "short", TimeoutAction::Release);

    assert_eq!(worker.next_deadline(), Some(secs(5)));
    assert_eq!(worker.advance(secs(6)), 1);
    assert!(worker.session(short).is_none());
    assert!(worker.session(long).is_some());
    assert_eq!(worker.next_deadline(), Some(Duration::from_secs(9)));
}
