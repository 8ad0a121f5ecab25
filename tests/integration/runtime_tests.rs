//! Integration tests for the async worker runtime.
//!
//! Tokio time is paused, so simulated fetch delays and session deadlines
//! elapse as soon as every task is idle.

use std::sync::Arc;
use std::time::Duration;

use actor_session::config::WorkerConfig;
use actor_session::models::status::{TimeoutAction, Wake};
use actor_session::profile::{
    self, DelayedSource, LookupOutcome, LookupStatus, ProfileService,
};
use actor_session::runtime::{WorkerHandle, WorkerRuntime};
use actor_session::worker::factory::ActorFactory;
use actor_session::worker::Worker;
use actor_session::AppError;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Running {
    handle: WorkerHandle,
    source: Arc<DelayedSource>,
    outcomes: mpsc::UnboundedReceiver<LookupOutcome>,
    cancel: CancellationToken,
    task: JoinHandle<Worker>,
}

fn start(config: &WorkerConfig, fetch_delay: Duration) -> Running {
    let (handle, commands) = WorkerHandle::channel();
    let (tx, outcomes) = mpsc::unbounded_channel();
    let source = Arc::new(DelayedSource::new(handle.clone(), fetch_delay));

    let mut factory = ActorFactory::new();
    ProfileService::new(source.clone(), tx, config.profile.timeout_action).register(&mut factory);
    let worker = Worker::new(config, factory);

    let cancel = CancellationToken::new();
    let runtime = WorkerRuntime::new(worker, commands, config.tick_interval(), cancel.clone());
    Running {
        handle,
        source,
        outcomes,
        cancel,
        task: tokio::spawn(runtime.run()),
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_lookups_share_one_fetch() {
    let mut rt = start(&WorkerConfig::default(), Duration::from_millis(50));

    let a = rt
        .handle
        .spawn_step(profile::LOOKUP, json!({ "user": "ana" }))
        .await
        .expect("spawn a");
    let b = rt
        .handle
        .spawn_step(profile::LOOKUP, json!({ "user": "ana" }))
        .await
        .expect("spawn b");

    let first = rt.outcomes.recv().await.expect("first outcome");
    let second = rt.outcomes.recv().await.expect("second outcome");
    assert_eq!((first.step, first.status), (a, LookupStatus::Found));
    assert_eq!((second.step, second.status), (b, LookupStatus::Found));
    assert_eq!(rt.source.fetch_count(), 1);

    rt.handle.shutdown().await.expect("shutdown accepted");
    let worker = rt.task.await.expect("runtime joins");
    assert_eq!(worker.session_count(), 0);
    assert_eq!(worker.step_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_fetch_times_out_through_ticks() {
    let config = WorkerConfig {
        session_timeout_seconds: 1,
        ..WorkerConfig::default()
    };
    let mut rt = start(&config, Duration::from_secs(10));

    let a = rt
        .handle
        .spawn_step(profile::LOOKUP, json!({ "user": "ana" }))
        .await
        .expect("spawn");

    let outcome = rt.outcomes.recv().await.expect("outcome");
    assert_eq!(outcome.step, a);
    assert_eq!(outcome.status, LookupStatus::TimedOut);

    rt.cancel.cancel();
    let worker = rt.task.await.expect("runtime joins");
    assert_eq!(worker.session_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn retry_timeout_fetches_again() {
    let mut config = WorkerConfig {
        session_timeout_seconds: 1,
        ..WorkerConfig::default()
    };
    config.profile.timeout_action = TimeoutAction::Retry;
    // The first reply misses the deadline and lands on the retried load.
    let mut rt = start(&config, Duration::from_millis(1_500));

    rt.handle
        .spawn_step(profile::LOOKUP, json!({ "user": "ana" }))
        .await
        .expect("spawn");

    let outcome = rt.outcomes.recv().await.expect("outcome");
    assert_eq!(outcome.status, LookupStatus::Found);
    assert_eq!(rt.source.fetch_count(), 2);

    rt.cancel.cancel();
    rt.task.await.expect("runtime joins");
}

#[tokio::test(start_paused = true)]
async fn unknown_step_spawn_reports_factory_error() {
    let rt = start(&WorkerConfig::default(), Duration::from_millis(10));

    let err = rt
        .handle
        .spawn_step("no.such.step", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Factory(_)));

    rt.cancel.cancel();
    rt.task.await.expect("runtime joins");
}

#[tokio::test(start_paused = true)]
async fn invalidate_command_runs_through_handle() {
    let mut rt = start(&WorkerConfig::default(), Duration::from_millis(10));

    rt.handle
        .spawn_step(profile::LOOKUP, json!({ "user": "ana" }))
        .await
        .expect("spawn");
    let first = rt.outcomes.recv().await.expect("first outcome");
    assert_eq!(first.profile.map(|p| p.revision), Some(1));

    rt.handle
        .spawn_command(profile::INVALIDATE, json!({ "user": "ana" }))
        .await
        .expect("invalidate");
    rt.handle
        .spawn_step(profile::LOOKUP, json!({ "user": "ana" }))
        .await
        .expect("spawn again");
    let second = rt.outcomes.recv().await.expect("second outcome");
    assert_eq!(second.profile.map(|p| p.revision), Some(2));
    assert_eq!(rt.source.fetch_count(), 2);

    rt.cancel.cancel();
    rt.task.await.expect("runtime joins");
}

#[tokio::test(start_paused = true)]
async fn handle_fails_after_runtime_stops() {
    let rt = start(&WorkerConfig::default(), Duration::from_millis(10));
    rt.cancel.cancel();
    rt.task.await.expect("runtime joins");

    let err = rt
        .handle
        .resume(actor_session::models::ids::StepId(1), Wake::Start)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "runtime: worker is not running");
}
