#![forbid(unsafe_code)]

//! `actor-session`: demo worker serving profile lookups.
//!
//! Reads `get <user>` / `invalidate <user>` lines from stdin, runs each as a
//! step on a single cooperative worker, and prints lookup outcomes as JSON
//! lines. Concurrent lookups for the same user share one simulated fetch.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use actor_session::config::WorkerConfig;
use actor_session::profile::{self, DelayedSource, ProfileService};
use actor_session::runtime::{WorkerHandle, WorkerRuntime};
use actor_session::worker::factory::ActorFactory;
use actor_session::worker::Worker;
use actor_session::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "actor-session", about = "Single-flight session worker", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

/// Why the stdin reader stopped.
enum InputEnd {
    Quit,
    Eof,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("actor-session bootstrap");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Runtime(format!("failed to build tokio runtime: {err}")))?;
    let result = runtime.block_on(run(args));
    // A pending stdin read would otherwise hold shutdown until the next line.
    runtime.shutdown_background();
    result
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = match args.config {
        Some(path) => WorkerConfig::load_from_path(path)?,
        None => WorkerConfig::default(),
    };
    info!(
        session_timeout_secs = config.session_timeout_seconds,
        dedupe_waiters = config.dedupe_waiters,
        "configuration loaded"
    );

    // ── Build the worker ────────────────────────────────
    let (handle, commands) = WorkerHandle::channel();
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
    let source = Arc::new(DelayedSource::new(handle.clone(), config.fetch_delay()));

    let mut factory = ActorFactory::new();
    ProfileService::new(source, outcome_tx, config.profile.timeout_action).register(&mut factory);
    let worker = Worker::new(&config, factory);

    let ct = CancellationToken::new();
    let runtime = WorkerRuntime::new(worker, commands, config.tick_interval(), ct.clone());
    let worker_handle = tokio::spawn(runtime.run());

    let printer_handle = tokio::spawn(async move {
        while let Some(outcome) = outcome_rx.recv().await {
            match serde_json::to_string(&outcome) {
                Ok(line) => println!("{line}"),
                Err(err) => warn!(%err, "failed to encode lookup outcome"),
            }
        }
    });

    info!("worker ready; commands: get <user>, invalidate <user>, quit");

    // ── Serve until quit, EOF, or signal ────────────────
    tokio::select! {
        () = shutdown_signal() => info!("shutdown signal received"),
        end = read_commands(&handle) => match end {
            InputEnd::Quit => info!("quit requested"),
            InputEnd::Eof => {
                info!("input closed; letting in-flight lookups finish");
                // Brief sleep so in-flight fetches can complete.
                tokio::time::sleep(drain_grace(&config)).await;
            }
        },
    }
    ct.cancel();

    let worker = worker_handle
        .await
        .map_err(|err| AppError::Runtime(format!("worker task failed: {err}")))?;
    info!(
        sessions = worker.session_count(),
        steps = worker.step_count(),
        "worker stopped"
    );
    drop(worker);
    drop(handle);

    if let Err(err) = printer_handle.await {
        error!(%err, "outcome printer failed");
    }
    info!("actor-session shut down");

    Ok(())
}

fn drain_grace(config: &WorkerConfig) -> Duration {
    config.fetch_delay() * 2 + config.tick_interval()
}

async fn read_commands(handle: &WorkerHandle) -> InputEnd {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return InputEnd::Eof,
            Err(err) => {
                warn!(%err, "failed to read stdin");
                return InputEnd::Eof;
            }
        };

        let mut words = line.split_whitespace();
        let result = match (words.next(), words.next()) {
            (None, _) => continue,
            (Some("quit" | "exit"), _) => return InputEnd::Quit,
            (Some("get"), Some(user)) => handle
                .spawn_step(profile::LOOKUP, json!({ "user": user }))
                .await
                .map(|_| ()),
            (Some("invalidate"), Some(user)) => handle
                .spawn_command(profile::INVALIDATE, json!({ "user": user }))
                .await
                .map(|_| ()),
            (Some(other), _) => {
                warn!(command = other, "unknown command");
                continue;
            }
        };

        if let Err(err) = result {
            error!(%err, "command rejected");
            if matches!(err, AppError::Runtime(_)) {
                return InputEnd::Eof;
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Stdout carries lookup outcomes; logs go to stderr.
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
