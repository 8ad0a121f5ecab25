//! Async driver running one [`Worker`] on the current task.
//!
//! The worker itself is synchronous. [`WorkerRuntime::run`] alternates
//! between executing queued resumptions, applying commands received through
//! a [`WorkerHandle`], and advancing the worker clock with elapsed wall time
//! on every tick. Nothing inside a worker turn ever awaits.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::ids::StepId;
use crate::models::status::Wake;
use crate::worker::factory::EntityKind;
use crate::worker::Worker;
use crate::{AppError, Result};

/// Capacity of the command channel between handles and the runtime.
const COMMAND_CAPACITY: usize = 256;

/// Requests accepted by a running worker.
#[derive(Debug)]
pub enum WorkerCommand {
    /// Build a step or command through the factory and start it.
    Spawn {
        /// Namespace to build from.
        kind: EntityKind,
        /// Registered type name.
        name: String,
        /// Constructor arguments.
        args: Value,
        /// Receives the new step id or the construction error.
        reply: Option<oneshot::Sender<Result<StepId>>>,
    },
    /// Resume a parked step.
    Resume {
        /// Step to resume.
        step: StepId,
        /// Reason passed to the step.
        wake: Wake,
    },
    /// Stop the runtime after the current turn.
    Shutdown,
}

/// Cloneable sender side of a worker's command channel.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<WorkerCommand>,
}

/// Receiving side of a worker's command channel.
#[derive(Debug)]
pub struct CommandReceiver {
    rx: mpsc::Receiver<WorkerCommand>,
}

impl WorkerHandle {
    /// Create a connected handle and receiver.
    #[must_use]
    pub fn channel() -> (Self, CommandReceiver) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        (Self { tx }, CommandReceiver { rx })
    }

    /// Start a registered step and wait for its id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Runtime` if the worker stopped, or the factory
    /// error if construction failed.
    pub async fn spawn_step(&self, name: &str, args: Value) -> Result<StepId> {
        self.spawn(EntityKind::Step, name, args).await
    }

    /// Start a registered command and wait for its id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Runtime` if the worker stopped, or the factory
    /// error if construction failed.
    pub async fn spawn_command(&self, name: &str, args: Value) -> Result<StepId> {
        self.spawn(EntityKind::Command, name, args).await
    }

    async fn spawn(&self, kind: EntityKind, name: &str, args: Value) -> Result<StepId> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerCommand::Spawn {
            kind,
            name: name.to_owned(),
            args,
            reply: Some(reply),
        })
        .await?;
        rx.await
            .map_err(|_| AppError::Runtime("worker dropped spawn reply".into()))?
    }

    /// Queue a resumption of `step`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Runtime` if the worker stopped.
    pub async fn resume(&self, step: StepId, wake: Wake) -> Result<()> {
        self.send(WorkerCommand::Resume { step, wake }).await
    }

    /// Ask the runtime to stop.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Runtime` if the worker already stopped.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(WorkerCommand::Shutdown).await
    }

    async fn send(&self, command: WorkerCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| AppError::Runtime("worker is not running".into()))
    }
}

/// Drives a worker until shutdown or cancellation.
pub struct WorkerRuntime {
    worker: Worker,
    commands: CommandReceiver,
    tick: Duration,
    cancel: CancellationToken,
}

impl WorkerRuntime {
    /// Bind a worker to its command receiver.
    #[must_use]
    pub fn new(
        worker: Worker,
        commands: CommandReceiver,
        tick: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worker,
            commands,
            tick: tick.max(Duration::from_millis(1)),
            cancel,
        }
    }

    /// Run until a shutdown command, cancellation, or every handle dropping.
    ///
    /// Returns the worker after [`Worker::shutdown`] so callers can inspect
    /// the final state.
    pub async fn run(mut self) -> Worker {
        let epoch = Instant::now();
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tick_ms = self.tick.as_secs_f64() * 1000.0, "worker runtime started");

        loop {
            self.worker.run_pending();

            if self.worker.has_pending() {
                // Per-turn limit reached; let other tasks run before the next turn.
                tokio::task::yield_now().await;
                while let Ok(command) = self.commands.rx.try_recv() {
                    if !self.apply(command) {
                        return self.finish();
                    }
                }
                self.worker.advance(epoch.elapsed());
                continue;
            }

            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!("worker runtime cancelled");
                    break;
                }
                maybe_command = self.commands.rx.recv() => {
                    let Some(command) = maybe_command else {
                        debug!("all worker handles dropped");
                        break;
                    };
                    if !self.apply(command) {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.worker.advance(epoch.elapsed());
                }
            }
        }

        self.finish()
    }

    fn apply(&mut self, command: WorkerCommand) -> bool {
        match command {
            WorkerCommand::Spawn {
                kind,
                name,
                args,
                reply,
            } => {
                let result = match kind {
                    EntityKind::Command => self.worker.spawn_command(&name, &args),
                    _ => self.worker.spawn_step(&name, &args),
                };
                if let Err(ref err) = result {
                    warn!(%err, %kind, name, "spawn rejected");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
                true
            }
            WorkerCommand::Resume { step, wake } => {
                self.worker.resume(step, wake);
                true
            }
            WorkerCommand::Shutdown => {
                info!("worker shutdown requested");
                false
            }
        }
    }

    fn finish(mut self) -> Worker {
        self.worker.shutdown();
        self.worker
    }
}
