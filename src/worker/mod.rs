//! Single-threaded cooperative worker owning steps and sessions.
//!
//! The worker keeps every entity in its own tables and hands out plain
//! handles ([`StepId`], [`EntityIndex`]). A step never blocks: it returns
//! [`CmdStatus::Running`] to stay parked and is re-invoked later with a
//! [`Wake`] explaining why. Resumptions are queued and executed one at a
//! time by [`Worker::run_pending`]; session deadlines are fired by
//! [`Worker::advance`].

pub mod arena;
pub mod context;
pub mod factory;
pub mod timer;

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use downcast_rs::{impl_downcast, Downcast};
use serde_json::Value;
use tracing::{debug, info, info_span, warn};

use crate::config::WorkerConfig;
use crate::models::ids::{EntityIndex, SessionKey, StepId, TraceId};
use crate::models::status::{CmdStatus, TimeoutAction, Wake};
use crate::session::Session;
use crate::{AppError, Result};

use self::arena::Arena;
use self::factory::{ActorFactory, EntityKind, SessionBlueprint};
use self::timer::{DeadlineQueue, TimeoutRegistrar};

pub use self::context::{SessionScope, StepContext};

/// Resumable unit of non-blocking work.
pub trait Step: Downcast + Send {
    /// Registered type name, used in log records.
    fn name(&self) -> &str;

    /// Advance the step by one increment of work.
    ///
    /// Returning [`CmdStatus::Running`] keeps the step parked until the next
    /// resumption; any other status releases it.
    fn run(&mut self, ctx: &mut StepContext<'_>, wake: Wake) -> CmdStatus;
}

impl_downcast!(Step);

struct StepSlot {
    // `None` while the step is executing.
    step: Option<Box<dyn Step>>,
    trace_id: TraceId,
    kind: EntityKind,
}

/// Cooperative scheduler for one thread of execution.
pub struct Worker {
    sessions: Arena<Session>,
    registry: HashMap<SessionKey, EntityIndex>,
    steps: HashMap<StepId, StepSlot>,
    run_queue: VecDeque<(StepId, Wake)>,
    timers: Box<dyn TimeoutRegistrar>,
    factory: ActorFactory,
    next_step_id: u64,
    now: Duration,
    default_timeout: Duration,
    dedupe_waiters: bool,
    refresh_on_access: bool,
    max_turn_resumptions: usize,
}

impl Worker {
    /// Create a worker backed by a [`DeadlineQueue`].
    #[must_use]
    pub fn new(config: &WorkerConfig, factory: ActorFactory) -> Self {
        Self::with_registrar(config, factory, Box::new(DeadlineQueue::new()))
    }

    /// Create a worker backed by a custom timeout registrar.
    #[must_use]
    pub fn with_registrar(
        config: &WorkerConfig,
        factory: ActorFactory,
        timers: Box<dyn TimeoutRegistrar>,
    ) -> Self {
        Self {
            sessions: Arena::new(),
            registry: HashMap::new(),
            steps: HashMap::new(),
            run_queue: VecDeque::new(),
            timers,
            factory,
            next_step_id: 1,
            now: Duration::ZERO,
            default_timeout: config.session_timeout(),
            dedupe_waiters: config.dedupe_waiters,
            refresh_on_access: config.refresh_on_access,
            max_turn_resumptions: config.max_turn_resumptions.max(1),
        }
    }

    /// Mutable access to the constructor registry.
    pub fn factory_mut(&mut self) -> &mut ActorFactory {
        &mut self.factory
    }

    /// Current offset from the worker's epoch.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.now
    }

    // ── Steps ───────────────────────────────────────────

    /// Insert a step and queue its first invocation.
    ///
    /// A fresh trace id is generated when `trace_id` is `None`.
    pub fn insert_step(&mut self, step: Box<dyn Step>, trace_id: Option<TraceId>) -> StepId {
        self.insert_step_as(EntityKind::Step, step, trace_id.unwrap_or_else(TraceId::generate))
    }

    /// Build a step through the factory and queue its first invocation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Factory` if the name is unknown or the constructor
    /// rejects `args`.
    pub fn spawn_step(&mut self, name: &str, args: &Value) -> Result<StepId> {
        self.spawn(EntityKind::Step, name, args, TraceId::generate())
    }

    /// Build a command through the factory and queue its first invocation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Factory` if the name is unknown or the constructor
    /// rejects `args`.
    pub fn spawn_command(&mut self, name: &str, args: &Value) -> Result<StepId> {
        self.spawn(EntityKind::Command, name, args, TraceId::generate())
    }

    fn spawn(
        &mut self,
        kind: EntityKind,
        name: &str,
        args: &Value,
        trace_id: TraceId,
    ) -> Result<StepId> {
        let step = self.factory.build_step(kind, name, args)?;
        Ok(self.insert_step_as(kind, step, trace_id))
    }

    fn insert_step_as(&mut self, kind: EntityKind, step: Box<dyn Step>, trace_id: TraceId) -> StepId {
        let id = self.allocate_step_id();
        debug!(step_id = %id, step = step.name(), %kind, trace_id = %trace_id, "step inserted");
        self.steps.insert(
            id,
            StepSlot {
                step: Some(step),
                trace_id,
                kind,
            },
        );
        self.run_queue.push_back((id, Wake::Start));
        id
    }

    // Ids count up from 1 and skip any id still held by a live step.
    fn allocate_step_id(&mut self) -> StepId {
        loop {
            let id = StepId(self.next_step_id);
            self.next_step_id = self.next_step_id.checked_add(1).unwrap_or(1);
            if !self.steps.contains_key(&id) {
                return id;
            }
        }
    }

    /// Queue a resumption of `step`.
    ///
    /// Returns `false` if the step is unknown or already finished.
    pub fn resume(&mut self, step: StepId, wake: Wake) -> bool {
        if !self.steps.contains_key(&step) {
            debug!(step_id = %step, "resume for unknown step ignored");
            return false;
        }
        self.run_queue.push_back((step, wake));
        true
    }

    /// Whether `step` is still owned by the worker.
    #[must_use]
    pub fn contains_step(&self, step: StepId) -> bool {
        self.steps.contains_key(&step)
    }

    /// Namespace `step` was created under.
    #[must_use]
    pub fn step_kind(&self, step: StepId) -> Option<EntityKind> {
        self.steps.get(&step).map(|slot| slot.kind)
    }

    /// Trace id `step` runs under.
    #[must_use]
    pub fn step_trace(&self, step: StepId) -> Option<&TraceId> {
        self.steps.get(&step).map(|slot| &slot.trace_id)
    }

    /// Borrow a parked step as its concrete type.
    #[must_use]
    pub fn step_ref<S: Step>(&self, step: StepId) -> Option<&S> {
        self.steps
            .get(&step)?
            .step
            .as_deref()?
            .downcast_ref::<S>()
    }

    /// Number of live steps.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Whether resumptions are queued.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.run_queue.is_empty()
    }

    /// Number of queued resumptions.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.run_queue.len()
    }

    /// Execute queued resumptions in order, up to the per-turn limit.
    ///
    /// Resumptions queued while the turn runs are executed in the same turn
    /// as long as the limit allows. Returns the number of step invocations.
    pub fn run_pending(&mut self) -> usize {
        let mut executed = 0;
        while executed < self.max_turn_resumptions {
            let Some((step, wake)) = self.run_queue.pop_front() else {
                break;
            };
            if self.invoke(step, wake) {
                executed += 1;
            }
        }
        executed
    }

    fn invoke(&mut self, id: StepId, wake: Wake) -> bool {
        let Some(slot) = self.steps.get_mut(&id) else {
            debug!(step_id = %id, "resumption for finished step skipped");
            return false;
        };
        let Some(mut step) = slot.step.take() else {
            warn!(step_id = %id, "re-entrant resumption skipped");
            return false;
        };
        let trace_id = slot.trace_id.clone();

        let span = info_span!("step", step_id = %id, step = step.name(), trace_id = %trace_id);
        let status = {
            let _guard = span.enter();
            let mut ctx = StepContext::new(self, id, trace_id);
            let status = step.run(&mut ctx, wake);
            debug!(?status, "step returned");
            status
        };

        if status.is_finished() {
            self.steps.remove(&id);
        } else if let Some(slot) = self.steps.get_mut(&id) {
            slot.step = Some(step);
        }
        true
    }

    // ── Sessions ────────────────────────────────────────

    /// Register a session built outside the factory and arm its deadline.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Factory` if the key is already registered.
    pub fn insert_session(
        &mut self,
        blueprint: SessionBlueprint,
        trace_id: Option<TraceId>,
    ) -> Result<EntityIndex> {
        let SessionBlueprint { key, timeout, kind } = blueprint;
        if self.registry.contains_key(&key) {
            return Err(AppError::Factory(format!(
                "session key {key} already registered"
            )));
        }
        let timeout = timeout.unwrap_or(self.default_timeout);
        let trace_id = trace_id.unwrap_or_else(TraceId::generate);
        let session = Session::new(key.clone(), timeout, trace_id, self.dedupe_waiters, kind);
        info!(session = %key, kind = session.kind_name(), trace_id = %session.trace_id(), timeout_secs = timeout.as_secs_f64(), "session created");

        let index = self.sessions.insert(session);
        self.registry.insert(key, index);
        self.timers.arm(index, self.now + timeout);
        Ok(index)
    }

    /// Build a session or module through the factory and register it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Factory` if the name is unknown, the constructor
    /// rejects `args`, or the produced key is already registered.
    pub fn create_session(
        &mut self,
        kind: EntityKind,
        name: &str,
        args: &Value,
        trace_id: Option<TraceId>,
    ) -> Result<EntityIndex> {
        let blueprint = self.factory.build_session(kind, name, args)?;
        self.insert_session(blueprint, trace_id)
    }

    /// Look up a session by key, refreshing its deadline when configured to.
    pub fn find_session(&mut self, key: &SessionKey) -> Option<EntityIndex> {
        let index = *self.registry.get(key)?;
        if self.refresh_on_access {
            self.refresh_session(index);
        }
        Some(index)
    }

    /// Borrow a live session.
    #[must_use]
    pub fn session(&self, index: EntityIndex) -> Option<&Session> {
        self.sessions.get(index)
    }

    /// Mutably borrow a live session.
    pub fn session_mut(&mut self, index: EntityIndex) -> Option<&mut Session> {
        self.sessions.get_mut(index)
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Armed deadline of a session.
    #[must_use]
    pub fn session_deadline(&self, index: EntityIndex) -> Option<Duration> {
        self.timers.deadline(index)
    }

    /// Earliest armed session deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Duration> {
        self.timers.next_deadline()
    }

    /// Push a session's deadline to `now + timeout`.
    ///
    /// Returns `false` if the session no longer exists.
    pub fn refresh_session(&mut self, index: EntityIndex) -> bool {
        let Some(session) = self.sessions.get(index) else {
            return false;
        };
        self.timers.arm(index, self.now + session.timeout());
        true
    }

    /// Mark a session ready and queue every waiter for resumption.
    ///
    /// Returns the number of waiters handed to the run queue.
    pub fn set_ready(&mut self, index: EntityIndex) -> usize {
        let Some(session) = self.sessions.get_mut(index) else {
            return 0;
        };
        session.set_ready();
        let resumed = drain_waiters(session, &mut self.run_queue, &Wake::SessionReady(index));
        if resumed > 0 {
            debug!(session = %session.key(), resumed, "waiters queued for resumption");
        }
        resumed
    }

    /// Destroy a session, failing its waiters with [`Wake::SessionDiscarded`].
    ///
    /// Returns `false` if the session no longer exists.
    pub fn discard_session(&mut self, index: EntityIndex) -> bool {
        let Some(session) = self.sessions.get_mut(index) else {
            return false;
        };
        let failed = drain_waiters(session, &mut self.run_queue, &Wake::SessionDiscarded(index));
        info!(session = %session.key(), failed, "session discarded");
        self.remove_session(index);
        true
    }

    fn remove_session(&mut self, index: EntityIndex) -> Option<Session> {
        let session = self.sessions.remove(index)?;
        self.registry.remove(session.key());
        self.timers.cancel(index);
        Some(session)
    }

    // ── Time ────────────────────────────────────────────

    /// Move the clock to `now` and fire every elapsed session deadline.
    ///
    /// The clock never moves backwards. Returns the number of timeout hooks
    /// invoked.
    pub fn advance(&mut self, now: Duration) -> usize {
        if now > self.now {
            self.now = now;
        }
        let mut fired = 0;
        while let Some(index) = self.timers.pop_expired(self.now) {
            if self.on_session_timeout(index) {
                fired += 1;
            }
        }
        fired
    }

    fn on_session_timeout(&mut self, index: EntityIndex) -> bool {
        let Some(session) = self.sessions.get_mut(index) else {
            return false;
        };
        let span = session.span();
        let _guard = span.enter();
        let Some(mut kind) = session.take_kind() else {
            warn!("re-entrant timeout skipped");
            return false;
        };
        let snapshot = session.snapshot();
        let trace_id = session.trace_id().clone();

        let action = {
            let mut scope = SessionScope::new(self, index, trace_id);
            kind.timeout(&snapshot, &mut scope)
        };

        let now = self.now;
        let Some(session) = self.sessions.get_mut(index) else {
            return true;
        };
        session.restore_kind(kind);
        let waiting = session.waiting_len();
        info!(?action, waiting, "session deadline elapsed");

        match action {
            TimeoutAction::Continue => {
                if waiting > 0 {
                    warn!(waiting, "session kept alive with parked steps");
                }
                self.timers.arm(index, now + session.timeout());
            }
            TimeoutAction::Retry => {
                let failed =
                    drain_waiters(session, &mut self.run_queue, &Wake::SessionTimedOut(index));
                session.reset();
                self.timers.arm(index, now + session.timeout());
                debug!(failed, "session reset for retry");
            }
            TimeoutAction::Release => {
                let failed =
                    drain_waiters(session, &mut self.run_queue, &Wake::SessionTimedOut(index));
                self.remove_session(index);
                debug!(failed, "session released");
            }
        }
        true
    }

    /// Drop every session and step and clear the run queue.
    pub fn shutdown(&mut self) {
        let sessions = self.sessions.len();
        let steps = self.steps.len();
        let pending = self.run_queue.len();
        for index in self.sessions.indices() {
            self.remove_session(index);
        }
        self.steps.clear();
        self.run_queue.clear();
        info!(sessions, steps, pending, "worker shut down");
    }

    // ── Scoped creation ─────────────────────────────────

    fn create_step_traced(
        &mut self,
        kind: EntityKind,
        name: &str,
        args: &Value,
        trace_id: TraceId,
    ) -> Option<StepId> {
        match self.spawn(kind, name, args, trace_id) {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(%err, %kind, name, "entity creation failed");
                None
            }
        }
    }

    fn create_session_traced(
        &mut self,
        kind: EntityKind,
        name: &str,
        args: &Value,
        trace_id: TraceId,
    ) -> Option<EntityIndex> {
        match self.create_session(kind, name, args, Some(trace_id)) {
            Ok(index) => Some(index),
            Err(err) => {
                warn!(%err, %kind, name, "entity creation failed");
                None
            }
        }
    }
}

fn drain_waiters(
    session: &mut Session,
    run_queue: &mut VecDeque<(StepId, Wake)>,
    wake: &Wake,
) -> usize {
    let mut drained = 0;
    while let Some(step) = session.pop_waiting_step() {
        run_queue.push_back((step, wake.clone()));
        drained += 1;
    }
    drained
}
