//! Per-invocation view of the worker handed to a running step.

use std::panic::Location;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, trace, warn, Level};

use crate::models::ids::{EntityIndex, SessionKey, StepId, TraceId};
use crate::models::status::Wake;
use crate::session::{Session, SessionKind};

use super::factory::EntityKind;
use super::{Step, Worker};

/// Coordination and creation API available to a step while it runs.
///
/// Everything created through the context inherits the running step's trace
/// id. Use [`StepContext::scope`] to create entities under a session's trace
/// id instead.
pub struct StepContext<'w> {
    worker: &'w mut Worker,
    step_id: StepId,
    trace_id: TraceId,
}

impl<'w> StepContext<'w> {
    pub(super) fn new(worker: &'w mut Worker, step_id: StepId, trace_id: TraceId) -> Self {
        Self {
            worker,
            step_id,
            trace_id,
        }
    }

    /// Identifier of the running step.
    #[must_use]
    pub fn step_id(&self) -> StepId {
        self.step_id
    }

    /// Trace id of the running step.
    #[must_use]
    pub fn trace_id(&self) -> &TraceId {
        &self.trace_id
    }

    /// Worker clock.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.worker.now()
    }

    // ── Session coordination ────────────────────────────

    /// Whether the session's data is ready; enrolls the running step if not.
    ///
    /// A missing session reports `false` without enrolling anything.
    pub fn is_ready(&mut self, session: EntityIndex) -> bool {
        let caller = self.step_id;
        self.worker
            .session_mut(session)
            .is_some_and(|s| s.is_ready(caller))
    }

    /// Whether a load is in flight for the session.
    #[must_use]
    pub fn is_loading(&self, session: EntityIndex) -> bool {
        self.worker.session(session).is_some_and(Session::is_loading)
    }

    /// Mark the running step as the session's loader.
    pub fn set_loading(&mut self, session: EntityIndex) {
        if let Some(s) = self.worker.session_mut(session) {
            s.set_loading();
        }
    }

    /// Mark the session ready and queue its waiters for resumption.
    ///
    /// Returns the number of waiters queued.
    pub fn set_ready(&mut self, session: EntityIndex) -> usize {
        self.worker.set_ready(session)
    }

    /// Start a new load cycle on the session.
    ///
    /// Returns `false` if the session no longer exists.
    pub fn reset(&mut self, session: EntityIndex) -> bool {
        let Some(s) = self.worker.session_mut(session) else {
            return false;
        };
        s.reset();
        true
    }

    /// Borrow a live session.
    #[must_use]
    pub fn session(&self, session: EntityIndex) -> Option<&Session> {
        self.worker.session(session)
    }

    /// Mutably borrow a live session.
    pub fn session_mut(&mut self, session: EntityIndex) -> Option<&mut Session> {
        self.worker.session_mut(session)
    }

    /// Mutably borrow a session's concrete kind.
    pub fn session_kind<K: SessionKind>(&mut self, session: EntityIndex) -> Option<&mut K> {
        self.worker.session_mut(session)?.kind_mut::<K>()
    }

    /// Look up a session by key.
    pub fn find_session(&mut self, key: &SessionKey) -> Option<EntityIndex> {
        self.worker.find_session(key)
    }

    /// Push the session's deadline out by its timeout.
    pub fn refresh_session(&mut self, session: EntityIndex) -> bool {
        self.worker.refresh_session(session)
    }

    /// Queue a resumption of another step.
    pub fn resume(&mut self, step: StepId, wake: Wake) -> bool {
        self.worker.resume(step, wake)
    }

    // ── Scoped creation ─────────────────────────────────

    /// Insert an already built step under the running step's trace.
    pub fn insert_step(&mut self, step: Box<dyn Step>) -> StepId {
        self.worker
            .insert_step_as(EntityKind::Step, step, self.trace_id.clone())
    }

    /// Create a registered step. `None` if creation failed.
    pub fn create_step(&mut self, name: &str, args: &Value) -> Option<StepId> {
        self.worker
            .create_step_traced(EntityKind::Step, name, args, self.trace_id.clone())
    }

    /// Create a registered command. `None` if creation failed.
    pub fn create_command(&mut self, name: &str, args: &Value) -> Option<StepId> {
        self.worker
            .create_step_traced(EntityKind::Command, name, args, self.trace_id.clone())
    }

    /// Create a registered session. `None` if creation failed.
    pub fn create_session(&mut self, name: &str, args: &Value) -> Option<EntityIndex> {
        self.worker
            .create_session_traced(EntityKind::Session, name, args, self.trace_id.clone())
    }

    /// Create a registered module. `None` if creation failed.
    pub fn create_module(&mut self, name: &str, args: &Value) -> Option<EntityIndex> {
        self.worker
            .create_session_traced(EntityKind::Module, name, args, self.trace_id.clone())
    }

    /// Creation and logging scoped to a session's trace id.
    pub fn scope(&mut self, session: EntityIndex) -> Option<SessionScope<'_>> {
        let trace_id = self.worker.session(session)?.trace_id().clone();
        Some(SessionScope::new(self.worker, session, trace_id))
    }
}

/// Entity creation and logging tagged with one session's trace id.
///
/// Obtained from [`StepContext::scope`] inside a step, and handed to
/// [`SessionKind::timeout`] when the session's deadline elapses.
pub struct SessionScope<'c> {
    worker: &'c mut Worker,
    session: EntityIndex,
    trace_id: TraceId,
}

impl<'c> SessionScope<'c> {
    pub(super) fn new(worker: &'c mut Worker, session: EntityIndex, trace_id: TraceId) -> Self {
        Self {
            worker,
            session,
            trace_id,
        }
    }

    /// Handle of the scoping session.
    #[must_use]
    pub fn index(&self) -> EntityIndex {
        self.session
    }

    /// Trace id inherited by created entities.
    #[must_use]
    pub fn trace_id(&self) -> &TraceId {
        &self.trace_id
    }

    /// Create a registered step. `None` if creation failed.
    pub fn create_step(&mut self, name: &str, args: &Value) -> Option<StepId> {
        self.worker
            .create_step_traced(EntityKind::Step, name, args, self.trace_id.clone())
    }

    /// Create a registered command. `None` if creation failed.
    pub fn create_command(&mut self, name: &str, args: &Value) -> Option<StepId> {
        self.worker
            .create_step_traced(EntityKind::Command, name, args, self.trace_id.clone())
    }

    /// Create a registered session. `None` if creation failed.
    pub fn create_session(&mut self, name: &str, args: &Value) -> Option<EntityIndex> {
        self.worker
            .create_session_traced(EntityKind::Session, name, args, self.trace_id.clone())
    }

    /// Create a registered module. `None` if creation failed.
    pub fn create_module(&mut self, name: &str, args: &Value) -> Option<EntityIndex> {
        self.worker
            .create_session_traced(EntityKind::Module, name, args, self.trace_id.clone())
    }

    /// Emit a log record tagged with the session and the caller's location.
    #[track_caller]
    pub fn log(&self, level: Level, message: &str) {
        let location = Location::caller();
        let Some(session) = self.worker.session(self.session) else {
            return;
        };
        let span = session.span();
        let _guard = span.enter();
        match level {
            Level::ERROR => error!(%location, "{message}"),
            Level::WARN => warn!(%location, "{message}"),
            Level::INFO => info!(%location, "{message}"),
            Level::DEBUG => debug!(%location, "{message}"),
            _ => trace!(%location, "{message}"),
        }
    }
}
