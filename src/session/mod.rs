//! Session readiness state machine and timeout hook.
//!
//! A [`Session`] holds shared, externally sourced state for one worker.
//! Steps that need the data follow a fixed protocol:
//!
//! 1. call [`Session::is_ready`]; on `true` read the data directly,
//! 2. otherwise call [`Session::is_loading`]; on `true` return
//!    [`CmdStatus::Running`](crate::models::status::CmdStatus::Running)
//!    and wait to be resumed,
//! 3. otherwise call [`Session::set_loading`], start the load, and call
//!    [`StepContext::set_ready`](crate::worker::StepContext::set_ready)
//!    once the data is in place.
//!
//! Every step that observes a non-ready session is enrolled in the waiting
//! queue by `is_ready` itself. The owning worker drains that queue in FIFO
//! order after `set_ready`, or fails it when the timeout hook asks to.

mod waiting;

use std::time::Duration;

use chrono::{DateTime, Utc};
use downcast_rs::{impl_downcast, Downcast};
use serde::Serialize;
use tracing::{debug, info_span, Span};

use crate::models::ids::{SessionKey, StepId, TraceId};
use crate::models::status::TimeoutAction;
use crate::worker::SessionScope;

use self::waiting::WaitingSteps;

/// Load state of a session's backing data.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    /// No load has started in this cycle.
    Unloaded,
    /// A load is in flight.
    Loading,
    /// Data is available until the next [`Session::reset`].
    Ready,
}

/// Read-only view handed to a timeout hook.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Session identifier.
    pub key: SessionKey,
    /// Correlation token of the session.
    pub trace_id: TraceId,
    /// Load state when the snapshot was taken.
    pub state: LoadState,
    /// Current load cycle (0-based).
    pub cycle: u32,
    /// Number of steps still parked on the session.
    pub waiting: usize,
}

/// Per-kind behaviour and data of a session.
///
/// Implementors hold whatever the session loads and decide what happens when
/// the session's deadline elapses. Steps reach the concrete type through
/// [`Session::kind_ref`] / [`Session::kind_mut`].
pub trait SessionKind: Downcast + Send {
    /// Registered type name, used in log records.
    fn name(&self) -> &str;

    /// Called by the worker when the session's deadline elapses.
    ///
    /// `scope` creates entities under the session's trace id and logs with
    /// the session's fields. The kind is detached from its session for the
    /// duration of the call, so [`Session::kind_ref`] yields `None` until the
    /// hook returns.
    fn timeout(
        &mut self,
        snapshot: &SessionSnapshot,
        scope: &mut SessionScope<'_>,
    ) -> TimeoutAction;
}

impl_downcast!(SessionKind);

/// Shared unit of state owned by exactly one worker.
pub struct Session {
    key: SessionKey,
    timeout: Duration,
    trace_id: TraceId,
    state: LoadState,
    cycle: u32,
    waiting: WaitingSteps,
    created_at: DateTime<Utc>,
    kind_name: String,
    // `None` while the timeout hook runs.
    kind: Option<Box<dyn SessionKind>>,
}

impl Session {
    /// Construct an unloaded session.
    #[must_use]
    pub fn new(
        key: SessionKey,
        timeout: Duration,
        trace_id: TraceId,
        dedupe_waiters: bool,
        kind: Box<dyn SessionKind>,
    ) -> Self {
        Self {
            key,
            timeout,
            trace_id,
            state: LoadState::Unloaded,
            cycle: 0,
            waiting: WaitingSteps::new(dedupe_waiters),
            created_at: Utc::now(),
            kind_name: kind.name().to_owned(),
            kind: Some(kind),
        }
    }

    /// Whether the data is ready.
    ///
    /// When it is not, `caller` is enrolled for resumption and is expected
    /// to yield rather than poll again.
    pub fn is_ready(&mut self, caller: StepId) -> bool {
        if self.state == LoadState::Ready {
            return true;
        }
        if self.waiting.enroll(caller) {
            debug!(session = %self.key, step_id = %caller, waiting = self.waiting.len(), "step enrolled");
        }
        false
    }

    /// Whether a load is in flight.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.state == LoadState::Loading
    }

    /// Mark a load as started.
    ///
    /// No-op while loading. A ready session must be [`reset`](Self::reset)
    /// before a new load can start.
    pub fn set_loading(&mut self) {
        match self.state {
            LoadState::Unloaded => {
                self.state = LoadState::Loading;
                debug!(session = %self.key, cycle = self.cycle, "session loading");
            }
            LoadState::Loading => {}
            LoadState::Ready => {
                debug!(session = %self.key, "set_loading ignored on ready session");
            }
        }
    }

    /// Mark the data as ready. Idempotent.
    ///
    /// Only reachable through the owning worker, which drains the waiting
    /// queue right after; see [`crate::worker::StepContext::set_ready`].
    pub(crate) fn set_ready(&mut self) {
        if self.state != LoadState::Ready {
            self.state = LoadState::Ready;
            debug!(session = %self.key, cycle = self.cycle, waiting = self.waiting.len(), "session ready");
        }
    }

    /// Start a new load cycle. Queued waiters stay queued.
    pub fn reset(&mut self) {
        self.state = LoadState::Unloaded;
        self.cycle = self.cycle.wrapping_add(1);
        debug!(session = %self.key, cycle = self.cycle, "session reset");
    }

    /// Dequeue the next waiting step. Only the owning worker drains.
    pub(crate) fn pop_waiting_step(&mut self) -> Option<StepId> {
        self.waiting.pop()
    }

    /// Session identifier.
    #[must_use]
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Deadline applied after each arm or refresh.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Correlation token of the session.
    #[must_use]
    pub fn trace_id(&self) -> &TraceId {
        &self.trace_id
    }

    /// Current load state.
    #[must_use]
    pub fn state(&self) -> LoadState {
        self.state
    }

    /// Current load cycle (0-based).
    #[must_use]
    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    /// Number of parked steps.
    #[must_use]
    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    /// Whether `step` is parked on this session.
    #[must_use]
    pub fn is_waiting(&self, step: StepId) -> bool {
        self.waiting.contains(step)
    }

    /// Creation timestamp.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Registered type name of the session kind.
    #[must_use]
    pub fn kind_name(&self) -> &str {
        &self.kind_name
    }

    /// Borrow the concrete session kind.
    #[must_use]
    pub fn kind_ref<K: SessionKind>(&self) -> Option<&K> {
        self.kind.as_deref()?.downcast_ref::<K>()
    }

    /// Mutably borrow the concrete session kind.
    pub fn kind_mut<K: SessionKind>(&mut self) -> Option<&mut K> {
        self.kind.as_deref_mut()?.downcast_mut::<K>()
    }

    /// Read-only view of the coordination state.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            key: self.key.clone(),
            trace_id: self.trace_id.clone(),
            state: self.state,
            cycle: self.cycle,
            waiting: self.waiting.len(),
        }
    }

    /// Span carrying the session's correlation fields.
    #[must_use]
    pub fn span(&self) -> Span {
        info_span!("session", session = %self.key, kind = %self.kind_name, trace_id = %self.trace_id)
    }

    pub(crate) fn take_kind(&mut self) -> Option<Box<dyn SessionKind>> {
        self.kind.take()
    }

    pub(crate) fn restore_kind(&mut self, kind: Box<dyn SessionKind>) {
        self.kind = Some(kind);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("kind", &self.kind_name)
            .field("state", &self.state)
            .field("cycle", &self.cycle)
            .field("waiting", &self.waiting)
            .field("trace_id", &self.trace_id)
            .finish_non_exhaustive()
    }
}
