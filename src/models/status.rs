//! Status codes exchanged between steps, sessions, and the worker.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::EntityIndex;

/// Result of a single step invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CmdStatus {
    /// The step yielded and expects to be resumed later.
    Running,
    /// The step finished its work and can be released.
    Completed,
    /// The step failed and can be released.
    Fault,
}

impl CmdStatus {
    /// Whether the worker should drop the step after this status.
    #[must_use]
    pub fn is_finished(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Outcome of a session timeout hook.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Keep the session and re-arm its deadline; waiters stay parked.
    Continue,
    /// Fail waiters, start a fresh load cycle, and re-arm the deadline.
    Retry,
    /// Fail waiters and destroy the session.
    Release,
}

/// Reason a step is being invoked.
#[derive(Debug, Clone, PartialEq)]
pub enum Wake {
    /// First invocation after the step was inserted into the worker.
    Start,
    /// The session the step waited on became ready.
    SessionReady(EntityIndex),
    /// The session the step waited on timed out before becoming ready.
    SessionTimedOut(EntityIndex),
    /// The session the step waited on was discarded by the worker.
    SessionDiscarded(EntityIndex),
    /// A collaborator delivered a payload (a finished fetch, a reply).
    External(Value),
}
