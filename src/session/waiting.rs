//! FIFO queue of steps parked on a session's data.

use std::collections::{HashSet, VecDeque};

use crate::models::ids::StepId;

/// Ordered collection of steps that asked for data before it was ready.
///
/// With de-duplication enabled a step is queued at most once until it is
/// popped again; otherwise every enrollment appends.
#[derive(Debug, Default)]
pub(crate) struct WaitingSteps {
    queue: VecDeque<StepId>,
    queued: HashSet<StepId>,
    dedupe: bool,
}

impl WaitingSteps {
    /// Create an empty queue.
    #[must_use]
    pub(crate) fn new(dedupe: bool) -> Self {
        Self {
            queue: VecDeque::new(),
            queued: HashSet::new(),
            dedupe,
        }
    }

    /// Append `step` unless it is already queued in de-duplicating mode.
    ///
    /// Returns `true` when the step was appended.
    pub(crate) fn enroll(&mut self, step: StepId) -> bool {
        if self.dedupe && !self.queued.insert(step) {
            return false;
        }
        self.queue.push_back(step);
        true
    }

    /// Remove and return the oldest queued step.
    pub(crate) fn pop(&mut self) -> Option<StepId> {
        let step = self.queue.pop_front()?;
        if self.dedupe {
            self.queued.remove(&step);
        }
        Some(step)
    }

    /// Number of queued entries.
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether `step` is currently queued.
    #[must_use]
    pub(crate) fn contains(&self, step: StepId) -> bool {
        if self.dedupe {
            self.queued.contains(&step)
        } else {
            self.queue.contains(&step)
        }
    }
}
