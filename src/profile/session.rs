//! Per-user profile session.

use tracing::info;

use crate::models::status::TimeoutAction;
use crate::session::{LoadState, SessionKind, SessionSnapshot};
use crate::worker::SessionScope;

use super::Profile;

/// Session kind caching one user's profile.
#[derive(Debug)]
pub struct ProfileSession {
    user: String,
    profile: Option<Profile>,
    timeout_action: TimeoutAction,
    timeouts: u32,
}

impl ProfileSession {
    /// Empty session for `user` applying `timeout_action` on expiry.
    #[must_use]
    pub fn new(user: String, timeout_action: TimeoutAction) -> Self {
        Self {
            user,
            profile: None,
            timeout_action,
            timeouts: 0,
        }
    }

    /// Cached profile, if loaded.
    #[must_use]
    pub fn profile(&self) -> Option<&Profile> {
        self.profile.as_ref()
    }

    /// Store a freshly loaded profile.
    pub fn store(&mut self, profile: Profile) {
        self.profile = Some(profile);
    }

    /// Drop the cached profile.
    pub fn clear(&mut self) {
        self.profile = None;
    }

    /// Number of elapsed deadlines seen by this session.
    #[must_use]
    pub fn timeouts(&self) -> u32 {
        self.timeouts
    }
}

impl SessionKind for ProfileSession {
    fn name(&self) -> &str {
        super::SESSION
    }

    fn timeout(
        &mut self,
        snapshot: &SessionSnapshot,
        _scope: &mut SessionScope<'_>,
    ) -> TimeoutAction {
        self.timeouts += 1;
        // An idle, loaded session has nothing to retry.
        let action = match self.timeout_action {
            TimeoutAction::Retry if snapshot.state == LoadState::Ready && snapshot.waiting == 0 => {
                TimeoutAction::Continue
            }
            action => action,
        };
        if action == TimeoutAction::Retry {
            self.profile = None;
        }
        info!(user = %self.user, ?action, state = ?snapshot.state, "profile session expired");
        action
    }
}
