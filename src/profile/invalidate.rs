//! Command that starts a new load cycle for a user's profile.

use tracing::info;

use crate::models::status::{CmdStatus, Wake};
use crate::session::{LoadState, Session};
use crate::worker::{Step, StepContext};

use super::session::ProfileSession;
use super::session_key;

/// Drops a ready profile so the next lookup fetches it again.
///
/// A load in flight is left alone.
#[derive(Debug)]
pub struct InvalidateCommand {
    user: String,
}

impl InvalidateCommand {
    /// Command invalidating `user`'s profile.
    #[must_use]
    pub fn new(user: String) -> Self {
        Self { user }
    }
}

impl Step for InvalidateCommand {
    fn name(&self) -> &str {
        super::INVALIDATE
    }

    fn run(&mut self, ctx: &mut StepContext<'_>, _wake: Wake) -> CmdStatus {
        let Some(index) = ctx.find_session(&session_key(&self.user)) else {
            info!(user = %self.user, "no profile session to invalidate");
            return CmdStatus::Completed;
        };
        if ctx.session(index).map(Session::state) != Some(LoadState::Ready) {
            info!(user = %self.user, "profile not ready; invalidation skipped");
            return CmdStatus::Completed;
        }
        if let Some(kind) = ctx.session_kind::<ProfileSession>(index) {
            kind.clear();
        }
        ctx.reset(index);
        info!(user = %self.user, "profile invalidated");
        CmdStatus::Completed
    }
}
