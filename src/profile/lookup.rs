//! Step that reads a user's profile through the single-flight protocol.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::models::ids::EntityIndex;
use crate::models::status::{CmdStatus, Wake};
use crate::worker::{Step, StepContext};

use super::session::ProfileSession;
use super::{session_key, LookupOutcome, LookupStatus, Profile, ProfileSource};

/// Timed-out lookups re-check the session this many times before failing.
const MAX_RETRIES: u32 = 1;

/// Looks up one profile, loading it if no other step is.
pub struct LookupStep {
    user: String,
    source: Arc<dyn ProfileSource>,
    outcomes: mpsc::UnboundedSender<LookupOutcome>,
    session: Option<EntityIndex>,
    loader: bool,
    retries_left: u32,
}

impl LookupStep {
    /// Lookup for `user` fetching from `source` and reporting on `outcomes`.
    #[must_use]
    pub fn new(
        user: String,
        source: Arc<dyn ProfileSource>,
        outcomes: mpsc::UnboundedSender<LookupOutcome>,
    ) -> Self {
        Self {
            user,
            source,
            outcomes,
            session: None,
            loader: false,
            retries_left: MAX_RETRIES,
        }
    }

    /// Whether this step started the fetch for its session.
    #[must_use]
    pub fn is_loader(&self) -> bool {
        self.loader
    }

    fn resolve(&self, ctx: &mut StepContext<'_>) -> Option<EntityIndex> {
        let key = session_key(&self.user);
        ctx.find_session(&key)
            .or_else(|| ctx.create_session(super::SESSION, &json!({ "user": self.user })))
    }

    fn check(&mut self, ctx: &mut StepContext<'_>, index: EntityIndex) -> CmdStatus {
        // Released between the ready drain and this resumption.
        if ctx.session(index).is_none() {
            warn!(user = %self.user, "profile session gone before lookup resumed");
            return self.finish(ctx, LookupStatus::Discarded, None);
        }
        if ctx.is_ready(index) {
            let profile = ctx
                .session_kind::<ProfileSession>(index)
                .and_then(|session| session.profile().cloned());
            return match profile {
                Some(profile) => self.finish(ctx, LookupStatus::Found, Some(profile)),
                None => self.finish(ctx, LookupStatus::Failed, None),
            };
        }
        if ctx.is_loading(index) {
            debug!(user = %self.user, "profile load in flight; waiting");
            return CmdStatus::Running;
        }
        ctx.set_loading(index);
        self.loader = true;
        info!(user = %self.user, "fetching profile");
        self.source.request(ctx.step_id(), &self.user);
        CmdStatus::Running
    }

    fn on_fetched(&mut self, ctx: &mut StepContext<'_>, payload: Value) -> CmdStatus {
        let Some(index) = self.session.filter(|_| self.loader) else {
            debug!(user = %self.user, "unexpected payload ignored");
            return CmdStatus::Running;
        };
        self.loader = false;

        let profile = match serde_json::from_value::<Profile>(payload) {
            Ok(profile) => profile,
            Err(err) => {
                warn!(%err, user = %self.user, "malformed profile payload");
                return self.finish(ctx, LookupStatus::Failed, None);
            }
        };
        let Some(session) = ctx.session_kind::<ProfileSession>(index) else {
            warn!(user = %self.user, "profile session gone before fetch completed");
            return self.finish(ctx, LookupStatus::Discarded, None);
        };
        session.store(profile);

        // This step is enrolled too and reads the profile on its own resumption.
        let resumed = ctx.set_ready(index);
        debug!(user = %self.user, resumed, "profile ready");
        CmdStatus::Running
    }

    fn on_timed_out(&mut self, ctx: &mut StepContext<'_>, index: EntityIndex) -> CmdStatus {
        self.loader = false;
        if self.retries_left > 0 && ctx.session(index).is_some() {
            self.retries_left -= 1;
            info!(user = %self.user, "profile session timed out; checking again");
            return self.check(ctx, index);
        }
        self.finish(ctx, LookupStatus::TimedOut, None)
    }

    fn finish(
        &self,
        ctx: &StepContext<'_>,
        status: LookupStatus,
        profile: Option<Profile>,
    ) -> CmdStatus {
        info!(user = %self.user, ?status, "lookup finished");
        let outcome = LookupOutcome {
            step: ctx.step_id(),
            user: self.user.clone(),
            status,
            profile,
        };
        if self.outcomes.send(outcome).is_err() {
            debug!(user = %self.user, "lookup outcome receiver dropped");
        }
        match status {
            LookupStatus::Found => CmdStatus::Completed,
            LookupStatus::TimedOut | LookupStatus::Discarded | LookupStatus::Failed => {
                CmdStatus::Fault
            }
        }
    }
}

impl Step for LookupStep {
    fn name(&self) -> &str {
        super::LOOKUP
    }

    fn run(&mut self, ctx: &mut StepContext<'_>, wake: Wake) -> CmdStatus {
        match wake {
            Wake::Start => {
                let Some(index) = self.resolve(ctx) else {
                    return self.finish(ctx, LookupStatus::Failed, None);
                };
                self.session = Some(index);
                self.check(ctx, index)
            }
            Wake::SessionReady(index) => self.check(ctx, index),
            Wake::External(payload) => self.on_fetched(ctx, payload),
            Wake::SessionTimedOut(index) => self.on_timed_out(ctx, index),
            Wake::SessionDiscarded(_) => self.finish(ctx, LookupStatus::Discarded, None),
        }
    }
}
