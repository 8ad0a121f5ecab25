//! Profile lookup service built on the session coordination primitive.
//!
//! Each user gets one `profile` session. Concurrent `profile.lookup` steps
//! for the same user share a single fetch: the first step to find the
//! session unloaded becomes the loader, the rest park until it is ready.
//! `profile.invalidate` starts a new load cycle for a user.

pub mod invalidate;
pub mod lookup;
pub mod session;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::models::ids::{SessionKey, StepId};
use crate::models::status::{TimeoutAction, Wake};
use crate::runtime::WorkerHandle;
use crate::worker::factory::{ActorFactory, SessionBlueprint};
use crate::{AppError, Result};

use self::invalidate::InvalidateCommand;
use self::lookup::LookupStep;
use self::session::ProfileSession;

/// Registered name of the profile session.
pub const SESSION: &str = "profile";
/// Registered name of the lookup step.
pub const LOOKUP: &str = "profile.lookup";
/// Registered name of the invalidation command.
pub const INVALIDATE: &str = "profile.invalidate";

/// Profile data held by a ready session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    /// User the profile belongs to.
    pub user: String,
    /// Human-readable name.
    pub display_name: String,
    /// Number of fetches the source had served when this one was issued.
    pub revision: u64,
    /// When the source produced the profile.
    pub fetched_at: DateTime<Utc>,
}

/// Final state of a lookup step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LookupStatus {
    /// The profile was read from a ready session.
    Found,
    /// The session timed out before becoming ready.
    TimedOut,
    /// The session was discarded while the step waited.
    Discarded,
    /// The session could not be created or the fetch was malformed.
    Failed,
}

/// Result reported by every finished lookup step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LookupOutcome {
    /// Step that performed the lookup.
    pub step: StepId,
    /// User that was looked up.
    pub user: String,
    /// How the lookup ended.
    pub status: LookupStatus,
    /// Profile, when found.
    pub profile: Option<Profile>,
}

/// External store the loader step fetches from.
///
/// Implementations must eventually resume `loader` with
/// [`Wake::External`] carrying a serialized [`Profile`].
pub trait ProfileSource: Send + Sync {
    /// Begin fetching the profile of `user` on behalf of `loader`.
    fn request(&self, loader: StepId, user: &str);
}

/// Registry key of a user's profile session.
#[must_use]
pub fn session_key(user: &str) -> SessionKey {
    SessionKey::Named(format!("profile:{user}"))
}

#[derive(Debug, Deserialize)]
struct UserArgs {
    user: String,
}

fn parse_user(args: &Value) -> Result<String> {
    let parsed: UserArgs = serde_json::from_value(args.clone())
        .map_err(|err| AppError::Factory(format!("invalid profile arguments: {err}")))?;
    if parsed.user.trim().is_empty() {
        return Err(AppError::Factory("profile user must not be empty".into()));
    }
    Ok(parsed.user)
}

/// Wiring for the profile session, lookup step, and invalidation command.
pub struct ProfileService {
    source: Arc<dyn ProfileSource>,
    outcomes: mpsc::UnboundedSender<LookupOutcome>,
    timeout_action: TimeoutAction,
    session_timeout: Option<Duration>,
}

impl ProfileService {
    /// Create the service; lookup results are reported on `outcomes`.
    #[must_use]
    pub fn new(
        source: Arc<dyn ProfileSource>,
        outcomes: mpsc::UnboundedSender<LookupOutcome>,
        timeout_action: TimeoutAction,
    ) -> Self {
        Self {
            source,
            outcomes,
            timeout_action,
            session_timeout: None,
        }
    }

    /// Override the worker's default deadline for profile sessions.
    #[must_use]
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Register every profile constructor with `factory`.
    pub fn register(self, factory: &mut ActorFactory) {
        let Self {
            source,
            outcomes,
            timeout_action,
            session_timeout,
        } = self;

        factory.register_session(SESSION, move |args| {
            let user = parse_user(args)?;
            let key = session_key(&user);
            let mut blueprint =
                SessionBlueprint::new(key, Box::new(ProfileSession::new(user, timeout_action)));
            if let Some(timeout) = session_timeout {
                blueprint = blueprint.with_timeout(timeout);
            }
            Ok(blueprint)
        });

        factory.register_step(LOOKUP, move |args| {
            let user = parse_user(args)?;
            Ok(Box::new(LookupStep::new(
                user,
                Arc::clone(&source),
                outcomes.clone(),
            )))
        });

        factory.register_command(INVALIDATE, move |args| {
            let user = parse_user(args)?;
            Ok(Box::new(InvalidateCommand::new(user)))
        });
    }
}

/// Source that answers every request after a fixed delay.
///
/// Stands in for a real store: the reply is delivered through the worker's
/// command channel, like any other external completion.
pub struct DelayedSource {
    handle: WorkerHandle,
    delay: Duration,
    fetches: AtomicU64,
}

impl DelayedSource {
    /// Create a source replying through `handle` after `delay`.
    #[must_use]
    pub fn new(handle: WorkerHandle, delay: Duration) -> Self {
        Self {
            handle,
            delay,
            fetches: AtomicU64::new(0),
        }
    }

    /// Number of fetches started so far.
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ProfileSource for DelayedSource {
    fn request(&self, loader: StepId, user: &str) {
        let revision = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = self.handle.clone();
        let delay = self.delay;
        let user = user.to_owned();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let profile = Profile {
                display_name: format!("Profile of {user}"),
                user,
                revision,
                fetched_at: Utc::now(),
            };
            let payload = match serde_json::to_value(&profile) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(%err, "failed to encode profile");
                    return;
                }
            };
            if let Err(err) = handle.resume(loader, Wake::External(payload)).await {
                warn!(%err, step_id = %loader, "failed to deliver profile");
            }
        });
    }
}
