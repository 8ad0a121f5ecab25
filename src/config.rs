//! Worker configuration parsing and validation.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::models::status::TimeoutAction;
use crate::{AppError, Result};

/// Settings for the bundled `profile` service.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProfileConfig {
    /// Simulated store latency for a single profile fetch.
    #[serde(default = "default_fetch_delay_millis")]
    pub fetch_delay_millis: u64,
    /// Outcome returned by profile sessions when their deadline elapses.
    #[serde(default = "default_timeout_action")]
    pub timeout_action: TimeoutAction,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            fetch_delay_millis: default_fetch_delay_millis(),
            timeout_action: default_timeout_action(),
        }
    }
}

fn default_session_timeout_seconds() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_tick_millis() -> u64 {
    100
}

fn default_max_turn_resumptions() -> usize {
    1024
}

fn default_fetch_delay_millis() -> u64 {
    50
}

fn default_timeout_action() -> TimeoutAction {
    TimeoutAction::Release
}

/// Worker configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkerConfig {
    /// Deadline applied to sessions created without an explicit timeout.
    #[serde(default = "default_session_timeout_seconds")]
    pub session_timeout_seconds: u64,
    /// Enroll a step at most once per load cycle.
    #[serde(default = "default_true")]
    pub dedupe_waiters: bool,
    /// Refresh a session's deadline whenever it is looked up by key.
    #[serde(default = "default_true")]
    pub refresh_on_access: bool,
    /// Interval at which the async runtime advances the deadline queue.
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
    /// Upper bound on resumptions executed in a single worker turn.
    #[serde(default = "default_max_turn_resumptions")]
    pub max_turn_resumptions: usize,
    /// Bundled profile service settings.
    #[serde(default)]
    pub profile: ProfileConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            session_timeout_seconds: default_session_timeout_seconds(),
            dedupe_waiters: true,
            refresh_on_access: true,
            tick_millis: default_tick_millis(),
            max_turn_resumptions: default_max_turn_resumptions(),
            profile: ProfileConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, contains
    /// invalid TOML, or fails validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Default session deadline as a [`Duration`].
    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_seconds)
    }

    /// Runtime tick interval as a [`Duration`].
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }

    /// Simulated profile fetch latency as a [`Duration`].
    #[must_use]
    pub fn fetch_delay(&self) -> Duration {
        Duration::from_millis(self.profile.fetch_delay_millis)
    }

    fn validate(&self) -> Result<()> {
        if self.session_timeout_seconds == 0 {
            return Err(AppError::Config(
                "session_timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.tick_millis == 0 {
            return Err(AppError::Config(
                "tick_millis must be greater than zero".into(),
            ));
        }

        if self.max_turn_resumptions == 0 {
            return Err(AppError::Config(
                "max_turn_resumptions must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
