//! Name-based registry of step, command, session, and module constructors.
//!
//! Commands are steps registered under their own namespace and modules are
//! sessions registered under theirs; both are stored in the same arenas as
//! the entities they specialise.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde_json::Value;

use crate::models::ids::SessionKey;
use crate::session::SessionKind;
use crate::{AppError, Result};

use super::Step;

/// Namespace an entity constructor is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// Plain step.
    Step,
    /// Command step.
    Command,
    /// Plain session.
    Session,
    /// Module session.
    Module,
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Step => f.write_str("step"),
            Self::Command => f.write_str("command"),
            Self::Session => f.write_str("session"),
            Self::Module => f.write_str("module"),
        }
    }
}

/// Everything the worker needs to register a new session.
pub struct SessionBlueprint {
    /// Registry key; must not be registered yet.
    pub key: SessionKey,
    /// Deadline override; the worker default applies when `None`.
    pub timeout: Option<Duration>,
    /// Per-kind behaviour and data.
    pub kind: Box<dyn SessionKind>,
}

impl SessionBlueprint {
    /// Blueprint using the worker's default deadline.
    #[must_use]
    pub fn new(key: impl Into<SessionKey>, kind: Box<dyn SessionKind>) -> Self {
        Self {
            key: key.into(),
            timeout: None,
            kind,
        }
    }

    /// Override the session deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Constructor for steps and commands.
pub type StepConstructor = Box<dyn Fn(&Value) -> Result<Box<dyn Step>> + Send>;

/// Constructor for sessions and modules.
pub type SessionConstructor = Box<dyn Fn(&Value) -> Result<SessionBlueprint> + Send>;

/// Registry of named entity constructors owned by a worker.
#[derive(Default)]
pub struct ActorFactory {
    steps: HashMap<String, StepConstructor>,
    commands: HashMap<String, StepConstructor>,
    sessions: HashMap<String, SessionConstructor>,
    modules: HashMap<String, SessionConstructor>,
}

impl ActorFactory {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step constructor under `name`, replacing any previous one.
    pub fn register_step<F>(&mut self, name: impl Into<String>, ctor: F)
    where
        F: Fn(&Value) -> Result<Box<dyn Step>> + Send + 'static,
    {
        self.steps.insert(name.into(), Box::new(ctor));
    }

    /// Register a command constructor under `name`.
    pub fn register_command<F>(&mut self, name: impl Into<String>, ctor: F)
    where
        F: Fn(&Value) -> Result<Box<dyn Step>> + Send + 'static,
    {
        self.commands.insert(name.into(), Box::new(ctor));
    }

    /// Register a session constructor under `name`.
    pub fn register_session<F>(&mut self, name: impl Into<String>, ctor: F)
    where
        F: Fn(&Value) -> Result<SessionBlueprint> + Send + 'static,
    {
        self.sessions.insert(name.into(), Box::new(ctor));
    }

    /// Register a module constructor under `name`.
    pub fn register_module<F>(&mut self, name: impl Into<String>, ctor: F)
    where
        F: Fn(&Value) -> Result<SessionBlueprint> + Send + 'static,
    {
        self.modules.insert(name.into(), Box::new(ctor));
    }

    /// Whether a constructor is registered for `name` in `kind`'s namespace.
    #[must_use]
    pub fn contains(&self, kind: EntityKind, name: &str) -> bool {
        match kind {
            EntityKind::Step => self.steps.contains_key(name),
            EntityKind::Command => self.commands.contains_key(name),
            EntityKind::Session => self.sessions.contains_key(name),
            EntityKind::Module => self.modules.contains_key(name),
        }
    }

    /// Build a step or command.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Factory` if `kind` is not a step namespace, the
    /// name is unknown, or the constructor rejects `args`.
    pub fn build_step(&self, kind: EntityKind, name: &str, args: &Value) -> Result<Box<dyn Step>> {
        let table = match kind {
            EntityKind::Step => &self.steps,
            EntityKind::Command => &self.commands,
            EntityKind::Session | EntityKind::Module => {
                return Err(AppError::Factory(format!("{kind} {name} is not a step")));
            }
        };
        let ctor = table
            .get(name)
            .ok_or_else(|| AppError::Factory(format!("unknown {kind} {name}")))?;
        ctor(args)
    }

    /// Build a session or module blueprint.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Factory` if `kind` is not a session namespace, the
    /// name is unknown, or the constructor rejects `args`.
    pub fn build_session(
        &self,
        kind: EntityKind,
        name: &str,
        args: &Value,
    ) -> Result<SessionBlueprint> {
        let table = match kind {
            EntityKind::Session => &self.sessions,
            EntityKind::Module => &self.modules,
            EntityKind::Step | EntityKind::Command => {
                return Err(AppError::Factory(format!("{kind} {name} is not a session")));
            }
        };
        let ctor = table
            .get(name)
            .ok_or_else(|| AppError::Factory(format!("unknown {kind} {name}")))?;
        ctor(args)
    }
}
