//! Error types for command execution and configuration

use crate::event::EventType;
use crate::timer::TimerError;
use std::any::Any;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Error type user code and fallbacks return
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// A captured failure shared between the result record, the published event
/// and the caller
pub type SharedError = Arc<dyn Error + Send + Sync + 'static>;

/// Which isolator turned a command away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    Semaphore,
    ThreadPool,
}

impl RejectionKind {
    pub fn event_type(self) -> EventType {
        match self {
            RejectionKind::Semaphore => EventType::SemaphoreRejected,
            RejectionKind::ThreadPool => EventType::ThreadPoolRejected,
        }
    }
}

impl fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionKind::Semaphore => f.write_str("semaphore"),
            RejectionKind::ThreadPool => f.write_str("thread pool"),
        }
    }
}

/// Errors surfaced by a command
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    /// Circuit is open and no probe was admitted
    #[error("command '{command}' short-circuited: circuit is open")]
    ShortCircuited { command: String },

    /// The semaphore or thread pool is saturated
    #[error("command '{command}' rejected: {kind} is at capacity")]
    IsolationRejected { command: String, kind: RejectionKind },

    /// Execution exceeded its budget
    #[error("command '{command}' timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    /// User code returned an error or panicked
    #[error("command '{command}' failed: {source}")]
    ExecutionFailed {
        command: String,
        #[source]
        source: SharedError,
    },

    /// User code failed in a way the classifier excludes from health and
    /// fallback
    #[error("command '{command}' bad request: {source}")]
    BadRequest {
        command: String,
        #[source]
        source: SharedError,
    },

    /// The fallback itself failed
    #[error("command '{command}' fallback failed after {cause}: {source}")]
    FallbackFailed {
        command: String,
        cause: Box<CommandError>,
        #[source]
        source: SharedError,
    },

    /// The fallback semaphore is saturated
    #[error("command '{command}' fallback rejected after {cause}")]
    FallbackRejected {
        command: String,
        cause: Box<CommandError>,
    },

    /// The command was cancelled before it produced a result
    #[error("command '{command}' was cancelled")]
    Cancelled { command: String },

    /// The command instance was used more than once
    #[error("command '{command}' can only be executed once (state: {state})")]
    InvalidState { command: String, state: &'static str },

    /// Settings failed validation
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The dependency's threads could not be started
    #[error("command '{command}' unavailable: {message}")]
    Startup { command: String, message: String },
}

impl CommandError {
    /// Outcome tag matching this error, if it has one
    pub fn event_type(&self) -> Option<EventType> {
        match self {
            CommandError::ShortCircuited { .. } => Some(EventType::ShortCircuited),
            CommandError::IsolationRejected { kind, .. } => Some(kind.event_type()),
            CommandError::Timeout { .. } => Some(EventType::Timeout),
            CommandError::ExecutionFailed { .. } => Some(EventType::Failure),
            CommandError::BadRequest { .. } => Some(EventType::BadRequest),
            CommandError::FallbackFailed { .. } => Some(EventType::FallbackFailure),
            CommandError::FallbackRejected { .. } => Some(EventType::FallbackRejection),
            CommandError::Cancelled { .. } => Some(EventType::Cancelled),
            CommandError::InvalidState { .. }
            | CommandError::Config(_)
            | CommandError::Startup { .. } => None,
        }
    }

    /// Whether admission control turned the command away before user code ran
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            CommandError::ShortCircuited { .. } | CommandError::IsolationRejected { .. }
        )
    }

    /// The error that triggered fallback, for fallback errors; otherwise self
    pub fn root_cause(&self) -> &CommandError {
        match self {
            CommandError::FallbackFailed { cause, .. }
            | CommandError::FallbackRejected { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

/// Failure to assemble a dependency
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Timer(#[from] TimerError),

    #[error("failed to start threads for '{command}'")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl BuildError {
    /// Caller-facing form for a command that could not run
    pub fn into_command_error(self, command: &str) -> CommandError {
        match self {
            BuildError::Config(error) => CommandError::Config(error),
            other => CommandError::Startup {
                command: command.to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// A panic caught inside user code or a fallback
#[derive(Debug, Clone, Error)]
#[error("panicked: {message}")]
pub struct Panicked {
    pub message: String,
}

impl Panicked {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self { message }
    }
}

/// Invalid settings
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration for '{key}': {message}")]
    Invalid { key: String, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            message: message.into(),
        }
    }
}
