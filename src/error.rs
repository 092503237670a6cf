//! Error types for the state machine

use std::fmt::{self, Debug};
use thiserror::Error;

/// Result type alias for state machine operations
pub type Result<T, S> = std::result::Result<T, Error<S>>;

/// Errors that can occur while building or running a state machine
#[derive(Error, Debug)]
pub enum Error<S: Debug> {
    /// The topology is malformed; detected by `build()` or `start()`
    #[error("Configuration error: {reason}")]
    Configuration {
        /// What is wrong with the topology
        reason: String,
    },

    /// A user hook failed while the machine runs with the strict policy
    #[error("{phase} hook of state {state:?} failed: {source}")]
    Hook {
        /// State owning the hook (the declaring state for guards and actions)
        state: S,
        /// Which hook failed
        phase: HookPhase,
        /// The failure reported by the hook
        source: HookError,
    },

    /// Completion transitions kept firing past the configured ceiling
    #[error("Run-to-completion loop in state {state:?} exceeded {iterations} iterations")]
    LoopGuard {
        /// Level at which the loop was running
        state: S,
        /// Number of completion passes performed
        iterations: usize,
    },

    /// The active configuration broke a structural invariant; reported by
    /// `check_configuration`
    #[error("Inconsistent configuration: {reason}")]
    Inconsistent {
        /// First violation found, naming the offending state
        reason: String,
    },

    /// `dispatch` was called before `start`
    #[error("State machine not started")]
    NotStarted,

    /// `start` was called twice without `stop` in between
    #[error("State machine already started")]
    AlreadyStarted,

    /// A previous dispatch never returned; the configuration can't be trusted
    #[error("Dispatch already in progress")]
    DispatchInProgress,
}

impl<S: Debug> Error<S> {
    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Error::Configuration {
            reason: reason.into(),
        }
    }

    pub(crate) fn inconsistent(reason: impl Into<String>) -> Self {
        Error::Inconsistent {
            reason: reason.into(),
        }
    }

    /// Returns whether the machine can keep processing events after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Hook { .. } | Error::LoopGuard { .. })
    }
}

/// Failure reported by a guard, action, entry or exit hook
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    /// The hook returned an error
    #[error("{0}")]
    Failed(String),

    /// The hook panicked; the payload message is kept when it is a string
    #[error("panicked: {0}")]
    Panicked(String),
}

impl HookError {
    /// Create a failure with the given message
    pub fn new(message: impl Into<String>) -> Self {
        HookError::Failed(message.into())
    }
}

impl From<&str> for HookError {
    fn from(message: &str) -> Self {
        HookError::Failed(message.to_string())
    }
}

impl From<String> for HookError {
    fn from(message: String) -> Self {
        HookError::Failed(message)
    }
}

/// The kind of user hook being invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    /// Transition guard
    Guard,
    /// Transition action
    Action,
    /// State entry hook
    Entry,
    /// State exit hook
    Exit,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HookPhase::Guard => "guard",
            HookPhase::Action => "action",
            HookPhase::Entry => "entry",
            HookPhase::Exit => "exit",
        };
        f.write_str(name)
    }
}
