//! Engine configuration.
//!
//! Configuration is resolved in the following order (later overrides earlier):
//! 1. Default values
//! 2. Whatever the embedding application deserializes (the type is `serde`-ready)
//! 3. Environment variables, via [`MachineConfig::from_env`] or
//!    [`MachineConfig::apply_env_overrides`]

use serde::{Deserialize, Serialize};

/// Default ceiling for run-to-completion passes at a single nesting level.
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

/// What the engine does when a user hook fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Report through the error sink, treat the hook as a no-op and continue.
    #[default]
    ReportAndContinue,
    /// Abort the current dispatch with [`crate::Error::Hook`].
    Strict,
}

impl ErrorPolicy {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "report" | "report_and_continue" | "continue" => Some(ErrorPolicy::ReportAndContinue),
            "strict" => Some(ErrorPolicy::Strict),
            _ => None,
        }
    }
}

/// Runtime configuration of a state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Maximum completion passes per nesting level within one dispatch.
    pub max_iterations: usize,
    /// Hook failure policy.
    pub error_policy: ErrorPolicy,
    /// Emit transition and entry/exit traces through `tracing`.
    pub trace: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            error_policy: ErrorPolicy::default(),
            trace: false,
        }
    }
}

impl MachineConfig {
    /// Defaults with environment variable overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies `STATECHART_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("STATECHART_MAX_ITERATIONS") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => self.max_iterations = n,
                _ => tracing::warn!("Ignoring invalid STATECHART_MAX_ITERATIONS={}", val),
            }
        }
        if let Ok(val) = std::env::var("STATECHART_ERROR_POLICY") {
            match ErrorPolicy::parse(&val) {
                Some(policy) => self.error_policy = policy,
                None => tracing::warn!("Ignoring invalid STATECHART_ERROR_POLICY={}", val),
            }
        }
        if let Ok(val) = std::env::var("STATECHART_TRACE") {
            self.trace = matches!(val.trim(), "1" | "true" | "yes" | "on");
        }
    }

    /// Sets the run-to-completion ceiling.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Sets the hook failure policy.
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Enables or disables tracing output.
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }
}
