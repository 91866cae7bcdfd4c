//! Error types for the webtestflow orchestrator.
//!
//! The taxonomy separates configuration errors (always fatal to the run),
//! resource errors (fatal or tolerated depending on the caller) and
//! readiness timeouts (always fatal) from best-effort cleanup failures,
//! which callers log and swallow.

use std::sync::Arc;
use thiserror::Error;

use crate::context::RunContext;

/// The main error type for webtestflow operations.
#[derive(Debug, Error)]
pub enum WebtestflowError {
    /// No bindable TCP port was found before running past the valid range.
    #[error("no available port found (searched upward from {start_port})")]
    NoAvailablePort {
        /// The first candidate that was probed.
        start_port: u16,
    },

    /// A kill request (by search pattern, pid list or port) failed.
    ///
    /// Callers performing cleanup treat this as non-fatal: log and continue.
    #[error("failed to kill {target}: {reason}")]
    KillFailed {
        /// What was being killed (pattern, pid list or port).
        target: String,
        /// Why the kill command failed.
        reason: String,
    },

    /// An external command exited with a non-zero status.
    #[error("command `{command}` exited with status {status:?}")]
    CommandFailed {
        /// The shell command that was run.
        command: String,
        /// The exit code, if the process was not killed by a signal.
        status: Option<i32>,
    },

    /// An external command could not be spawned at all.
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        /// The shell command that was attempted.
        command: String,
        /// The underlying OS error.
        source: std::io::Error,
    },

    /// A polled URL never became reachable within the retry budget.
    #[error("readiness check timed out for {url} after {attempts} attempts")]
    ReadinessTimeout {
        /// The URL that was polled.
        url: String,
        /// How many attempts were made.
        attempts: u32,
    },

    /// Invalid or incomplete stage configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A stage's setup or run phase failed.
    #[error("stage '{stage}' failed: {message}")]
    Stage {
        /// The stage name.
        stage: String,
        /// What went wrong.
        message: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl WebtestflowError {
    /// Wraps an error as a stage failure, preserving the original message.
    #[must_use]
    pub fn stage(stage: impl Into<String>, source: &Self) -> Self {
        Self::Stage {
            stage: stage.into(),
            message: source.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for WebtestflowError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for WebtestflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, WebtestflowError>;

/// The terminal error of a pipeline execution.
///
/// Carries the partially-populated run context so callers can inspect
/// exported parameters and stage state for diagnostics even after a fatal
/// abort.
#[derive(Debug, Error)]
#[error("pipeline aborted: {source}")]
pub struct PipelineFailure {
    /// The failure that aborted the run.
    pub source: WebtestflowError,
    /// The run context as it stood when the failure occurred.
    pub context: Option<Arc<RunContext>>,
}

impl PipelineFailure {
    /// Creates a failure with an attached run context.
    #[must_use]
    pub fn with_context(source: WebtestflowError, context: Arc<RunContext>) -> Self {
        Self {
            source,
            context: Some(context),
        }
    }

    /// Creates a failure that occurred before a context existed.
    #[must_use]
    pub fn bare(source: WebtestflowError) -> Self {
        Self {
            source,
            context: None,
        }
    }
}
