//! Error taxonomy for the lifecycle orchestrator.
//!
//! The supervisor (`retry`) is the single place that decides retry vs.
//! fatal exit, based on the error kind. Everything below it surfaces errors
//! upward unmodified.

use std::time::Duration;

use thiserror::Error;

use crate::cloud::CloudApiError;

pub type Result<T, E = LifecycleError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum LifecycleError {
    /// A cloud or cluster API interaction failed for reasons expected to
    /// self-resolve (eventual consistency, rate limits, half-deleted
    /// dependencies). Retried at the attempt level.
    #[error("transient infrastructure error: {0}")]
    TransientInfra(String),

    /// One attempt exceeded its deadline. Retryable at the attempt level
    /// unless attempts are exhausted.
    #[error("attempt timed out after {} s", .0.as_secs())]
    AttemptTimeout(Duration),

    /// Deliberate "stop now" signal carrying an explicit process exit code.
    /// Never retried; propagated through all layers.
    #[error("{message}")]
    FatalExit { code: i32, message: String },

    /// Missing prerequisite (config field, token, credentials). Raised
    /// before any mutating work begins; never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("cloud api error: {0}")]
    CloudApi(#[from] CloudApiError),
}

impl LifecycleError {
    pub fn fatal(code: i32, message: impl Into<String>) -> Self {
        Self::FatalExit {
            code,
            message: message.into(),
        }
    }

    /// Errors that must never consume a retry.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::FatalExit { .. } | Self::Configuration(_)
        )
    }

    /// Expected errors whose detail is not worth an error-level log line
    /// inside the retry loop (the timeout already logged a warning).
    #[must_use]
    pub fn log_without_detail(&self) -> bool {
        matches!(self, Self::AttemptTimeout(_))
    }

    /// Process exit code to report when this error terminates the run.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::FatalExit { code, .. } => *code,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_kinds_are_not_retryable() {
        assert!(LifecycleError::fatal(3, "operator exit").is_fatal());
        assert!(LifecycleError::Configuration("no region".into()).is_fatal());
        assert!(!LifecycleError::TransientInfra("still in use".into()).is_fatal());
        assert!(!LifecycleError::AttemptTimeout(Duration::from_secs(1)).is_fatal());
    }

    #[test]
    fn exit_code_defaults_to_one() {
        assert_eq!(LifecycleError::fatal(3, "x").exit_code(), 3);
        assert_eq!(
            LifecycleError::TransientInfra("x".into()).exit_code(),
            1
        );
    }
}
