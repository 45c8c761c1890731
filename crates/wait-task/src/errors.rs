//! Error types for wait tasks and their execution-context collaborators.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure categories signalled by the execution-context provider.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextErrorKind {
    /// The context was torn down and a replacement is expected (navigation).
    #[error("execution context destroyed")]
    Destroyed,
    /// The context reference no longer resolves to a live context.
    #[error("execution context not found")]
    NotFound,
    /// The owning frame is gone for good.
    #[error("frame detached")]
    Detached,
    /// The remote side raised while evaluating.
    #[error("evaluation failed")]
    Evaluation,
    /// A poller was stopped before it produced a value.
    #[error("polling stopped")]
    Stopped,
    #[error("protocol error")]
    Protocol,
}

/// Error reported by [`crate::context::ExecutionContext`] implementations.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ContextError {
    pub kind: ContextErrorKind,
    pub message: String,
}

impl ContextError {
    pub fn new(kind: ContextErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn destroyed(message: impl Into<String>) -> Self {
        Self::new(ContextErrorKind::Destroyed, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ContextErrorKind::NotFound, message)
    }

    pub fn detached(message: impl Into<String>) -> Self {
        Self::new(ContextErrorKind::Detached, message)
    }

    pub fn evaluation(message: impl Into<String>) -> Self {
        Self::new(ContextErrorKind::Evaluation, message)
    }

    pub fn stopped() -> Self {
        Self::new(ContextErrorKind::Stopped, "poller stopped before a result was produced")
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ContextErrorKind::Protocol, message)
    }

    /// Whether a fresh context is expected to replace the one that failed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind,
            ContextErrorKind::Destroyed | ContextErrorKind::NotFound
        )
    }
}

/// Errors surfaced to the caller of a wait.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("waiting failed: {0}ms exceeded")]
    Timeout(u64),

    #[error("waiting failed: frame got detached")]
    FrameDetached,

    #[error("evaluation failed: {0}")]
    Evaluation(String),

    #[error("waiting failed: poller stopped")]
    PollerStopped,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid wait options: {0}")]
    InvalidOptions(String),

    #[error("wait task terminated: {0}")]
    Terminated(String),
}

impl WaitError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, WaitError::Timeout(_))
    }
}

/// Outcome of classifying a failed run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Failure {
    /// Swallowed; the task waits for a re-run against a fresh context.
    Recoverable,
    /// Terminates the task with the wrapped error.
    Fatal(WaitError),
}

/// Maps a collaborator failure onto the task's recovery policy.
pub fn classify(err: ContextError) -> Failure {
    match err.kind {
        ContextErrorKind::Destroyed | ContextErrorKind::NotFound => Failure::Recoverable,
        ContextErrorKind::Detached => Failure::Fatal(WaitError::FrameDetached),
        ContextErrorKind::Evaluation => Failure::Fatal(WaitError::Evaluation(err.message)),
        ContextErrorKind::Stopped => Failure::Fatal(WaitError::PollerStopped),
        ContextErrorKind::Protocol => Failure::Fatal(WaitError::Protocol(err.message)),
    }
}
