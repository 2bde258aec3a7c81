// workhive: pool-wide error type and the stable, user-visible messages.

use thiserror::Error;

/// Result alias used throughout the crate's internal plumbing.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can settle a [`crate::task::TaskHandle`] or be returned from
/// pool administration calls.
///
/// The `Display` strings are part of the public contract: callers may match
/// on message text across process boundaries, so wording here must not
/// drift without a deliberate version bump.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("task aborted")]
    Aborted,

    #[error("task timed out after {0}ms")]
    TimedOut(u64),

    #[error("pool closing")]
    Closing,

    #[error("path does not exist '{0}'")]
    NoSuchPath(String),

    #[error("worker error")]
    WorkerError,

    #[error("{0}")]
    Application(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("task queue is full")]
    QueueFull,
}

impl PoolError {
    /// Builds an [`PoolError::Application`] failure from a worker-reported
    /// message and optional stack trace.
    pub fn application(message: impl Into<String>, stack: Option<&str>) -> Self {
        let message = message.into();
        match stack {
            Some(stack) if !stack.is_empty() => {
                PoolError::Application(format!("{message}\n{stack}"))
            }
            _ => PoolError::Application(message),
        }
    }
}

/// Whether a failure means the worker that produced it must be discarded
/// rather than returned to the available list.
///
/// Mirrors the teacher's `is_retryable_error`/`is_guard_violation` split:
/// some failures are about the *task*, others tell you the *worker* is no
/// longer trustworthy.
pub fn is_worker_fault(err: &PoolError) -> bool {
    matches!(err, PoolError::Transport(_) | PoolError::WorkerError)
}
