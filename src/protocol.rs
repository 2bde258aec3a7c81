// workhive: frames exchanged between the pool side and a worker, and the
// correlation identifier that ties a reply back to a task.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::value::Value;

/// Correlation id, unique within a pool's lifetime.
///
/// A monotonic counter rather than a random token: the spec only requires
/// "equality and hashability... uniqueness only within a pool's lifetime",
/// and a counter is cheaper and gives correlation ids a natural order that
/// is convenient in traces and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Process-wide generator of [`TaskId`]s, one per [`crate::pool::Pool`] in
/// practice but kept global for simplicity (ids only need to be unique
/// within a single pool's lifetime, and a global counter trivially satisfies
/// that).
#[derive(Default)]
pub struct TaskIdGenerator(AtomicU64);

impl TaskIdGenerator {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> TaskId {
        TaskId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// A worker-reported failure: a message plus an optional stack trace,
/// matching spec §6's `{message, stack} | string` shape.
#[derive(Debug, Clone)]
pub struct FrameError {
    pub message: String,
    pub stack: Option<String>,
}

impl FrameError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: Some(stack.into()),
        }
    }
}

/// Pool -> Worker frames.
#[derive(Debug, Clone)]
pub enum Request {
    /// `{uuid, path, args}` -- invoke an action.
    Invoke {
        uuid: TaskId,
        path: String,
        args: Vec<Value>,
    },
    /// `{uuid, release: true}` -- ask a retained task to end.
    Release { uuid: TaskId },
}

impl Request {
    pub fn uuid(&self) -> TaskId {
        match self {
            Request::Invoke { uuid, .. } => *uuid,
            Request::Release { uuid } => *uuid,
        }
    }
}

/// Worker -> Pool frames.
#[derive(Debug, Clone)]
pub enum Reply {
    /// `{uuid, retained: true}`
    Retained { uuid: TaskId },
    /// `{uuid, event, data}`
    Event {
        uuid: TaskId,
        event: String,
        data: Value,
    },
    /// `{uuid, result}`
    Success { uuid: TaskId, result: Value },
    /// `{uuid, error}`
    Failure { uuid: TaskId, error: FrameError },
}

impl Reply {
    pub fn uuid(&self) -> TaskId {
        match self {
            Reply::Retained { uuid } => *uuid,
            Reply::Event { uuid, .. } => *uuid,
            Reply::Success { uuid, .. } => *uuid,
            Reply::Failure { uuid, .. } => *uuid,
        }
    }
}
