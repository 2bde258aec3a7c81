// workhive: the uniform port the pool scheduler talks through, and the two
// concrete transports it is backed by.
//
// Per spec §4.6, the scheduler only ever sees a uniform `send`/`terminate`
// surface; which concrete shape backs a given worker is decided once, at
// spawn time. The two shapes here both drive the *same* `Dispatcher::run`
// future (no duplicated protocol logic) -- they only differ in which
// executor hosts it:
//
// - [`spawn_async_worker`] runs the dispatcher as a `tokio` task on the
//   pool's own runtime: cheap, right for actions that cooperate with
//   `.await` (the in-process analogue of a same-process browser Worker).
// - [`spawn_blocking_worker`] runs the dispatcher on a dedicated OS thread
//   with its own single-threaded `tokio` runtime: right for actions that
//   block or want real OS-level parallelism outside the pool's runtime.
//
// Connection/lifecycle shape grounded on the teacher's `client.rs`/
// `server.rs` (a handle struct wrapping a channel plus the means to tear it
// down).

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::dispatcher::{ActionTree, Dispatcher};
use crate::error::PoolError;
use crate::protocol::Request;

/// Opaque identity for a worker record, distinct from [`crate::protocol::TaskId`]
/// -- the wire protocol never mentions which worker served a task, but the
/// scheduler needs to address one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

#[derive(Default)]
pub(crate) struct WorkerIdGenerator(std::sync::atomic::AtomicU64);

impl WorkerIdGenerator {
    pub fn new() -> Self {
        Self(std::sync::atomic::AtomicU64::new(1))
    }

    pub fn next(&self) -> WorkerId {
        WorkerId(self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

enum Termination {
    Async(tokio::task::JoinHandle<()>),
    /// Safe Rust has no way to forcibly kill an OS thread. Termination here
    /// means "abandoned by the pool": the request channel is dropped
    /// (ending the dispatcher's `run` loop once its current work drains)
    /// and the thread is detached rather than joined, so a stuck
    /// synchronous action cannot wedge the scheduler. Documented as an
    /// accepted asymmetry in DESIGN.md.
    Blocking(std::thread::JoinHandle<()>),
}

/// The uniform port the scheduler holds for a worker, regardless of which
/// transport backs it.
pub(crate) struct WorkerHandle {
    pub id: WorkerId,
    requests: mpsc::UnboundedSender<Request>,
    termination: Termination,
}

impl WorkerHandle {
    pub fn send(&self, request: Request) -> Result<(), PoolError> {
        self.requests
            .send(request)
            .map_err(|_| PoolError::Transport("worker channel closed".into()))
    }

    /// Terminates the worker. For the async transport this aborts the task
    /// at its next await point (a real preemptive stop); for the blocking
    /// transport it detaches the underlying thread (see [`Termination`]).
    pub fn terminate(self) {
        match self.termination {
            Termination::Async(join) => join.abort(),
            Termination::Blocking(join) => drop(join),
        }
    }
}

pub(crate) fn spawn_async_worker(
    id: WorkerId,
    actions: Arc<ActionTree>,
    replies: mpsc::UnboundedSender<crate::protocol::Reply>,
) -> WorkerHandle {
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let dispatcher = Dispatcher::new(&actions);
    let join = tokio::spawn(dispatcher.run(req_rx, replies));
    WorkerHandle {
        id,
        requests: req_tx,
        termination: Termination::Async(join),
    }
}

#[allow(clippy::expect_used)] // worker-thread bootstrap: nothing downstream can recover from a runtime/thread that failed to start
pub(crate) fn spawn_blocking_worker(
    id: WorkerId,
    actions: Arc<ActionTree>,
    replies: mpsc::UnboundedSender<crate::protocol::Reply>,
) -> WorkerHandle {
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let join = std::thread::Builder::new()
        .name(id.to_string())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .expect("failed to build worker runtime");
            let dispatcher = Dispatcher::new(&actions);
            runtime.block_on(dispatcher.run(req_rx, replies));
        })
        .expect("failed to spawn worker thread");
    WorkerHandle {
        id,
        requests: req_tx,
        termination: Termination::Blocking(join),
    }
}
