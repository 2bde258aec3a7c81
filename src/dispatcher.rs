// workhive: the worker-side runtime. Flattens a nested action tree into a
// path table, resolves inbound requests against it, and gives each
// invocation a context exposing dispatch/retain/release.
//
// Grounded on the per-request handling shape of the teacher's
// `service.rs` (`KgcSidecarService` methods taking a request, doing work,
// producing a typed response), generalized from fixed gRPC methods to an
// open, user-supplied path table.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::protocol::{FrameError, Reply, Request, TaskId};
use crate::value::Value;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An application-level failure returned by an action or a cleanup hook:
/// a message plus an optional stack trace (spec §4.3: "a descriptive
/// message and optional stack").
#[derive(Debug, Clone)]
pub struct ActionFailure {
    pub message: String,
    pub stack: Option<String>,
}

impl ActionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }
}

impl<E: std::error::Error> From<E> for ActionFailure {
    fn from(err: E) -> Self {
        ActionFailure::new(err.to_string())
    }
}

pub type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<Value, ActionFailure>> + Send>;

/// Wraps a plain async closure into the boxed-future shape
/// [`ActionContext::retain`] expects, so callers don't have to spell out
/// `Box::pin`/`BoxFuture` themselves.
pub fn boxed_cleanup<F, Fut>(f: F) -> CleanupFn
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Value, ActionFailure>> + Send + 'static,
{
    Box::new(move || -> BoxFuture<'static, Result<Value, ActionFailure>> { Box::pin(f()) })
}

/// A callable registered on the worker side, addressable by a dotted path.
///
/// Modeled as a future-returning callable (spec §9 "Coroutines": "model an
/// action as a callable returning a future") so synchronous and
/// asynchronous user code both fit through one trait.
pub trait Action: Send + Sync {
    fn call(&self, ctx: ActionContext, args: Vec<Value>) -> BoxFuture<'static, Result<Value, ActionFailure>>;
}

impl<F, Fut> Action for F
where
    F: Fn(ActionContext, Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ActionFailure>> + Send + 'static,
{
    fn call(&self, ctx: ActionContext, args: Vec<Value>) -> BoxFuture<'static, Result<Value, ActionFailure>> {
        Box::pin(self(ctx, args))
    }
}

/// A nested map of named actions, registered on the worker side.
///
/// Only `Leaf`/`Branch` shapes exist by construction (Rust's type system
/// already rules out the "non-function/non-mapping value" case the
/// dynamic-language spec has to guard against at runtime), so flattening
/// only has to decide path joining and collision order.
pub enum ActionTree {
    Leaf(Arc<dyn Action>),
    Branch(BTreeMap<String, ActionTree>),
}

impl ActionTree {
    pub fn leaf<A>(action: A) -> Self
    where
        A: Action + 'static,
    {
        ActionTree::Leaf(Arc::new(action))
    }

    pub fn branch<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, ActionTree)>,
    {
        ActionTree::Branch(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    /// Flattens the tree into a `dotted.path -> action` table. Collisions
    /// (only reachable by hand-assembling overlapping trees) are
    /// last-write-wins, matching spec §4.3.
    pub(crate) fn flatten(&self) -> HashMap<String, Arc<dyn Action>> {
        let mut out = HashMap::new();
        self.flatten_into(String::new(), &mut out);
        out
    }

    fn flatten_into(&self, prefix: String, out: &mut HashMap<String, Arc<dyn Action>>) {
        match self {
            ActionTree::Leaf(action) => {
                out.insert(prefix, action.clone());
            }
            ActionTree::Branch(children) => {
                for (name, child) in children {
                    let path = if prefix.is_empty() {
                        name.clone()
                    } else {
                        format!("{prefix}.{name}")
                    };
                    child.flatten_into(path, out);
                }
            }
        }
    }
}

/// Per-invocation context passed to an action as its implicit receiver
/// (spec §9: "pass it explicitly as an extra parameter" in languages
/// without implicit receivers).
pub struct ActionContext {
    uuid: TaskId,
    replies: mpsc::UnboundedSender<Reply>,
    cleanups: Arc<Mutex<HashMap<TaskId, CleanupFn>>>,
    retained: Arc<AtomicBool>,
    finalized: Arc<AtomicBool>,
}

impl ActionContext {
    fn new(
        uuid: TaskId,
        replies: mpsc::UnboundedSender<Reply>,
        cleanups: Arc<Mutex<HashMap<TaskId, CleanupFn>>>,
    ) -> Self {
        Self {
            uuid,
            replies,
            cleanups,
            retained: Arc::new(AtomicBool::new(false)),
            finalized: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sends `{uuid, event, data}` to the pool side.
    pub fn dispatch(&self, event: impl Into<String>, data: Value) {
        let _ = self.replies.send(Reply::Event {
            uuid: self.uuid,
            event: event.into(),
            data,
        });
    }

    /// Marks the invocation long-lived and immediately acks with
    /// `{uuid, retained: true}` -- the pool side needs to learn this as
    /// soon as the action's initial synchronous phase is done, not only
    /// once its future eventually resolves (which, for a genuinely
    /// long-lived action, may be never until an external release). The
    /// action's own eventual return value is ignored; settlement instead
    /// comes from a later [`ActionContext::release`] call or from the pool
    /// asking this worker to release (handled by invoking `cleanup`).
    #[allow(clippy::unwrap_used)] // mutex poisoning means a prior panic already corrupted this table
    pub fn retain(&self, cleanup: Option<CleanupFn>) {
        let already_retained = self.retained.swap(true, Ordering::SeqCst);
        if let Some(cleanup) = cleanup {
            self.cleanups.lock().unwrap().insert(self.uuid, cleanup);
        }
        if !already_retained {
            let _ = self.replies.send(Reply::Retained { uuid: self.uuid });
        }
    }

    /// Early-completion path for a retained task: settles immediately with
    /// `result`, discarding any cleanup and any value the action's own
    /// future eventually produces.
    #[allow(clippy::unwrap_used)] // mutex poisoning means a prior panic already corrupted this table
    pub fn release(&self, result: Value) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cleanups.lock().unwrap().remove(&self.uuid);
        let _ = self.replies.send(Reply::Success {
            uuid: self.uuid,
            result,
        });
    }
}

/// Owns the flattened action table and the registry of pending retained
/// cleanups, and drives the per-request protocol in spec §4.3.
pub struct Dispatcher {
    actions: Arc<HashMap<String, Arc<dyn Action>>>,
    cleanups: Arc<Mutex<HashMap<TaskId, CleanupFn>>>,
}

impl Dispatcher {
    pub fn new(tree: &ActionTree) -> Self {
        Self {
            actions: Arc::new(tree.flatten()),
            cleanups: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Serves inbound requests until the request channel closes. One
    /// invocation runs at a time from the caller's point of view (the pool
    /// never dispatches a second task to a worker still bound to one), but
    /// each invocation is spawned independently so a `Release` frame for a
    /// retained task can still be served while its action keeps running.
    pub async fn run(self, mut requests: mpsc::UnboundedReceiver<Request>, replies: mpsc::UnboundedSender<Reply>) {
        while let Some(request) = requests.recv().await {
            match request {
                Request::Invoke { uuid, path, args } => {
                    self.spawn_invocation(uuid, path, args, replies.clone());
                }
                Request::Release { uuid } => {
                    self.spawn_release(uuid, replies.clone());
                }
            }
        }
    }

    fn spawn_invocation(&self, uuid: TaskId, path: String, args: Vec<Value>, replies: mpsc::UnboundedSender<Reply>) {
        let Some(action) = self.actions.get(&path).cloned() else {
            let _ = replies.send(Reply::Failure {
                uuid,
                error: FrameError::new(format!("path does not exist '{path}'")),
            });
            return;
        };
        let ctx = ActionContext::new(uuid, replies.clone(), self.cleanups.clone());
        let retained = ctx.retained.clone();
        let finalized = ctx.finalized.clone();
        let panic_replies = replies.clone();

        let invocation = tokio::spawn(async move {
            let outcome = action.call(ctx, args).await;
            if finalized.load(Ordering::SeqCst) {
                // Already settled via ActionContext::release, or a
                // concurrent pool-issued release already finalized it.
                return;
            }
            match outcome {
                Ok(value) => {
                    if retained.load(Ordering::SeqCst) {
                        // The retained ack already went out from
                        // `ActionContext::retain`; the action's own return
                        // value is discarded per the retain contract.
                    } else {
                        let _ = replies.send(Reply::Success { uuid, result: value });
                    }
                }
                Err(failure) => {
                    let _ = replies.send(Reply::Failure {
                        uuid,
                        error: FrameError {
                            message: failure.message,
                            stack: failure.stack,
                        },
                    });
                }
            }
        });

        // A panicking action never reaches the reply paths above; report it
        // under the protocol's "transport reports no message" fallback so
        // the pool side can tell an application failure from a dead worker.
        tokio::spawn(async move {
            if let Err(join_err) = invocation.await {
                if join_err.is_panic() {
                    let _ = panic_replies.send(Reply::Failure {
                        uuid,
                        error: FrameError::new("worker error"),
                    });
                }
            }
        });
    }

    #[allow(clippy::unwrap_used)] // mutex poisoning means a prior panic already corrupted this table
    fn spawn_release(&self, uuid: TaskId, replies: mpsc::UnboundedSender<Reply>) {
        let cleanup = self.cleanups.lock().unwrap().remove(&uuid);
        tokio::spawn(async move {
            match cleanup {
                Some(cleanup) => match cleanup().await {
                    Ok(value) => {
                        let _ = replies.send(Reply::Success { uuid, result: value });
                    }
                    Err(failure) => {
                        let _ = replies.send(Reply::Failure {
                            uuid,
                            error: FrameError {
                                message: failure.message,
                                stack: failure.stack,
                            },
                        });
                    }
                },
                None => {
                    let _ = replies.send(Reply::Success { uuid, result: Value::Null });
                }
            }
        });
    }
}
