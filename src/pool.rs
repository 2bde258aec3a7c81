// workhive: the scheduler actor. Owns every piece of mutable pool state --
// workers, the available list, the pending/active task map, the overflow
// queue -- behind a single `tokio` task reachable only through a command
// channel, so no field here is ever read or written from two places at
// once.
//
// The single-actor-behind-a-channel shape is grounded on the teacher's
// `KgcSidecarService`, which centralizes its metrics/state behind methods
// called from one place; here that's pushed further, to a dedicated task,
// because the spec's concurrency model forbids locks on this path
// entirely.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{PoolOptions, TaskOptions};
use crate::dispatcher::ActionTree;
use crate::error::{is_worker_fault, PoolError};
use crate::protocol::{FrameError, Reply, Request, TaskId, TaskIdGenerator};
use crate::task::{TaskHandle, TaskSettler};
use crate::transport::{self, WorkerHandle, WorkerId, WorkerIdGenerator};
use crate::value::{scan_transferables_in_args, Value};

/// Point-in-time snapshot of pool occupancy, per the main-side surface's
/// `stats()` shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub busy: usize,
    pub idle: usize,
    pub queued: usize,
    pub completed: u64,
}

enum WorkerKind {
    Async,
    Blocking,
}

/// A handle to a running pool. Cheap to clone; every clone talks to the
/// same scheduler actor.
#[derive(Clone)]
pub struct Pool {
    cmd_tx: mpsc::UnboundedSender<Command>,
    ids: Arc<TaskIdGenerator>,
}

enum Command {
    Schedule {
        uuid: TaskId,
        path: String,
        args: Vec<Value>,
        options: TaskOptions,
        settler: TaskSettler,
    },
    ReleaseRetained {
        uuid: TaskId,
    },
    Abort {
        uuid: TaskId,
    },
    Timeout {
        uuid: TaskId,
        ms: u64,
    },
    IdleExpired {
        worker: WorkerId,
    },
    Stats {
        respond: oneshot::Sender<PoolStats>,
    },
    Shutdown {
        respond: oneshot::Sender<()>,
        drain_timeout: Option<Duration>,
    },
    ForceShutdown,
}

impl Pool {
    /// Starts a pool whose workers run actions as `tokio` tasks
    /// communicating over in-process channels.
    pub fn spawn(actions: ActionTree, options: PoolOptions) -> Self {
        Self::start(actions, options, WorkerKind::Async)
    }

    /// Starts a pool whose workers each run on a dedicated OS thread with
    /// its own single-threaded runtime -- for actions that block or want
    /// real OS-level parallelism outside the pool's own runtime.
    pub fn spawn_blocking(actions: ActionTree, options: PoolOptions) -> Self {
        Self::start(actions, options, WorkerKind::Blocking)
    }

    fn start(actions: ActionTree, options: PoolOptions, kind: WorkerKind) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let actor = Actor::new(actions, options, kind, cmd_tx.clone(), cmd_rx);
        tokio::spawn(actor.run());
        Pool {
            cmd_tx,
            ids: Arc::new(TaskIdGenerator::new()),
        }
    }

    /// Submits an invocation by dotted path. Returns a [`TaskHandle`]
    /// immediately; it settles once the pool correlates a reply.
    pub fn schedule(&self, path: impl Into<String>, args: Vec<Value>, options: TaskOptions) -> TaskHandle {
        let uuid = self.ids.next();
        let (handle, settler) = TaskSettler::pair(uuid);

        if let Some(signal) = &options.signal {
            if signal.is_cancelled() {
                settler.settle(Err(PoolError::Aborted));
                return handle;
            }
        }

        if let Some(signal) = options.signal.clone() {
            let cmd_tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                signal.cancelled().await;
                let _ = cmd_tx.send(Command::Abort { uuid });
            });
        }

        let cmd = Command::Schedule {
            uuid,
            path: path.into(),
            args,
            options,
            settler,
        };
        if let Err(err) = self.cmd_tx.send(cmd) {
            if let Command::Schedule { settler, .. } = err.0 {
                settler.settle(Err(PoolError::Closing));
            }
        }
        handle
    }

    /// Wraps this pool in the dotted-path facade described in spec §4.1.
    pub fn facade(&self) -> crate::proxy::PoolHandle {
        crate::proxy::PoolHandle::new(self.clone())
    }

    pub async fn stats(&self) -> PoolStats {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stats { respond: tx }).is_err() {
            return PoolStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Unbounded graceful shutdown: queued tasks fail fast, retained tasks
    /// are released and allowed to complete, and this resolves once every
    /// worker has settled and been torn down.
    pub async fn shutdown(&self) {
        self.shutdown_with(None).await
    }

    /// Graceful shutdown bounded by `timeout`: past the deadline, any
    /// still-executing or still-retained task is force-failed with
    /// `pool closing` and its worker torn down, so a host is never hostage
    /// to a task that never settles.
    pub async fn shutdown_with_drain_timeout(&self, timeout: Duration) {
        self.shutdown_with(Some(timeout)).await
    }

    async fn shutdown_with(&self, drain_timeout: Option<Duration>) {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Shutdown {
                respond: tx,
                drain_timeout,
            })
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }
}

struct ActiveTask {
    settler: TaskSettler,
    worker: WorkerId,
    retained: bool,
    timeout_task: Option<tokio::task::JoinHandle<()>>,
}

struct QueuedTask {
    uuid: TaskId,
    path: String,
    args: Vec<Value>,
    options: TaskOptions,
    settler: TaskSettler,
}

struct Actor {
    limit: usize,
    idle_timeout: Duration,
    queue_capacity: usize,

    spawn_worker: Box<dyn Fn(WorkerId, mpsc::UnboundedSender<Reply>) -> WorkerHandle + Send>,
    worker_ids: WorkerIdGenerator,

    workers: HashMap<WorkerId, WorkerHandle>,
    available: Vec<WorkerId>,
    idle_timers: HashMap<WorkerId, tokio::task::JoinHandle<()>>,
    pending_worker: HashSet<WorkerId>,

    active: HashMap<TaskId, ActiveTask>,
    queue: VecDeque<QueuedTask>,
    completed: u64,

    shutting_down: bool,
    shutdown_respond: Option<oneshot::Sender<()>>,

    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    reply_tx: mpsc::UnboundedSender<Reply>,
    reply_rx: mpsc::UnboundedReceiver<Reply>,
}

impl Actor {
    fn new(
        actions: ActionTree,
        options: PoolOptions,
        kind: WorkerKind,
        cmd_tx: mpsc::UnboundedSender<Command>,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let actions = Arc::new(actions);
        let spawn_worker: Box<dyn Fn(WorkerId, mpsc::UnboundedSender<Reply>) -> WorkerHandle + Send> = match kind {
            WorkerKind::Async => {
                let actions = actions.clone();
                Box::new(move |id, replies| transport::spawn_async_worker(id, actions.clone(), replies))
            }
            WorkerKind::Blocking => {
                let actions = actions.clone();
                Box::new(move |id, replies| transport::spawn_blocking_worker(id, actions.clone(), replies))
            }
        };
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();

        let mut actor = Self {
            limit: options.normalized_limit(),
            idle_timeout: options.idle_timeout(),
            queue_capacity: options.queue_capacity,
            spawn_worker,
            worker_ids: WorkerIdGenerator::new(),
            workers: HashMap::new(),
            available: Vec::new(),
            idle_timers: HashMap::new(),
            pending_worker: HashSet::new(),
            active: HashMap::new(),
            queue: VecDeque::new(),
            completed: 0,
            shutting_down: false,
            shutdown_respond: None,
            cmd_tx,
            cmd_rx,
            reply_tx,
            reply_rx,
        };

        if options.should_prewarm() {
            for _ in 0..actor.limit {
                let id = actor.create_worker();
                actor.available.push(id);
            }
        }

        actor
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => break,
                    }
                }
                reply = self.reply_rx.recv() => {
                    match reply {
                        Some(reply) => self.handle_reply(reply),
                        None => {}
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Schedule {
                uuid,
                path,
                args,
                options,
                settler,
            } => self.handle_schedule(uuid, path, args, options, settler),
            Command::ReleaseRetained { uuid } => self.handle_release_retained(uuid),
            Command::Abort { uuid } => self.handle_abort(uuid),
            Command::Timeout { uuid, ms } => self.handle_timeout(uuid, ms),
            Command::IdleExpired { worker } => self.handle_idle_expired(worker),
            Command::Stats { respond } => self.handle_stats(respond),
            Command::Shutdown { respond, drain_timeout } => self.handle_shutdown(respond, drain_timeout),
            Command::ForceShutdown => self.handle_force_shutdown(),
        }
    }

    // ---- admission / dispatch ----

    fn handle_schedule(&mut self, uuid: TaskId, path: String, args: Vec<Value>, options: TaskOptions, settler: TaskSettler) {
        if self.shutting_down {
            settler.settle(Err(PoolError::Closing));
            return;
        }
        debug!(task = %uuid, path = %path, "admitting task");
        self.dispatch(uuid, path, args, options, settler);
    }

    fn dispatch(&mut self, uuid: TaskId, path: String, args: Vec<Value>, options: TaskOptions, settler: TaskSettler) {
        if let Some(worker_id) = self.pop_available() {
            self.send_to_worker(worker_id, uuid, path, args, options, settler);
        } else if self.workers.len() < self.limit {
            let worker_id = self.create_worker();
            self.send_to_worker(worker_id, uuid, path, args, options, settler);
        } else if self.queue.len() < self.queue_capacity {
            self.queue.push_back(QueuedTask {
                uuid,
                path,
                args,
                options,
                settler,
            });
        } else {
            warn!(task = %uuid, "queue full, rejecting admission");
            settler.settle(Err(PoolError::QueueFull));
        }
    }

    fn send_to_worker(&mut self, worker_id: WorkerId, uuid: TaskId, path: String, args: Vec<Value>, options: TaskOptions, settler: TaskSettler) {
        let transferables = scan_transferables_in_args(&args).len();
        if transferables > 0 {
            debug!(task = %uuid, transferables, "dispatching task with transferable arguments");
        }
        let timeout_task = options.timeout.map(|d| self.arm_timeout(uuid, d));

        let Some(worker) = self.workers.get(&worker_id) else {
            if let Some(t) = timeout_task {
                t.abort();
            }
            settler.settle(Err(PoolError::Transport("worker not found".into())));
            return;
        };

        if let Err(err) = worker.send(Request::Invoke { uuid, path, args }) {
            if let Some(t) = timeout_task {
                t.abort();
            }
            warn!(task = %uuid, worker = %worker_id, "dispatch failed, treating as crash");
            self.discard_worker(worker_id);
            settler.settle(Err(err));
            self.redrive_queue();
            return;
        }

        self.pending_worker.insert(worker_id);
        self.active.insert(
            uuid,
            ActiveTask {
                settler,
                worker: worker_id,
                retained: false,
                timeout_task,
            },
        );
    }

    #[allow(clippy::expect_used)] // loop condition just checked the queue is non-empty
    fn redrive_queue(&mut self) {
        while !self.queue.is_empty() {
            let worker_id = if let Some(id) = self.pop_available() {
                id
            } else if self.workers.len() < self.limit {
                self.create_worker()
            } else {
                break;
            };
            let task = self.queue.pop_front().expect("checked non-empty");
            self.send_to_worker(worker_id, task.uuid, task.path, task.args, task.options, task.settler);
        }
    }

    // ---- replies ----

    fn handle_reply(&mut self, reply: Reply) {
        match reply {
            Reply::Event { uuid, event, data } => {
                if let Some(active) = self.active.get(&uuid) {
                    active.settler.dispatch_event(&event, &data);
                }
            }
            Reply::Retained { uuid } => self.handle_retained(uuid),
            Reply::Success { uuid, result } => self.settle_task(uuid, Ok(result)),
            Reply::Failure { uuid, error } => {
                let err = Self::classify_failure(error);
                self.settle_task(uuid, Err(err));
            }
        }
    }

    fn handle_retained(&mut self, uuid: TaskId) {
        let Some(active) = self.active.get_mut(&uuid) else {
            return;
        };
        active.retained = true;
        if let Some(t) = active.timeout_task.take() {
            t.abort();
        }
        let cmd_tx = self.cmd_tx.clone();
        active.settler.mark_retained(Arc::new(move |uuid| {
            let _ = cmd_tx.send(Command::ReleaseRetained { uuid });
        }));
    }

    fn handle_release_retained(&mut self, uuid: TaskId) {
        if let Some(active) = self.active.get(&uuid) {
            if active.retained {
                if let Some(worker) = self.workers.get(&active.worker) {
                    let _ = worker.send(Request::Release { uuid });
                }
            }
        }
    }

    /// Maps the wire protocol's "worker error" fallback string onto
    /// `PoolError::WorkerError` (a worker-fault classification that
    /// triggers crash-style discard) and everything else onto an
    /// application failure.
    fn classify_failure(error: FrameError) -> PoolError {
        if error.stack.is_none() && error.message == "worker error" {
            PoolError::WorkerError
        } else if let Some(path) = error
            .message
            .strip_prefix("path does not exist '")
            .and_then(|rest| rest.strip_suffix('\''))
        {
            PoolError::NoSuchPath(path.to_string())
        } else {
            PoolError::application(error.message, error.stack.as_deref())
        }
    }

    fn settle_task(&mut self, uuid: TaskId, outcome: Result<Value, PoolError>) {
        let Some(active) = self.active.remove(&uuid) else {
            return;
        };
        if let Some(t) = active.timeout_task {
            t.abort();
        }
        let worker_id = active.worker;
        self.pending_worker.remove(&worker_id);
        self.completed += 1;

        let is_fault = outcome.as_ref().err().is_some_and(is_worker_fault);
        if is_fault {
            warn!(task = %uuid, worker = %worker_id, "worker fault, discarding worker");
            self.discard_worker(worker_id);
        } else if self.workers.contains_key(&worker_id) {
            self.return_to_available(worker_id);
        }

        active.settler.settle(outcome);

        if self.shutting_down && self.active.is_empty() {
            self.finish_shutdown();
        }
        self.redrive_queue();
    }

    // ---- timeout ----

    fn arm_timeout(&self, uuid: TaskId, timeout: Duration) -> tokio::task::JoinHandle<()> {
        let cmd_tx = self.cmd_tx.clone();
        let ms = timeout.as_millis() as u64;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = cmd_tx.send(Command::Timeout { uuid, ms });
        })
    }

    fn handle_timeout(&mut self, uuid: TaskId, ms: u64) {
        let Some(active) = self.active.remove(&uuid) else {
            return;
        };
        let worker_id = active.worker;
        self.pending_worker.remove(&worker_id);
        warn!(task = %uuid, worker = %worker_id, ms, "task timed out");
        self.discard_worker(worker_id);
        // Preserve capacity: unlike a crash, a timeout gets an eager
        // replacement (asymmetry preserved from the source behaviour). The
        // replacement must actually land in `available` (or be handed a
        // queued task) -- otherwise it sits in `workers` unreachable by
        // `pop_available`/`redrive_queue` and the pool deadlocks at the
        // `limit` ceiling.
        let replacement = self.create_worker();
        self.return_to_available(replacement);
        active.settler.settle(Err(PoolError::TimedOut(ms)));

        if self.shutting_down && self.active.is_empty() {
            self.finish_shutdown();
        }
        self.redrive_queue();
    }

    // ---- cancellation ----

    #[allow(clippy::expect_used)] // `position` was just found on the same queue
    fn handle_abort(&mut self, uuid: TaskId) {
        if let Some(active) = self.active.remove(&uuid) {
            if let Some(t) = active.timeout_task {
                t.abort();
            }
            let worker_id = active.worker;
            self.pending_worker.remove(&worker_id);
            info!(task = %uuid, worker = %worker_id, "task aborted while executing");
            self.discard_worker(worker_id);
            let replacement = self.create_worker();
            self.return_to_available(replacement);
            active.settler.settle(Err(PoolError::Aborted));

            if self.shutting_down && self.active.is_empty() {
                self.finish_shutdown();
            }
            self.redrive_queue();
            return;
        }

        if let Some(pos) = self.queue.iter().position(|task| task.uuid == uuid) {
            let task = self.queue.remove(pos).expect("position just found");
            info!(task = %uuid, "task aborted while queued");
            task.settler.settle(Err(PoolError::Aborted));
        }
    }

    // ---- worker lifecycle ----

    fn create_worker(&mut self) -> WorkerId {
        let id = self.worker_ids.next();
        let handle = (self.spawn_worker)(id, self.reply_tx.clone());
        self.workers.insert(id, handle);
        id
    }

    fn pop_available(&mut self) -> Option<WorkerId> {
        let id = self.available.pop()?;
        self.cancel_idle_timer(id);
        Some(id)
    }

    fn return_to_available(&mut self, worker_id: WorkerId) {
        self.available.push(worker_id);
        if self.idle_timeout > Duration::ZERO {
            let cmd_tx = self.cmd_tx.clone();
            let idle_timeout = self.idle_timeout;
            let timer = tokio::spawn(async move {
                tokio::time::sleep(idle_timeout).await;
                let _ = cmd_tx.send(Command::IdleExpired { worker: worker_id });
            });
            self.idle_timers.insert(worker_id, timer);
        }
    }

    fn cancel_idle_timer(&mut self, worker_id: WorkerId) {
        if let Some(timer) = self.idle_timers.remove(&worker_id) {
            timer.abort();
        }
    }

    fn handle_idle_expired(&mut self, worker_id: WorkerId) {
        self.idle_timers.remove(&worker_id);
        if let Some(pos) = self.available.iter().position(|id| *id == worker_id) {
            self.available.remove(pos);
            debug!(worker = %worker_id, "idle worker evicted");
            self.discard_worker(worker_id);
        }
    }

    fn discard_worker(&mut self, worker_id: WorkerId) {
        self.cancel_idle_timer(worker_id);
        self.pending_worker.remove(&worker_id);
        if let Some(pos) = self.available.iter().position(|id| *id == worker_id) {
            self.available.remove(pos);
        }
        if let Some(worker) = self.workers.remove(&worker_id) {
            worker.terminate();
        }
    }

    // ---- stats / shutdown ----

    fn handle_stats(&self, respond: oneshot::Sender<PoolStats>) {
        let stats = PoolStats {
            workers: self.workers.len(),
            busy: self.pending_worker.len(),
            idle: self.available.len(),
            queued: self.queue.len(),
            completed: self.completed,
        };
        let _ = respond.send(stats);
    }

    fn handle_shutdown(&mut self, respond: oneshot::Sender<()>, drain_timeout: Option<Duration>) {
        info!(queued = self.queue.len(), active = self.active.len(), "shutting down pool");
        self.shutting_down = true;

        for (_, timer) in self.idle_timers.drain() {
            timer.abort();
        }
        self.available.clear();

        while let Some(task) = self.queue.pop_front() {
            task.settler.settle(Err(PoolError::Closing));
        }

        for (uuid, active) in self.active.iter() {
            if active.retained {
                if let Some(worker) = self.workers.get(&active.worker) {
                    let _ = worker.send(Request::Release { uuid: *uuid });
                }
            }
        }

        if self.active.is_empty() {
            self.terminate_all_workers();
            let _ = respond.send(());
            return;
        }

        self.shutdown_respond = Some(respond);
        if let Some(drain_timeout) = drain_timeout {
            let cmd_tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(drain_timeout).await;
                let _ = cmd_tx.send(Command::ForceShutdown);
            });
        }
    }

    fn handle_force_shutdown(&mut self) {
        if self.shutdown_respond.is_none() {
            return;
        }
        warn!(active = self.active.len(), "drain timeout elapsed, forcing shutdown");
        for (_, active) in self.active.drain() {
            if let Some(t) = active.timeout_task {
                t.abort();
            }
            active.settler.settle(Err(PoolError::Closing));
        }
        self.finish_shutdown();
    }

    fn finish_shutdown(&mut self) {
        self.terminate_all_workers();
        if let Some(respond) = self.shutdown_respond.take() {
            let _ = respond.send(());
        }
    }

    fn terminate_all_workers(&mut self) {
        for (_, worker) in self.workers.drain() {
            worker.terminate();
        }
        self.pending_worker.clear();
        self.available.clear();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use crate::dispatcher::{boxed_cleanup, ActionContext, ActionFailure};
    use std::time::Duration as StdDuration;

    fn add_tree() -> ActionTree {
        ActionTree::branch([(
            "math",
            ActionTree::branch([(
                "add",
                ActionTree::leaf(|_ctx: ActionContext, args: Vec<Value>| async move {
                    let (Value::Int(a), Value::Int(b)) = (&args[0], &args[1]) else {
                        return Err(ActionFailure::new("expected two ints"));
                    };
                    Ok(Value::Int(a + b))
                }),
            )]),
        )])
    }

    #[tokio::test]
    async fn basic_call_resolves_and_prewarms() {
        let pool = Pool::spawn(
            add_tree(),
            PoolOptions {
                limit: Some(2),
                ..Default::default()
            },
        );
        let result = pool
            .schedule("math.add", vec![Value::Int(2), Value::Int(3)], TaskOptions::default())
            .await
            .unwrap();
        assert_eq!(result, Value::Int(5));
        let stats = pool.stats().await;
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.workers, 2);
        assert_eq!(stats.idle, 2);
    }

    #[tokio::test]
    async fn unknown_path_rejects_with_no_such_path_message() {
        let pool = Pool::spawn(
            add_tree(),
            PoolOptions {
                limit: Some(1),
                ..Default::default()
            },
        );
        let err = pool
            .schedule("nope", vec![], TaskOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "path does not exist 'nope'");
        assert!(matches!(err, PoolError::NoSuchPath(path) if path == "nope"));
    }

    fn sleep_tree() -> ActionTree {
        ActionTree::leaf(|_ctx: ActionContext, args: Vec<Value>| async move {
            let Value::Int(ms) = args[0] else {
                return Err(ActionFailure::new("expected int"));
            };
            tokio::time::sleep(StdDuration::from_millis(ms as u64)).await;
            Ok(Value::Int(ms))
        })
    }

    #[tokio::test]
    async fn queues_under_saturation_and_completes_in_order() {
        let pool = Pool::spawn(
            sleep_tree(),
            PoolOptions {
                limit: Some(1),
                ..Default::default()
            },
        );
        let first = pool.schedule("", vec![Value::Int(30)], TaskOptions::default());
        tokio::time::sleep(StdDuration::from_millis(5)).await;
        let stats_while_busy = pool.stats().await;
        assert!(stats_while_busy.busy >= 1);
        let second = pool.schedule("", vec![Value::Int(0)], TaskOptions::default());
        let (first_res, second_res) = tokio::join!(first, second);
        assert_eq!(first_res.unwrap(), Value::Int(30));
        assert_eq!(second_res.unwrap(), Value::Int(0));
    }

    fn forever_tree() -> ActionTree {
        ActionTree::leaf(|_ctx: ActionContext, _args: Vec<Value>| async move {
            std::future::pending::<()>().await;
            Ok(Value::Null)
        })
    }

    /// A `forever`/`math.add` tree, so a test can run a never-returning task
    /// to trigger timeout/abort and then prove the pool actually recovers by
    /// submitting a real follow-up call on the same pool, per spec §8
    /// scenarios 3/4 ("a new worker exists for the next call; the next
    /// `add(1,2)` resolves to `3`").
    fn forever_and_add_tree() -> ActionTree {
        ActionTree::branch([
            ("forever", forever_tree()),
            (
                "math",
                ActionTree::branch([(
                    "add",
                    ActionTree::leaf(|_ctx: ActionContext, args: Vec<Value>| async move {
                        let (Value::Int(a), Value::Int(b)) = (&args[0], &args[1]) else {
                            return Err(ActionFailure::new("expected two ints"));
                        };
                        Ok(Value::Int(a + b))
                    }),
                )]),
            ),
        ])
    }

    #[tokio::test]
    async fn timeout_fails_task_and_replaces_worker() {
        let pool = Pool::spawn(
            forever_and_add_tree(),
            PoolOptions {
                limit: Some(1),
                ..Default::default()
            },
        );
        let options = TaskOptions::default().with_timeout(StdDuration::from_millis(20));
        let err = pool.schedule("forever", vec![], options).await.unwrap_err();
        assert_eq!(err.to_string(), "task timed out after 20ms");

        let stats = pool.stats().await;
        assert_eq!(stats.workers, 1);

        // The replacement worker must be usable, not just counted: a
        // follow-up call on the same pool has to actually complete.
        let sum = pool
            .schedule("math.add", vec![Value::Int(1), Value::Int(2)], TaskOptions::default())
            .await
            .unwrap();
        assert_eq!(sum, Value::Int(3));
    }

    #[tokio::test]
    async fn abort_terminates_executing_worker_and_pool_recovers() {
        let pool = Pool::spawn(
            forever_and_add_tree(),
            PoolOptions {
                limit: Some(1),
                ..Default::default()
            },
        );
        let signal = CancellationToken::new();
        let options = TaskOptions::default().with_signal(signal.clone());
        let handle = pool.schedule("forever", vec![], options);
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        signal.cancel();
        let err = handle.await.unwrap_err();
        assert_eq!(err.to_string(), "task aborted");

        // Capacity must not shrink after an abort: a follow-up call on the
        // same pool has to complete on the replacement worker.
        let sum = pool
            .schedule("math.add", vec![Value::Int(1), Value::Int(2)], TaskOptions::default())
            .await
            .unwrap();
        assert_eq!(sum, Value::Int(3));
    }

    #[tokio::test]
    async fn pre_aborted_signal_settles_immediately_without_dispatch() {
        let pool = Pool::spawn(
            add_tree(),
            PoolOptions {
                limit: Some(1),
                ..Default::default()
            },
        );
        let signal = CancellationToken::new();
        signal.cancel();
        let options = TaskOptions::default().with_signal(signal);
        let err = pool
            .schedule("math.add", vec![Value::Int(1), Value::Int(1)], options)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "task aborted");
        assert_eq!(pool.stats().await.completed, 0);
    }

    fn stream_tree() -> ActionTree {
        ActionTree::leaf(|ctx: ActionContext, args: Vec<Value>| async move {
            let Value::Int(n) = args[0] else {
                return Err(ActionFailure::new("expected int"));
            };
            ctx.retain(None);
            for i in 0..n {
                ctx.dispatch("progress", Value::Int(i));
            }
            ctx.release(Value::Int(n));
            Ok(Value::Null)
        })
    }

    #[tokio::test]
    async fn retained_task_emits_events_then_resolves() {
        let pool = Pool::spawn(
            stream_tree(),
            PoolOptions {
                limit: Some(1),
                ..Default::default()
            },
        );
        let mut handle = pool.schedule("", vec![Value::Int(3)], TaskOptions::default());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        handle.on("progress", move |data| {
            if let Value::Int(i) = data {
                seen2.lock().unwrap().push(*i);
            }
        });
        let result = handle.await.unwrap();
        assert_eq!(result, Value::Int(3));
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn shutdown_fails_queued_tasks_and_drains_retained() {
        let pool = Pool::spawn(
            sleep_tree(),
            PoolOptions {
                limit: Some(1),
                ..Default::default()
            },
        );
        let executing = pool.schedule("", vec![Value::Int(30)], TaskOptions::default());
        tokio::time::sleep(StdDuration::from_millis(5)).await;
        let queued = pool.schedule("", vec![Value::Int(0)], TaskOptions::default());

        let shutdown = pool.shutdown();
        let (exec_res, queued_res, _) = tokio::join!(executing, queued, shutdown);
        assert_eq!(exec_res.unwrap(), Value::Int(30));
        assert_eq!(queued_res.unwrap_err().to_string(), "pool closing");

        let stats = pool.stats().await;
        assert_eq!(stats.workers, 0);
    }

    #[tokio::test]
    async fn schedule_after_shutdown_rejects_immediately() {
        let pool = Pool::spawn(
            add_tree(),
            PoolOptions {
                limit: Some(1),
                ..Default::default()
            },
        );
        pool.shutdown().await;
        let err = pool
            .schedule("math.add", vec![Value::Int(1), Value::Int(1)], TaskOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "pool closing");
    }

    #[tokio::test]
    async fn shutdown_with_drain_timeout_forces_pending_retained_task() {
        let pool = Pool::spawn(
            ActionTree::leaf(|ctx: ActionContext, _args: Vec<Value>| async move {
                // A cleanup that never completes: `handle_shutdown` sends the
                // release frame, but the worker-side cleanup hangs, so the
                // task can only settle via the drain-timeout's force path,
                // not via a (premature) cleanup reply.
                ctx.retain(Some(boxed_cleanup(|| async move {
                    std::future::pending::<()>().await;
                    Ok(Value::Null)
                })));
                std::future::pending::<()>().await;
                Ok(Value::Null)
            }),
            PoolOptions {
                limit: Some(1),
                ..Default::default()
            },
        );
        let handle = pool.schedule("", vec![], TaskOptions::default());
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        pool.shutdown_with_drain_timeout(StdDuration::from_millis(30)).await;
        let err = handle.await.unwrap_err();
        assert_eq!(err.to_string(), "pool closing");
    }

    #[tokio::test]
    async fn idle_timeout_evicts_available_worker() {
        let pool = Pool::spawn(
            add_tree(),
            PoolOptions {
                limit: Some(1),
                idle_timeout_ms: 15,
                ..Default::default()
            },
        );
        pool.schedule("math.add", vec![Value::Int(1), Value::Int(1)], TaskOptions::default())
            .await
            .unwrap();
        assert_eq!(pool.stats().await.workers, 1);
        tokio::time::sleep(StdDuration::from_millis(60)).await;
        assert_eq!(pool.stats().await.workers, 0);
    }

    #[tokio::test]
    async fn panicking_action_is_treated_as_a_worker_crash() {
        let pool = Pool::spawn(
            ActionTree::leaf(|_ctx: ActionContext, _args: Vec<Value>| async move {
                panic!("boom");
                #[allow(unreachable_code)]
                Ok(Value::Null)
            }),
            PoolOptions {
                limit: Some(2),
                ..Default::default()
            },
        );
        let err = pool.schedule("", vec![], TaskOptions::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "worker error");
        // No eager replacement on crash: the pool drops to one live worker
        // until the next admission lazily creates another.
        assert_eq!(pool.stats().await.workers, 1);
    }
}
