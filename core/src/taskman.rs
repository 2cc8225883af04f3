//! Typed task lifecycle across a worker pool and the main thread.
//!
//! Tasks are allocated out of a fixed slot table, published with
//! [`Task::activate`], dispatched by the main-thread [`Taskman::update`]
//! cycle (worker kinds to the pool, main-thread kinds to the MT queue) and
//! finished either by completing or by parking on a blocked resource.
//! Completion hooks observe tasks in completion-key order, which makes the
//! notification order stable within one update cycle.
//!
//! The task kind and payload types are node-specific; the scheduler is
//! generic over both.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crate::error::TypedError;
use crate::halloc::{HandleAlloc, INVALID_HANDLE};
use crate::pool::Pool;

pub const MAX_TASKS: u16 = 4096;

/// Marker for tasks issued from the command line rather than a peer.
pub const CLI_CLIENT: u16 = INVALID_HANDLE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOrigin {
    /// Issued at this node's command line.
    Cli,
    /// Issued by a connected peer; completion emits a response packet.
    Api,
    /// Issued by a timer or another task.
    Internal,
    /// Internal, but jumps the worker queue.
    InternalPriority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    None,
    New,
    Ready,
    Running,
    /// Running on a worker, waiting for a remote reply.
    RunningAwaiting,
    Completed,
    /// Must be re-submitted; the reschedule hook decides where.
    BlockedReschedule,
    /// Parked in a resource's blocked queue until it unblocks.
    BlockedAwaiting,
}

/// Node-specific task kind; distinguishes pool work from main-thread work.
pub trait TaskKind: Copy + Send + Sync + std::fmt::Debug + 'static {
    fn is_worker(&self) -> bool;
}

pub struct TaskBody<K, D> {
    pub state: TaskState,
    pub origin: TaskOrigin,
    pub kind: K,
    pub err: Option<TypedError>,
    /// Server-context client handle the request came from, `CLI_CLIENT`
    /// for local ones.
    pub client: u16,
    /// Remote identifier carried by API requests for response matching.
    pub remote_id: u16,
    /// Peer node a `RunningAwaiting` task expects its reply from.
    pub awaiting_node: u16,
    pub start_time: Option<Instant>,
    completion_key: u32,
    pub data: D,
}

/// One slot of the task table. The body is guarded by a per-task mutex
/// which doubles, together with the condvar, as the request/response
/// rendezvous between a worker and the response handler.
pub struct Task<K, D> {
    handle: u16,
    body: Mutex<TaskBody<K, D>>,
    response: Condvar,
}

impl<K: TaskKind, D: Default> Task<K, D> {
    pub fn handle(&self) -> u16 {
        self.handle
    }

    pub fn state(&self) -> TaskState {
        self.body.lock().unwrap().state
    }

    pub fn kind(&self) -> K {
        self.body.lock().unwrap().kind
    }

    pub fn origin(&self) -> TaskOrigin {
        self.body.lock().unwrap().origin
    }

    pub fn client(&self) -> u16 {
        self.body.lock().unwrap().client
    }

    pub fn remote_id(&self) -> u16 {
        self.body.lock().unwrap().remote_id
    }

    pub fn err(&self) -> Option<TypedError> {
        self.body.lock().unwrap().err.clone()
    }

    pub fn set_err(&self, err: TypedError) {
        self.body.lock().unwrap().err = Some(err);
    }

    pub fn set_state(&self, state: TaskState) {
        self.body.lock().unwrap().state = state;
    }

    /// Publishes the task to the scheduler.
    pub fn activate(&self) {
        self.body.lock().unwrap().state = TaskState::New;
    }

    /// Runs `f` with the task body locked.
    pub fn with_body<R>(&self, f: impl FnOnce(&mut TaskBody<K, D>) -> R) -> R {
        f(&mut self.body.lock().unwrap())
    }

    /// Marks the task as waiting for a remote reply. Must be called before
    /// the request is sent so a racing response cannot be missed.
    pub fn begin_await(&self, node: u16) {
        let mut body = self.body.lock().unwrap();
        body.state = TaskState::RunningAwaiting;
        body.awaiting_node = node;
    }

    /// Blocks the calling worker until the response handler (or an abort)
    /// flips the task back to `Running`.
    pub fn wait_response(&self) {
        let mut body = self.body.lock().unwrap();
        while body.state == TaskState::RunningAwaiting {
            body = self.response.wait(body).unwrap();
        }
    }

    /// Delivers a response: runs `f` on the body, resumes the worker.
    /// No-op unless the task is actually awaiting.
    pub fn resume(&self, f: impl FnOnce(&mut TaskBody<K, D>)) -> bool {
        let mut body = self.body.lock().unwrap();
        if body.state != TaskState::RunningAwaiting {
            return false;
        }
        f(&mut body);
        body.state = TaskState::Running;
        self.response.notify_one();
        true
    }

    /// Wakes an awaiting task with an error (peer disconnected, shutdown).
    pub fn abort_await(&self, err: TypedError) -> bool {
        self.resume(|body| body.err = Some(err))
    }

    fn reset(&self, kind: K) {
        let mut body = self.body.lock().unwrap();
        body.state = TaskState::None;
        body.origin = TaskOrigin::Internal;
        body.kind = kind;
        body.err = None;
        body.client = CLI_CLIENT;
        body.remote_id = INVALID_HANDLE;
        body.awaiting_node = INVALID_HANDLE;
        body.start_time = None;
        body.completion_key = 0;
        body.data = D::default();
    }
}

/// Per-node behaviour plugged into the scheduler.
pub trait TaskHooks<K: TaskKind, D: Default>: Send + Sync {
    /// Executes a worker-kind task on a pool thread. The implementation
    /// finishes by calling [`Taskman::complete`] or by moving the task to
    /// a blocked state.
    fn run_worker(&self, task: &Arc<Task<K, D>>);

    /// Executes a main-thread task. Returning `false` re-activates the
    /// task for the next update cycle.
    fn run_main(&self, task: &Arc<Task<K, D>>) -> bool;

    /// Observes a completed task (reply packet, console line, follow-ups).
    fn completed(&self, task: &Arc<Task<K, D>>);

    /// Decides where a `BlockedReschedule` task goes.
    fn reschedule(&self, task: &Arc<Task<K, D>>);
}

struct Registry {
    halloc: HandleAlloc,
    is_running: bool,
}

pub struct Taskman<K: TaskKind, D: Send + 'static> {
    tasks: Vec<Arc<Task<K, D>>>,
    registry: Mutex<Registry>,
    mt_queue: Mutex<VecDeque<u16>>,
    completion_key: Mutex<u32>,
    pool: Mutex<Option<Pool<Arc<Task<K, D>>>>>,
}

impl<K: TaskKind, D: Default + Send + 'static> Taskman<K, D> {
    /// Builds the task table and starts the worker pool.
    pub fn new(workers: u16, default_kind: K, hooks: Arc<dyn TaskHooks<K, D>>) -> Arc<Self> {
        let tasks = (0..MAX_TASKS)
            .map(|handle| {
                Arc::new(Task {
                    handle,
                    body: Mutex::new(TaskBody {
                        state: TaskState::None,
                        origin: TaskOrigin::Internal,
                        kind: default_kind,
                        err: None,
                        client: CLI_CLIENT,
                        remote_id: INVALID_HANDLE,
                        awaiting_node: INVALID_HANDLE,
                        start_time: None,
                        completion_key: 0,
                        data: D::default(),
                    }),
                    response: Condvar::new(),
                })
            })
            .collect();

        let taskman = Arc::new(Self {
            tasks,
            registry: Mutex::new(Registry {
                halloc: HandleAlloc::new(MAX_TASKS),
                is_running: true,
            }),
            mt_queue: Mutex::new(VecDeque::new()),
            completion_key: Mutex::new(0),
            pool: Mutex::new(None),
        });

        let pool_hooks = Arc::clone(&hooks);
        let pool = Pool::new("worker", workers, move |task: Arc<Task<K, D>>| {
            task.set_state(TaskState::Running);
            pool_hooks.run_worker(&task);
        });
        *taskman.pool.lock().unwrap() = Some(pool);

        taskman
    }

    pub fn is_running(&self) -> bool {
        self.registry.lock().unwrap().is_running
    }

    /// Allocates a task. Returns `None` when shutting down or out of slots.
    /// The caller fills in its payload and then calls [`Task::activate`].
    pub fn create(
        &self,
        origin: TaskOrigin,
        kind: K,
        data: D,
        client: u16,
    ) -> Option<Arc<Task<K, D>>> {
        let handle = {
            let mut registry = self.registry.lock().unwrap();
            if !registry.is_running {
                return None;
            }
            registry.halloc.alloc()
        };
        if handle == INVALID_HANDLE {
            warn!("task table exhausted, dropping a {kind:?} request");
            return None;
        }

        let task = &self.tasks[handle as usize];
        {
            let mut body = task.body.lock().unwrap();
            body.state = TaskState::None;
            body.origin = origin;
            body.kind = kind;
            body.err = None;
            body.client = if origin == TaskOrigin::Api { client } else { CLI_CLIENT };
            body.remote_id = INVALID_HANDLE;
            body.awaiting_node = INVALID_HANDLE;
            body.data = data;
        }
        Some(Arc::clone(task))
    }

    /// Looks a live task up by handle (response demultiplexing).
    pub fn get(&self, handle: u16) -> Option<Arc<Task<K, D>>> {
        let registry = self.registry.lock().unwrap();
        if !registry.is_running || !registry.halloc.is_valid(handle) {
            return None;
        }
        Some(Arc::clone(&self.tasks[handle as usize]))
    }

    /// Visits every live task; `f` returning `false` stops the walk.
    pub fn foreach(&self, mut f: impl FnMut(&Arc<Task<K, D>>) -> bool) {
        let handles: Vec<u16> = {
            let registry = self.registry.lock().unwrap();
            registry.halloc.iter().collect()
        };
        for handle in handles {
            if !f(&self.tasks[handle as usize]) {
                return;
            }
        }
    }

    /// Stamps the completion key and marks the task completed.
    pub fn complete(&self, task: &Task<K, D>) {
        if !self.is_running() {
            return;
        }
        let mut key = self.completion_key.lock().unwrap();
        let mut body = task.body.lock().unwrap();
        body.completion_key = *key;
        body.state = TaskState::Completed;
        *key += 1;
    }

    /// One main-loop iteration: dispatch fresh tasks, deliver completions
    /// in key order, drain the main-thread queue.
    pub fn update(&self, hooks: &dyn TaskHooks<K, D>) {
        let running = self.is_running();
        let handles: Vec<u16> = {
            let registry = self.registry.lock().unwrap();
            registry.halloc.iter().collect()
        };

        let mut completed: Vec<(u32, u16)> = Vec::new();
        let mut reschedule: Vec<u16> = Vec::new();

        for handle in handles {
            let task = &self.tasks[handle as usize];
            let mut body = task.body.lock().unwrap();

            if running {
                match body.state {
                    TaskState::New => {
                        body.state = TaskState::Ready;
                        body.start_time = Some(Instant::now());
                        body.err = None; // important on re-scheduling
                        let is_worker = body.kind.is_worker();
                        let priority = body.origin == TaskOrigin::InternalPriority;
                        drop(body);
                        if is_worker {
                            let pool = self.pool.lock().unwrap();
                            if let Some(pool) = pool.as_ref() {
                                if priority {
                                    pool.submit_first(Arc::clone(task));
                                } else {
                                    pool.submit(Arc::clone(task));
                                }
                            }
                        } else {
                            self.mt_queue.lock().unwrap().push_back(handle);
                        }
                        continue;
                    }
                    TaskState::BlockedReschedule => {
                        reschedule.push(handle);
                    }
                    _ => {}
                }
            }

            if body.state == TaskState::Completed {
                completed.push((body.completion_key, handle));
            }
        }

        for handle in reschedule {
            hooks.reschedule(&self.tasks[handle as usize]);
        }

        if !completed.is_empty() {
            completed.sort_unstable_by_key(|&(key, _)| key);
            for (_, handle) in completed {
                let task = &self.tasks[handle as usize];
                hooks.completed(task);
                self.free(handle);
            }
        }

        if running {
            self.process_mt_queue(hooks);
        }
    }

    fn process_mt_queue(&self, hooks: &dyn TaskHooks<K, D>) {
        let max = self.mt_queue.lock().unwrap().len();
        for _ in 0..max {
            let Some(handle) = self.mt_queue.lock().unwrap().pop_front() else {
                return;
            };
            let task = &self.tasks[handle as usize];
            task.set_state(TaskState::Running);
            if hooks.run_main(task) {
                self.complete(task);
            } else {
                // cannot run right now, retry next tick
                task.activate();
            }
        }
    }

    fn free(&self, handle: u16) {
        let default_kind = self.tasks[handle as usize].kind();
        self.tasks[handle as usize].reset(default_kind);
        let mut registry = self.registry.lock().unwrap();
        if registry.halloc.is_valid(handle) {
            registry.halloc.free(handle);
        }
    }

    /// Denies new task creation and pauses the pool without blocking.
    /// Network contexts must be destroyed after this (waking awaiting
    /// workers) and before [`Taskman::shutdown`].
    pub fn stop(&self) {
        {
            let mut registry = self.registry.lock().unwrap();
            registry.is_running = false;
        }
        if let Some(pool) = self.pool.lock().unwrap().as_ref() {
            pool.pause_nb();
        }
    }

    /// Joins the worker pool. Every awaiting task must have been woken
    /// before this is called, otherwise the join never returns.
    pub fn shutdown(&self) {
        let pool = self.pool.lock().unwrap().take();
        if let Some(pool) = pool {
            pool.shutdown();
        }
    }
}
