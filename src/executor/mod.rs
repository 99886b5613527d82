// Thread-pool executor module
//
// Dispatches plain work items and owned tasks onto a bounded worker pool and hands back
// one Future per submission. Submissions are tracked until their future is terminal so
// that `shutdown(true)` can drain them.
//
// Owned tasks take a detour: the submitter parks the task on the transport depot, and the
// worker that picks it up asks the depot to hand it over, runs it inside its own event
// loop until the task's future is terminal, then returns it to the submitter.

use indexmap::IndexMap;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use std::vec;
use thiserror::Error;

use crate::context::{Context, ContextError, EventLoop};
use crate::depot::Depot;
use crate::future::{Failure, Future, FutureError, FutureId, FutureState, StateError};
use crate::metrics::Metrics;
use crate::pool::WorkerPool;
use crate::task::{Task, TaskError};

/// Errors returned to the submitter
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// `shutdown` was called; no new work is accepted
    #[error("cannot schedule new work after shutdown")]
    ShuttingDown,

    /// The task cannot be submitted from this context in its current shape
    #[error(transparent)]
    Task(#[from] TaskError),

    /// The task's future has already left the pending state
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("worker pool unavailable: {0}")]
    Pool(#[from] io::Error),
}

/// Something that can be submitted: a plain closure or an owned task
pub enum WorkItem<T> {
    Call(Box<dyn FnOnce() -> anyhow::Result<T> + Send>),
    Task(Task<T>),
}

impl<T> WorkItem<T> {
    pub fn call<F>(work: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        WorkItem::Call(Box::new(work))
    }
}

impl<T> From<Task<T>> for WorkItem<T> {
    fn from(task: Task<T>) -> Self {
        WorkItem::Task(task)
    }
}

impl<T> fmt::Debug for WorkItem<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkItem::Call(_) => f.write_str("WorkItem::Call"),
            WorkItem::Task(task) => f.debug_tuple("WorkItem::Task").field(task).finish(),
        }
    }
}

/// A submission the executor waits for on shutdown
trait Outstanding: Send + Sync {
    fn wait_done(&self);
}

impl<T: Send + 'static> Outstanding for Future<T> {
    fn wait_done(&self) {
        // Cancellation or failure both count as done here
        if let Err(e) = self.exception(None) {
            tracing::debug!(future = %self.id(), "outstanding future ended: {e}");
        }
    }
}

#[derive(Default)]
struct Bookkeeping {
    shutdown: bool,
    outstanding: IndexMap<FutureId, Arc<dyn Outstanding>>,
}

struct ExecutorShared {
    pool: Arc<WorkerPool>,
    state: Mutex<Bookkeeping>,
}

impl ExecutorShared {
    fn lock(&self) -> MutexGuard<'_, Bookkeeping> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Executor running submissions on a [`WorkerPool`]
///
/// Cloning yields another handle to the same executor.
///
/// # Example
/// ```
/// use taskdepot::ThreadExecutor;
///
/// let executor = ThreadExecutor::new().unwrap();
/// let future = executor.submit(|| Ok(21 * 2)).unwrap();
/// assert_eq!(future.result(None).unwrap(), 42);
/// executor.shutdown(true);
/// ```
#[derive(Clone)]
pub struct ThreadExecutor {
    shared: Arc<ExecutorShared>,
}

impl fmt::Debug for ThreadExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("ThreadExecutor")
            .field("pool", &self.shared.pool)
            .field("shutdown", &state.shutdown)
            .field("outstanding", &state.outstanding.len())
            .finish()
    }
}

impl ThreadExecutor {
    /// Executor on the process-wide [`WorkerPool::global`] pool
    pub fn new() -> Result<Self, ExecutorError> {
        Ok(Self::with_pool(WorkerPool::global()?))
    }

    /// Executor on an explicit pool
    pub fn with_pool(pool: Arc<WorkerPool>) -> Self {
        Self {
            shared: Arc::new(ExecutorShared {
                pool,
                state: Mutex::new(Bookkeeping::default()),
            }),
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.shared.pool
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.lock().shutdown
    }

    /// Number of submissions whose future is not yet terminal
    pub fn outstanding_count(&self) -> usize {
        self.shared.lock().outstanding.len()
    }

    /// Run `work` on the pool
    ///
    /// Returns immediately with the future of the computation. An `Err` (or a panic)
    /// from `work` is stored in the future.
    pub fn submit<T, F>(&self, work: F) -> Result<Future<T>, ExecutorError>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let future = Future::new();
        {
            let mut state = self.shared.lock();
            if state.shutdown {
                return Err(ExecutorError::ShuttingDown);
            }
            self.track(&mut state, &future);
        }

        let f = future.clone();
        self.shared.pool.start(move || run_call(&f, work));
        Ok(future)
    }

    /// Run an owned task on the pool, returning its embedded future
    ///
    /// The task must be owned by the calling context and must not have a parent. It is
    /// parked on the transport [`Depot`] until a worker takes it over, runs on that
    /// worker's event loop, and is handed back to the calling context afterwards.
    ///
    /// # Errors
    /// - [`ExecutorError::ShuttingDown`] after [`shutdown`](Self::shutdown)
    /// - [`TaskError::ForeignOwner`] if the calling context does not own the task
    /// - [`TaskError::HasParent`] if the task has a parent
    /// - [`ExecutorError::State`] if the task has already run
    pub fn submit_task<T>(&self, task: &Task<T>) -> Result<Future<T>, ExecutorError>
    where
        T: Clone + Send + 'static,
    {
        let depot = Depot::instance()?;
        let origin = Context::current();
        let future = task.future();

        {
            let mut state = self.shared.lock();
            if state.shutdown {
                return Err(ExecutorError::ShuttingDown);
            }

            let current = future.state();
            if matches!(current, FutureState::Running | FutureState::Finished) {
                return Err(StateError {
                    future: future.id(),
                    from: current,
                    to: FutureState::Running,
                }
                .into());
            }

            task.move_to(depot.context())?;
            self.track(&mut state, &future);
        }

        tracing::debug!(task = %task.id(), future = %future.id(), "task parked on depot");

        let task = task.clone();
        self.shared
            .pool
            .start(move || run_task(&task, &depot, &origin));
        Ok(future)
    }

    /// Submit either kind of [`WorkItem`]
    pub fn submit_item<T>(&self, item: impl Into<WorkItem<T>>) -> Result<Future<T>, ExecutorError>
    where
        T: Clone + Send + 'static,
    {
        match item.into() {
            WorkItem::Call(work) => self.submit(work),
            WorkItem::Task(task) => self.submit_task(&task),
        }
    }

    /// Apply `func` to every input on the pool
    ///
    /// All inputs are submitted before this returns; the returned iterator then yields
    /// each result in input order, blocking on each in turn.
    pub fn map<A, T, F, I>(&self, func: F, inputs: I) -> Result<MapResults<T>, ExecutorError>
    where
        A: Send + 'static,
        T: Clone + Send + 'static,
        F: Fn(A) -> anyhow::Result<T> + Send + Sync + 'static,
        I: IntoIterator<Item = A>,
    {
        let func = Arc::new(func);
        let futures = inputs
            .into_iter()
            .map(|input| {
                let func = Arc::clone(&func);
                self.submit(move || func(input))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(MapResults {
            futures: futures.into_iter(),
        })
    }

    /// Stop accepting work
    ///
    /// With `wait`, blocks until every submission outstanding at the time of the call
    /// has finished or been cancelled. Calling it again is harmless.
    pub fn shutdown(&self, wait: bool) {
        let pending: Vec<Arc<dyn Outstanding>> = {
            let mut state = self.shared.lock();
            state.shutdown = true;
            state.outstanding.values().cloned().collect()
        };

        tracing::info!(outstanding = pending.len(), wait, "executor shutting down");
        if wait {
            for item in pending {
                item.wait_done();
            }
        }
    }

    fn track<T: Send + 'static>(&self, state: &mut Bookkeeping, future: &Future<T>) {
        let id = future.id();
        state
            .outstanding
            .insert(id, Arc::new(future.clone()) as Arc<dyn Outstanding>);

        let weak: Weak<ExecutorShared> = Arc::downgrade(&self.shared);
        future.add_state_observer(move |_, new_state| {
            if new_state.is_terminal() {
                if let Some(shared) = weak.upgrade() {
                    shared.lock().outstanding.shift_remove(&id);
                }
            }
        });
        // Terminal before the observer was in place
        if future.done() {
            state.outstanding.shift_remove(&id);
        }

        let metrics = Metrics::global();
        metrics.record_submitted();
        future.add_done_callback(move |f| match f.exception(Some(Duration::ZERO)) {
            Ok(None) => metrics.record_outcome(FutureState::Finished, None),
            Ok(Some(failure)) => {
                metrics.record_outcome(FutureState::Finished, Some(&FutureError::Failed(failure)))
            }
            Err(e) => metrics.record_outcome(f.state(), Some(&e)),
        });
    }
}

/// Pool job for a plain work item
fn run_call<T, F>(future: &Future<T>, work: F)
where
    F: FnOnce() -> anyhow::Result<T>,
{
    match future.set_running_or_notify_cancel() {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(future = %future.id(), "work item cancelled before it ran");
            return;
        }
        Err(e) => {
            worker_error(&e);
            return;
        }
    }

    let started = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(work));
    Metrics::global().record_run_time(started.elapsed());

    let stored = match outcome {
        Ok(Ok(value)) => future.set_result(value),
        Ok(Err(error)) => future.set_exception(error),
        Err(payload) => future.set_failure(Failure::from_panic(payload)),
    };
    if let Err(e) = stored {
        worker_error(&e);
    }
}

/// Pool job for an owned task
fn run_task<T>(task: &Task<T>, depot: &Depot, origin: &Context)
where
    T: Clone + Send + 'static,
{
    let event_loop = EventLoop::new();

    if let Err(e) = depot.transfer(task, event_loop.context()) {
        worker_error(&e);
        if let Err(e) = task.future().set_exception(e) {
            tracing::debug!(task = %task.id(), "task already terminal: {e}");
        }
        return;
    }

    // A rejected state transition emits no terminal event, so the future ends the loop
    let future = task.future();
    let quitter = event_loop.quitter();
    future.add_done_callback(move |_| quitter.quit());

    let started = Instant::now();
    match task.start() {
        Ok(()) => {
            if !future.done() {
                event_loop.exec();
            }
            // Deliver the request even if the future ended first, so `Cancelled` is emitted
            event_loop.process_events();
            Metrics::global().record_run_time(started.elapsed());
        }
        Err(e) => worker_error(&e),
    }

    if let Err(e) = task.move_to(origin) {
        tracing::warn!(task = %task.id(), "could not return task to its submitter: {e}");
    }
}

fn worker_error(error: &dyn std::error::Error) {
    Metrics::global().record_worker_error();
    tracing::error!("exception in worker: {error}");
}

/// Results of [`ThreadExecutor::map`], in input order
///
/// Each call to `next` blocks until the corresponding submission is done.
#[derive(Debug)]
pub struct MapResults<T> {
    futures: vec::IntoIter<Future<T>>,
}

impl<T: Clone> Iterator for MapResults<T> {
    type Item = Result<T, FutureError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.futures.next().map(|future| future.result(None))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.futures.size_hint()
    }
}

impl<T: Clone> ExactSizeIterator for MapResults<T> {}
