// Owned task module
//
// A Task is a unit of work bound to an owning context. Its body and its lifecycle events
// always run on whichever thread currently owns the task, even when `start()` is called
// from elsewhere. Ownership is an explicit, reassignable field that may only be changed
// by the current owner, so relocation races are visible instead of implicit.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

use crate::context::{Context, ContextError, ContextId};
use crate::depot::Depot;
use crate::future::{Failure, Future, FutureError};
use crate::signal::{ConnectionId, ConnectionKind, Signal};

/// Process-unique identity of a [`Task`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Lifecycle events emitted by a [`Task`] on its owning context
#[derive(Clone, Debug)]
pub enum TaskEvent<T> {
    /// The body is about to run
    Started,
    /// The body returned a value (emitted before `Finished`)
    ResultReady(T),
    /// The body failed (emitted before `Finished`)
    ErrorReady(Failure),
    /// The body ran to completion, successfully or not
    Finished,
    /// The task's future was cancelled before the body could run
    Cancelled,
}

impl<T> TaskEvent<T> {
    /// Whether no further events follow this one
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskEvent::Finished | TaskEvent::Cancelled)
    }
}

/// Errors that can occur when relocating, starting or submitting a task
#[derive(Error, Debug)]
pub enum TaskError {
    /// The calling thread does not own the task
    #[error("{task} is owned by {owner}, not by the calling context")]
    ForeignOwner { task: TaskId, owner: ContextId },

    /// The task has a parent and cannot be relocated
    #[error("{task} has a parent ({parent}) and cannot be relocated")]
    HasParent { task: TaskId, parent: TaskId },

    /// The task is parked on the transport depot, waiting for a worker
    #[error("{task} is in transit on the transport depot and cannot be started")]
    InTransit { task: TaskId },

    #[error(transparent)]
    Context(#[from] ContextError),
}

/// The work a [`Task`] runs
///
/// Implemented for every `FnOnce() -> anyhow::Result<T>`; implement it on your own type
/// to reuse a body with state of its own.
pub trait TaskBody<T>: Send + 'static {
    fn run(self: Box<Self>) -> anyhow::Result<T>;
}

impl<T, F> TaskBody<T> for F
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    fn run(self: Box<Self>) -> anyhow::Result<T> {
        (*self)()
    }
}

struct TaskShared<T> {
    id: TaskId,
    owner: Mutex<Context>,
    parent: Mutex<Option<TaskId>>,
    body: Mutex<Option<Box<dyn TaskBody<T>>>>,
    future: Future<T>,
    events: Signal<TaskEvent<T>>,
}

/// A unit of work whose body and events run on its owning context
///
/// Each task embeds exactly one [`Future`], created with the task and shared with the
/// executor on submission.
///
/// # Example
/// ```
/// use taskdepot::{EventLoop, Task, TaskEvent, ConnectionKind};
///
/// let event_loop = EventLoop::new();
/// let task = Task::new(|| Ok(6 * 7));
/// task.connect(ConnectionKind::Direct, |event: &TaskEvent<i32>| {
///     if let TaskEvent::ResultReady(value) = event {
///         assert_eq!(*value, 42);
///     }
/// });
///
/// task.start().unwrap();
/// event_loop.process_events();
/// assert_eq!(task.result(None).unwrap(), 42);
/// ```
pub struct Task<T> {
    shared: Arc<TaskShared<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.shared.id)
            .field("owner", &lock(&self.shared.owner).id())
            .field("future", &self.shared.future)
            .finish()
    }
}

impl<T: Clone + Send + 'static> Task<T> {
    /// Create a task owned by the calling thread's context
    pub fn new(body: impl TaskBody<T>) -> Self {
        Self {
            shared: Arc::new(TaskShared {
                id: TaskId::next(),
                owner: Mutex::new(Context::current()),
                parent: Mutex::new(None),
                body: Mutex::new(Some(Box::new(body))),
                future: Future::new(),
                events: Signal::new(),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    /// The context the task currently belongs to
    pub fn owner(&self) -> Context {
        lock(&self.shared.owner).clone()
    }

    pub fn parent(&self) -> Option<TaskId> {
        *lock(&self.shared.parent)
    }

    /// The task's embedded future
    pub fn future(&self) -> Future<T> {
        self.shared.future.clone()
    }

    /// Shorthand for `self.future().result(timeout)`
    pub fn result(&self, timeout: Option<Duration>) -> Result<T, FutureError> {
        self.shared.future.result(timeout)
    }

    /// Attach the task to (or detach it from) a parent
    ///
    /// # Errors
    /// [`TaskError::ForeignOwner`] if the calling context does not own the task.
    pub fn set_parent(&self, parent: Option<TaskId>) -> Result<(), TaskError> {
        self.ensure_owned()?;
        *lock(&self.shared.parent) = parent;
        Ok(())
    }

    /// Hand the task over to `target`
    ///
    /// Only the current owner may relocate a task, and a parented task stays with its
    /// parent.
    pub fn move_to(&self, target: &Context) -> Result<(), TaskError> {
        self.ensure_owned()?;
        if let Some(parent) = self.parent() {
            return Err(TaskError::HasParent {
                task: self.id(),
                parent,
            });
        }

        let mut owner = lock(&self.shared.owner);
        tracing::debug!(task = %self.id(), from = %owner.id(), to = %target.id(), "task relocated");
        *owner = target.clone();
        Ok(())
    }

    /// Listen to the task's lifecycle events
    pub fn connect<F>(&self, kind: ConnectionKind, slot: F) -> ConnectionId
    where
        F: Fn(&TaskEvent<T>) + Send + Sync + 'static,
    {
        self.shared.events.connect(kind, slot)
    }

    pub fn disconnect(&self, id: ConnectionId) -> bool {
        self.shared.events.disconnect(id)
    }

    /// Schedule the task to run on its owning context
    ///
    /// Never runs the body inline: an execution request is posted to the owner's queue,
    /// so the body and all events are observed on the owning context even when `start`
    /// is called from another thread. If the task is relocated before the request is
    /// delivered, the request follows it to the new owner.
    ///
    /// # Errors
    /// [`TaskError::InTransit`] while the task is parked on the [`Depot`]; the worker
    /// that takes it over starts it.
    pub fn start(&self) -> Result<(), TaskError> {
        if Depot::is_transport(&self.owner()) {
            return Err(TaskError::InTransit { task: self.id() });
        }
        self.post_execute().map_err(TaskError::from)
    }

    fn post_execute(&self) -> Result<(), ContextError> {
        let task = self.clone();
        self.owner().post(move || task.deliver_execute())
    }

    fn deliver_execute(self) {
        let owner = self.owner();
        if !owner.is_current() {
            if let Err(e) = self.post_execute() {
                tracing::error!(task = %self.id(), "task owner went away before it could run: {e}");
            }
        } else if Depot::is_transport(&owner) {
            // Parked after the request was posted; the receiving worker starts it
            tracing::error!(
                task = %self.id(),
                "start request reached the transport depot, dropping it"
            );
        } else {
            self.execute();
        }
    }

    fn execute(&self) {
        let future = &self.shared.future;
        match future.set_running_or_notify_cancel() {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(task = %self.id(), "task cancelled before it started");
                self.emit(TaskEvent::Cancelled);
                return;
            }
            Err(e) => {
                tracing::error!(task = %self.id(), "exception in task: {e}");
                return;
            }
        }

        self.emit(TaskEvent::Started);

        let body = lock(&self.shared.body).take();
        let outcome = match body {
            Some(body) => match panic::catch_unwind(AssertUnwindSafe(|| body.run())) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(error)) => Err(Failure::new(error)),
                Err(payload) => Err(Failure::from_panic(payload)),
            },
            None => Err(Failure::new(anyhow::anyhow!("task body already consumed"))),
        };

        match outcome {
            Ok(value) => {
                if let Err(e) = future.set_result(value.clone()) {
                    tracing::error!(task = %self.id(), "exception in task: {e}");
                }
                self.emit(TaskEvent::ResultReady(value));
            }
            Err(failure) => {
                tracing::debug!(task = %self.id(), "task failed: {failure}");
                if let Err(e) = future.set_failure(failure.clone()) {
                    tracing::error!(task = %self.id(), "exception in task: {e}");
                }
                self.emit(TaskEvent::ErrorReady(failure));
            }
        }

        self.emit(TaskEvent::Finished);
    }

    fn emit(&self, event: TaskEvent<T>) {
        self.shared.events.emit(&event);
    }

    fn ensure_owned(&self) -> Result<(), TaskError> {
        let owner = self.owner();
        if owner.is_current() {
            Ok(())
        } else {
            Err(TaskError::ForeignOwner {
                task: self.id(),
                owner: owner.id(),
            })
        }
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
