// Result cell module
//
// This module provides Future, a thread-safe single-assignment container holding the
// eventual outcome (value, failure or cancellation) of an asynchronous computation.
// Workers complete it, any thread may observe it, block on it or cancel it.

use std::any::Any;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

use crate::metrics::Metrics;

/// Lifecycle state of a [`Future`]
///
/// Transitions are monotonic: `Pending -> Running -> Finished` or `Pending -> Cancelled`.
/// `Cancelled` and `Finished` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FutureState {
    Pending,
    Cancelled,
    Running,
    Finished,
}

impl FutureState {
    /// Whether no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(self, FutureState::Cancelled | FutureState::Finished)
    }
}

/// Process-unique identity of a [`Future`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FutureId(u64);

impl FutureId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FutureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "future#{}", self.0)
    }
}

/// The error a computation failed with
///
/// Wraps the work body's `anyhow::Error` in an `Arc` so the same failure can be
/// handed to every observer. Use [`downcast_ref`](Self::downcast_ref) to recover
/// the concrete error type.
#[derive(Clone)]
pub struct Failure(Arc<anyhow::Error>);

impl Failure {
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(error.into()))
    }

    /// Convert a caught panic payload into a failure carrying a [`PanicError`]
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::new(PanicError {
            message: panic_message(payload.as_ref()),
        })
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// Whether the failure holds an error of type `E`
    pub fn is<E>(&self) -> bool
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.is::<E>()
    }

    pub fn error(&self) -> &anyhow::Error {
        &self.0
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

/// A work body panicked instead of returning
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("work body panicked: {message}")]
pub struct PanicError {
    pub message: String,
}

/// Errors raised when observing a [`Future`]
#[derive(Error, Debug, Clone)]
pub enum FutureError {
    /// The deadline elapsed before the future reached a terminal state
    #[error("timed out waiting for the future")]
    Timeout,

    /// The future was cancelled instead of finishing
    #[error("the future was cancelled")]
    Cancelled,

    /// The computation itself failed
    #[error("{0}")]
    Failed(Failure),
}

impl FutureError {
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            FutureError::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// A state transition that the lifecycle does not allow
///
/// This is a usage bug (e.g. running the same future twice), not a runtime condition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{future}: invalid transition from {from:?} to {to:?}")]
pub struct StateError {
    pub future: FutureId,
    pub from: FutureState,
    pub to: FutureState,
}

type DoneCallback<T> = Box<dyn FnOnce(&Future<T>) + Send>;
type StateObserver<T> = Arc<dyn Fn(&Future<T>, FutureState) + Send + Sync>;

/// Where the computation is, with the outcome attached once finished
enum Stage<T> {
    Pending,
    Running,
    Cancelled,
    Finished(Result<T, Failure>),
}

impl<T> Stage<T> {
    fn state(&self) -> FutureState {
        match self {
            Stage::Pending => FutureState::Pending,
            Stage::Running => FutureState::Running,
            Stage::Cancelled => FutureState::Cancelled,
            Stage::Finished(_) => FutureState::Finished,
        }
    }
}

struct Inner<T> {
    stage: Stage<T>,
    callbacks: Vec<DoneCallback<T>>,
    observers: Vec<StateObserver<T>>,
}

struct Shared<T> {
    id: FutureId,
    inner: Mutex<Inner<T>>,
    condvar: Condvar,
}

/// Thread-safe result cell for an asynchronous computation
///
/// Cloning a `Future` yields another handle to the same cell; the cell lives as long as
/// its longest-lived holder (typically the submitter and the executing worker).
///
/// # Locking
///
/// One mutex plus condition variable guards the stage and its payload. State-change
/// observers and done callbacks are always invoked after that lock is released, so they
/// may freely query the future. Observers run before callbacks on the same transition.
///
/// # Example
/// ```
/// use taskdepot::Future;
///
/// let future = Future::new();
/// assert!(future.set_running_or_notify_cancel().unwrap());
/// future.set_result(42).unwrap();
/// assert_eq!(future.result(None).unwrap(), 42);
/// ```
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> PartialEq for Future<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<T> Eq for Future<T> {}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl<T> Default for Future<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Future<T> {
    /// Create a new pending future
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                id: FutureId::next(),
                inner: Mutex::new(Inner {
                    stage: Stage::Pending,
                    callbacks: Vec::new(),
                    observers: Vec::new(),
                }),
                condvar: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> FutureId {
        self.shared.id
    }

    pub fn state(&self) -> FutureState {
        self.lock().stage.state()
    }

    /// Whether the future was successfully cancelled
    pub fn cancelled(&self) -> bool {
        self.state() == FutureState::Cancelled
    }

    /// Whether the future was cancelled or finished running
    pub fn done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Whether the computation is currently being executed
    pub fn running(&self) -> bool {
        self.state() == FutureState::Running
    }

    /// Attempt to cancel the computation
    ///
    /// Returns `false` if the computation is already running or finished, `true` if it
    /// is (now) cancelled. On a successful transition, observers and done callbacks run
    /// synchronously on the calling thread.
    pub fn cancel(&self) -> bool {
        let (observers, callbacks) = {
            let mut inner = self.lock();
            match inner.stage {
                Stage::Running | Stage::Finished(_) => return false,
                Stage::Cancelled => return true,
                Stage::Pending => {}
            }
            inner.stage = Stage::Cancelled;
            self.shared.condvar.notify_all();
            (inner.observers.clone(), mem::take(&mut inner.callbacks))
        };

        tracing::debug!(future = %self.id(), "future cancelled");
        self.notify_observers(&observers, FutureState::Cancelled);
        self.invoke_callbacks(callbacks);
        true
    }

    /// Mark the future as running, unless it was cancelled
    ///
    /// Called by the executing worker immediately before running the work body.
    /// Returns `Ok(false)` if the future was cancelled (the caller must not run the
    /// work), `Ok(true)` after moving `Pending -> Running`.
    ///
    /// # Errors
    /// [`StateError`] if the future is already running or finished.
    pub fn set_running_or_notify_cancel(&self) -> Result<bool, StateError> {
        let observers = {
            let mut inner = self.lock();
            match inner.stage {
                Stage::Cancelled => return Ok(false),
                Stage::Pending => {}
                ref other => {
                    return Err(StateError {
                        future: self.id(),
                        from: other.state(),
                        to: FutureState::Running,
                    });
                }
            }
            inner.stage = Stage::Running;
            inner.observers.clone()
        };

        self.notify_observers(&observers, FutureState::Running);
        Ok(true)
    }

    /// Store the value of a successful computation
    ///
    /// # Errors
    /// [`StateError`] if the future is already cancelled or finished.
    pub fn set_result(&self, value: T) -> Result<(), StateError> {
        self.finish(Ok(value))
    }

    /// Store the error of a failed computation
    ///
    /// # Errors
    /// [`StateError`] if the future is already cancelled or finished.
    pub fn set_exception(&self, error: impl Into<anyhow::Error>) -> Result<(), StateError> {
        self.finish(Err(Failure::new(error)))
    }

    /// Store an already shared failure
    pub fn set_failure(&self, failure: Failure) -> Result<(), StateError> {
        self.finish(Err(failure))
    }

    fn finish(&self, outcome: Result<T, Failure>) -> Result<(), StateError> {
        let (observers, callbacks) = {
            let mut inner = self.lock();
            match inner.stage {
                Stage::Pending | Stage::Running => {}
                ref other => {
                    return Err(StateError {
                        future: self.id(),
                        from: other.state(),
                        to: FutureState::Finished,
                    });
                }
            }
            inner.stage = Stage::Finished(outcome);
            self.shared.condvar.notify_all();
            (inner.observers.clone(), mem::take(&mut inner.callbacks))
        };

        tracing::debug!(future = %self.id(), "future finished");
        self.notify_observers(&observers, FutureState::Finished);
        self.invoke_callbacks(callbacks);
        Ok(())
    }

    /// Block until the future reaches a terminal state
    ///
    /// `None` waits indefinitely. Returns `true` if the future is done.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.wait_terminal(timeout).stage.state().is_terminal()
    }

    /// Return the failure (if any) of the computation
    ///
    /// Blocks like [`result`](Self::result), but yields the stored error instead of
    /// raising it. `Ok(None)` means the computation succeeded.
    ///
    /// # Errors
    /// [`FutureError::Cancelled`] or [`FutureError::Timeout`].
    pub fn exception(&self, timeout: Option<Duration>) -> Result<Option<Failure>, FutureError> {
        let inner = self.wait_terminal(timeout);
        match &inner.stage {
            Stage::Finished(Ok(_)) => Ok(None),
            Stage::Finished(Err(failure)) => Ok(Some(failure.clone())),
            Stage::Cancelled => Err(FutureError::Cancelled),
            Stage::Pending | Stage::Running => Err(FutureError::Timeout),
        }
    }

    /// Register a callback invoked with this future once it is done
    ///
    /// If the future is already done, the callback runs immediately on the calling
    /// thread, before this method returns. Otherwise it runs on whichever thread
    /// completes or cancels the future. Callbacks run once each, in registration order.
    /// A panicking callback is logged and does not affect the future or other callbacks.
    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Future<T>) + Send + 'static,
    {
        {
            let mut inner = self.lock();
            if !inner.stage.state().is_terminal() {
                inner.callbacks.push(Box::new(callback));
                return;
            }
        }
        self.invoke_callbacks(vec![Box::new(callback)]);
    }

    /// Register an observer called on every subsequent state transition
    ///
    /// Observers run on the thread performing the transition, outside the lock and
    /// before any done callbacks of the same transition.
    pub fn add_state_observer<F>(&self, observer: F)
    where
        F: Fn(&Future<T>, FutureState) + Send + Sync + 'static,
    {
        self.lock().observers.push(Arc::new(observer));
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_terminal(&self, timeout: Option<Duration>) -> MutexGuard<'_, Inner<T>> {
        let guard = self.lock();
        let condvar = &self.shared.condvar;
        let pending = |inner: &mut Inner<T>| !inner.stage.state().is_terminal();
        match timeout {
            None => condvar
                .wait_while(guard, pending)
                .unwrap_or_else(PoisonError::into_inner),
            Some(timeout) => {
                condvar
                    .wait_timeout_while(guard, timeout, pending)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
        }
    }

    fn notify_observers(&self, observers: &[StateObserver<T>], state: FutureState) {
        for observer in observers {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| observer(self, state))) {
                Metrics::global().record_callback_failure();
                tracing::warn!(
                    future = %self.id(),
                    "state observer panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    fn invoke_callbacks(&self, callbacks: Vec<DoneCallback<T>>) {
        for callback in callbacks {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(self))) {
                Metrics::global().record_callback_failure();
                tracing::warn!(
                    future = %self.id(),
                    "done callback panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }
}

impl<T: Clone> Future<T> {
    /// Return the value of the computation
    ///
    /// Blocks until the future is done or `timeout` elapses (`None` blocks indefinitely).
    ///
    /// # Errors
    /// - [`FutureError::Failed`] with the computation's own error
    /// - [`FutureError::Cancelled`] if the future was cancelled
    /// - [`FutureError::Timeout`] if the deadline elapsed first
    pub fn result(&self, timeout: Option<Duration>) -> Result<T, FutureError> {
        let inner = self.wait_terminal(timeout);
        match &inner.stage {
            Stage::Finished(Ok(value)) => Ok(value.clone()),
            Stage::Finished(Err(failure)) => Err(FutureError::Failed(failure.clone())),
            Stage::Cancelled => Err(FutureError::Cancelled),
            Stage::Pending | Stage::Running => Err(FutureError::Timeout),
        }
    }
}

/// Lazily yield the result of each future, in order
///
/// Consuming the iterator blocks on each future in turn.
pub fn futures_iter<T, I>(futures: I) -> impl Iterator<Item = Result<T, FutureError>>
where
    T: Clone,
    I: IntoIterator<Item = Future<T>>,
{
    futures.into_iter().map(|future| future.result(None))
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
