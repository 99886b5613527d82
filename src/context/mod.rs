// Execution context module
//
// Every thread that takes part in the runtime owns a FIFO message queue. A `Context` is
// the cross-thread handle to that queue: any thread can post a closure to it, and only
// the owning thread drains it (through an `EventLoop`). This is the single-threaded
// affinity rule of GUI event loops, expressed with tokio mpsc channels.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// A deferred call queued onto a context
type Job = Box<dyn FnOnce() + Send>;

/// Interval at which [`EventLoop::run_until`] re-checks its condition while idle
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Process-unique identity of a [`Context`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "context#{}", self.0)
    }
}

/// Errors that can occur when talking to a context
#[derive(Error, Debug)]
pub enum ContextError {
    /// The owning thread has exited; nothing will ever drain the queue
    #[error("{0} is closed")]
    Closed(ContextId),

    /// A blocking call from the owning thread into its own queue can never complete
    #[error("blocking call into {0} from its own thread would deadlock")]
    WouldDeadlock(ContextId),

    #[error("failed to spawn context thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Cross-thread handle to a thread's message queue
///
/// `Context` is cheap to clone and can be sent anywhere. Closures posted to it run on
/// the owning thread, in FIFO order, whenever that thread drains its queue.
#[derive(Clone)]
pub struct Context {
    id: ContextId,
    name: Option<Arc<str>>,
    tx: mpsc::UnboundedSender<Job>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Context {}

/// The calling thread's end of its queue
struct LocalQueue {
    context: Context,
    /// Taken out while a loop is blocked on it, so running jobs may nest loops
    rx: Option<mpsc::UnboundedReceiver<Job>>,
}

thread_local! {
    static LOCAL: RefCell<Option<LocalQueue>> = const { RefCell::new(None) };
}

impl Context {
    /// The context of the calling thread, created on first use
    pub fn current() -> Context {
        LOCAL.with(|cell| {
            let mut slot = cell.borrow_mut();
            slot.get_or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let context = Context {
                    id: ContextId::next(),
                    name: thread::current().name().map(Arc::from),
                    tx,
                };
                tracing::debug!(context = %context.id, name = ?context.name, "context created");
                LocalQueue {
                    context,
                    rx: Some(rx),
                }
            })
            .context
            .clone()
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Name of the owning thread, if it had one
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether the calling thread owns this context
    pub fn is_current(&self) -> bool {
        LOCAL
            .try_with(|cell| {
                cell.try_borrow()
                    .ok()
                    .and_then(|slot| slot.as_ref().map(|queue| queue.context.id == self.id))
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// Whether the owning thread has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue `job` to run on the owning thread
    ///
    /// Never blocks and never runs `job` inline, even when called from the owning thread.
    pub fn post<F>(&self, job: F) -> Result<(), ContextError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(Box::new(job))
            .map_err(|_| ContextError::Closed(self.id))
    }

    /// Run `job` on the owning thread and wait for its return value
    ///
    /// This is a blocking request/response round trip; the caller is suspended until the
    /// owning thread has drained the request.
    ///
    /// # Errors
    /// - [`ContextError::WouldDeadlock`] when called from the owning thread
    /// - [`ContextError::Closed`] if the owning thread exits before answering
    pub fn call_blocking<F, R>(&self, job: F) -> Result<R, ContextError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Err(ContextError::WouldDeadlock(self.id));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.post(move || {
            let _ = reply_tx.send(job());
        })?;

        reply_rx
            .blocking_recv()
            .map_err(|_| ContextError::Closed(self.id))
    }
}

/// Run `f` with the calling thread's receiver checked out of the thread-local slot
fn with_receiver<R>(f: impl FnOnce(&mut mpsc::UnboundedReceiver<Job>) -> R) -> Option<R> {
    // Make sure the queue exists
    Context::current();

    let mut rx = LOCAL.with(|cell| cell.borrow_mut().as_mut().and_then(|q| q.rx.take()))?;
    let out = f(&mut rx);
    LOCAL.with(|cell| {
        if let Some(queue) = cell.borrow_mut().as_mut() {
            queue.rx = Some(rx);
        }
    });
    Some(out)
}

fn try_next_job() -> Option<Job> {
    with_receiver(|rx| rx.try_recv().ok()).flatten()
}

/// Message loop over the calling thread's context
///
/// An `EventLoop` is confined to the thread that created it. It only runs deferred calls
/// it explicitly dequeues: [`process_events`](Self::process_events) drains what is
/// pending, [`exec`](Self::exec) blocks and dispatches until [`quit`](LoopQuitter::quit).
pub struct EventLoop {
    context: Context,
    quit: Arc<AtomicBool>,
    _not_send: PhantomData<Rc<()>>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            context: Context::current(),
            quit: Arc::new(AtomicBool::new(false)),
            _not_send: PhantomData,
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Handle that stops [`exec`](Self::exec) from any thread
    pub fn quitter(&self) -> LoopQuitter {
        LoopQuitter {
            context: self.context.clone(),
            quit: Arc::clone(&self.quit),
        }
    }

    pub fn quit(&self) {
        self.quitter().quit();
    }

    /// Run every pending deferred call, without blocking
    ///
    /// Returns the number of calls dispatched.
    pub fn process_events(&self) -> usize {
        let mut dispatched = 0;
        while let Some(job) = try_next_job() {
            job();
            dispatched += 1;
        }
        dispatched
    }

    /// Block and dispatch deferred calls until the loop is quit
    ///
    /// A quit requested before `exec` is entered makes it return immediately.
    /// Returns the number of calls dispatched.
    pub fn exec(&self) -> usize {
        let mut dispatched = 0;
        while !self.quit.load(Ordering::Acquire) {
            match with_receiver(|rx| rx.blocking_recv()).flatten() {
                Some(job) => {
                    job();
                    dispatched += 1;
                }
                None => break,
            }
        }
        self.quit.store(false, Ordering::Release);
        dispatched
    }

    /// Dispatch deferred calls until `condition` holds or `timeout` elapses
    ///
    /// Returns whether the condition was met.
    pub fn run_until(&self, timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.process_events();
            if condition() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(IDLE_POLL_INTERVAL);
        }
    }
}

/// Cloneable, thread-safe handle that stops an [`EventLoop`]
#[derive(Clone, Debug)]
pub struct LoopQuitter {
    context: Context,
    quit: Arc<AtomicBool>,
}

impl LoopQuitter {
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        // Wake a loop blocked on an empty queue
        if self.context.post(|| {}).is_err() {
            tracing::debug!(context = %self.context.id(), "quit requested on closed context");
        }
    }
}

/// A dedicated thread running an [`EventLoop`] until quit
///
/// Dropping the handle quits the loop and joins the thread.
pub struct ContextThread {
    context: Context,
    quitter: LoopQuitter,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ContextThread {
    /// Spawn a named thread and wait until its context is ready
    pub fn spawn(name: &str) -> Result<Self, ContextError> {
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            let event_loop = EventLoop::new();
            let _ = ready_tx.send((event_loop.context().clone(), event_loop.quitter()));

            tracing::debug!(context = %event_loop.context().id(), "context thread started");
            let dispatched = event_loop.exec();
            tracing::debug!(
                context = %event_loop.context().id(),
                dispatched,
                "context thread terminated"
            );
        })?;

        let (context, quitter) = ready_rx.blocking_recv().map_err(|_| {
            std::io::Error::other("context thread exited before becoming ready")
        })?;

        Ok(Self {
            context,
            quitter,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Ask the thread's loop to stop after the current call
    pub fn quit(&self) {
        self.quitter.quit();
    }

    /// Quit and wait for the thread to exit
    ///
    /// Calling this from the context thread itself only requests the quit.
    pub fn join(&self) {
        self.quit();
        if self.context.is_current() {
            return;
        }

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!(context = %self.context.id(), "context thread panicked");
            }
        }
    }
}

impl Drop for ContextThread {
    fn drop(&mut self) {
        self.join();
    }
}
