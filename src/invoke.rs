// Cross-thread invocation
//
// `Affine<T>` is a sendable handle to a value that lives on, and may only be touched
// from, one thread. `Invoker` posts named method calls to that thread so background
// workers can update thread-confined state (progress bars, views) without sharing it.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::context::{Context, ContextId};

thread_local! {
    /// Values confined to this thread, keyed by handle id
    static REGISTRY: RefCell<HashMap<u64, Rc<dyn Any>>> = RefCell::new(HashMap::new());
}

/// Errors raised when accessing an [`Affine`] value
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AffineError {
    /// Called from a thread other than the owning one
    #[error("value is confined to {0}")]
    Foreign(ContextId),

    /// The owning thread has exited and the value with it
    #[error("value is gone")]
    Gone,

    /// The value is already borrowed further up the stack
    #[error("value is already in use")]
    Busy,
}

struct AffineHandle {
    id: u64,
    context: Context,
}

impl Drop for AffineHandle {
    fn drop(&mut self) {
        let id = self.id;
        if self.context.is_current() {
            unregister(id);
        } else if self.context.post(move || unregister(id)).is_err() {
            tracing::debug!(context = %self.context.id(), "owner of affine value already gone");
        }
    }
}

fn unregister(id: u64) {
    let removed = REGISTRY
        .try_with(|registry| registry.try_borrow_mut().ok().and_then(|mut r| r.remove(&id)))
        .ok()
        .flatten();
    // Dropped outside the registry borrow, since the value's own Drop may touch it
    drop(removed);
}

/// Sendable handle to a value confined to its creating thread
///
/// The value is dropped on its owning thread once every handle is gone.
pub struct Affine<T> {
    handle: Arc<AffineHandle>,
    _value: PhantomData<fn() -> T>,
}

impl<T> Clone for Affine<T> {
    fn clone(&self) -> Self {
        Self {
            handle: Arc::clone(&self.handle),
            _value: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Affine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Affine")
            .field("id", &self.handle.id)
            .field("context", &self.handle.context.id())
            .finish()
    }
}

impl<T: 'static> Affine<T> {
    /// Confine `value` to the calling thread
    pub fn new(value: T) -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        let id = NEXT.fetch_add(1, Ordering::Relaxed);

        let cell: Rc<dyn Any> = Rc::new(RefCell::new(value));
        REGISTRY.with(|registry| registry.borrow_mut().insert(id, cell));

        Self {
            handle: Arc::new(AffineHandle {
                id,
                context: Context::current(),
            }),
            _value: PhantomData,
        }
    }

    /// The owning context
    pub fn context(&self) -> &Context {
        &self.handle.context
    }

    pub fn is_current(&self) -> bool {
        self.handle.context.is_current()
    }

    /// Borrow the value mutably; only possible on the owning thread
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, AffineError> {
        if !self.is_current() {
            return Err(AffineError::Foreign(self.handle.context.id()));
        }

        let cell = REGISTRY
            .with(|registry| registry.borrow().get(&self.handle.id).cloned())
            .ok_or(AffineError::Gone)?;
        let cell = cell
            .downcast::<RefCell<T>>()
            .map_err(|_| AffineError::Gone)?;
        let mut value = cell.try_borrow_mut().map_err(|_| AffineError::Busy)?;
        Ok(f(&mut value))
    }

    /// Queue `f` to run against the value on its owning thread
    ///
    /// Never blocks. The call is dropped with a warning if the owner has gone away.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        let this = self.clone();
        let posted = self.handle.context.post(move || {
            if let Err(e) = this.with(f) {
                tracing::warn!(context = %this.context().id(), "deferred call dropped: {e}");
            }
        });
        if posted.is_err() {
            tracing::warn!(
                context = %self.handle.context.id(),
                "deferred call dropped: owning context closed"
            );
        }
    }
}

type Method<T, A> = Arc<dyn Fn(&mut T, A) + Send + Sync>;

/// Invokes one method of a thread-confined value from any thread
///
/// Built once per (target, method, argument type) and called with concrete arguments;
/// each call posts an asynchronous invocation to the target's owning context.
///
/// # Example
/// ```
/// use taskdepot::{Affine, EventLoop, Invoker};
///
/// let event_loop = EventLoop::new();
/// let progress = Affine::new(0u32);
/// let set_progress = Invoker::new(&progress, "set_progress", |p: &mut u32, v: u32| *p = v);
///
/// std::thread::spawn(move || set_progress.invoke(75)).join().unwrap();
/// event_loop.process_events();
/// assert_eq!(progress.with(|p| *p).unwrap(), 75);
/// ```
pub struct Invoker<T, A> {
    target: Affine<T>,
    name: &'static str,
    method: Method<T, A>,
}

impl<T, A> Clone for Invoker<T, A> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            name: self.name,
            method: Arc::clone(&self.method),
        }
    }
}

impl<T, A> fmt::Debug for Invoker<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invoker")
            .field("target", &self.target)
            .field("name", &self.name)
            .finish()
    }
}

impl<T: 'static, A: Send + 'static> Invoker<T, A> {
    pub fn new<F>(target: &Affine<T>, name: &'static str, method: F) -> Self
    where
        F: Fn(&mut T, A) + Send + Sync + 'static,
    {
        Self {
            target: target.clone(),
            name,
            method: Arc::new(method),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request `method(target, args)` on the target's owning thread
    pub fn invoke(&self, args: A) {
        tracing::trace!(method = self.name, context = %self.target.context().id(), "invoke");
        let method = Arc::clone(&self.method);
        self.target.post(move |target| method(target, args));
    }
}
