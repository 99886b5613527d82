// Future watcher - state changes delivered on a chosen context
//
// Bridges a Future's transitions into a context's message queue, so code confined to
// that context (typically a UI loop) is told when the future starts, finishes or is
// cancelled without polling or blocking.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::context::Context;
use crate::future::{Failure, Future, FutureError, FutureState};
use crate::signal::{ConnectionId, ConnectionKind, Signal};

/// Notification emitted by a [`FutureWatcher`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatcherEvent {
    Started,
    Cancelled,
    Finished,
}

impl WatcherEvent {
    fn from_state(state: FutureState) -> Option<Self> {
        match state {
            FutureState::Running => Some(WatcherEvent::Started),
            FutureState::Cancelled => Some(WatcherEvent::Cancelled),
            FutureState::Finished => Some(WatcherEvent::Finished),
            FutureState::Pending => None,
        }
    }
}

/// Observes a [`Future`] on behalf of one context
///
/// Events are emitted on the watcher's context: directly when the transition happens on
/// that context, posted to its queue otherwise. Dropping every handle to the watcher
/// stops delivery.
pub struct FutureWatcher<T> {
    future: Future<T>,
    context: Context,
    events: Arc<Signal<WatcherEvent>>,
}

impl<T> fmt::Debug for FutureWatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureWatcher")
            .field("future", &self.future)
            .field("context", &self.context.id())
            .finish()
    }
}

impl<T: Send + 'static> FutureWatcher<T> {
    /// Watch `future` on the calling thread's context
    pub fn new(future: Future<T>) -> Self {
        Self::with_context(future, Context::current())
    }

    /// Watch `future` on behalf of `context`
    pub fn with_context(future: Future<T>, context: Context) -> Self {
        let events = Arc::new(Signal::new());

        let weak: Weak<Signal<WatcherEvent>> = Arc::downgrade(&events);
        let target = context.clone();
        future.add_state_observer(move |_, state| {
            let Some(event) = WatcherEvent::from_state(state) else {
                return;
            };
            if target.is_current() {
                if let Some(events) = weak.upgrade() {
                    events.emit(&event);
                }
                return;
            }

            let weak = weak.clone();
            let posted = target.post(move || {
                if let Some(events) = weak.upgrade() {
                    events.emit(&event);
                }
            });
            if posted.is_err() {
                tracing::warn!(context = %target.id(), ?event, "watcher context closed");
            }
        });

        Self {
            future,
            context,
            events,
        }
    }

    /// Listen to events; the slot runs on the watcher's context
    pub fn connect<F>(&self, slot: F) -> ConnectionId
    where
        F: Fn(&WatcherEvent) + Send + Sync + 'static,
    {
        self.events.connect(ConnectionKind::Direct, slot)
    }

    pub fn disconnect(&self, id: ConnectionId) -> bool {
        self.events.disconnect(id)
    }
}

impl<T> FutureWatcher<T> {
    pub fn future(&self) -> &Future<T> {
        &self.future
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn is_cancelled(&self) -> bool {
        self.future.cancelled()
    }

    pub fn is_done(&self) -> bool {
        self.future.done()
    }

    pub fn is_running(&self) -> bool {
        self.future.running()
    }

    /// Whether the work has begun (running or finished)
    pub fn is_started(&self) -> bool {
        matches!(
            self.future.state(),
            FutureState::Running | FutureState::Finished
        )
    }

    pub fn exception(&self, timeout: Option<Duration>) -> Result<Option<Failure>, FutureError> {
        self.future.exception(timeout)
    }
}

impl<T: Clone> FutureWatcher<T> {
    pub fn result(&self, timeout: Option<Duration>) -> Result<T, FutureError> {
        self.future.result(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextThread, EventLoop};
    use std::sync::Mutex;
    use std::thread;

    fn record(watcher: &FutureWatcher<u32>) -> Arc<Mutex<Vec<(WatcherEvent, thread::ThreadId)>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        watcher.connect(move |event| l.lock().unwrap().push((*event, thread::current().id())));
        log
    }

    #[test]
    fn test_transitions_on_own_context_are_direct() {
        let _event_loop = EventLoop::new();
        let future = Future::new();
        let watcher = FutureWatcher::new(future.clone());
        let log = record(&watcher);

        future.set_running_or_notify_cancel().unwrap();
        future.set_result(5).unwrap();

        let events: Vec<_> = log.lock().unwrap().iter().map(|(e, _)| *e).collect();
        assert_eq!(events, vec![WatcherEvent::Started, WatcherEvent::Finished]);
        assert!(watcher.is_started());
        assert!(watcher.is_done());
        assert_eq!(watcher.result(None).unwrap(), 5);
    }

    #[test]
    fn test_remote_transitions_are_posted() {
        let event_loop = EventLoop::new();
        let future = Future::new();
        let watcher = FutureWatcher::new(future.clone());
        let log = record(&watcher);

        let worker = ContextThread::spawn("watcher-remote").unwrap();
        let f = future.clone();
        worker
            .context()
            .call_blocking(move || {
                f.set_running_or_notify_cancel().unwrap();
                f.set_exception(anyhow::anyhow!("remote failure")).unwrap();
            })
            .unwrap();
        assert!(log.lock().unwrap().is_empty());

        assert!(event_loop.run_until(Duration::from_secs(1), || log.lock().unwrap().len() == 2));
        let log = log.lock().unwrap();
        assert_eq!(log[0].0, WatcherEvent::Started);
        assert_eq!(log[1].0, WatcherEvent::Finished);
        assert!(log.iter().all(|(_, id)| *id == thread::current().id()));
        assert!(watcher.exception(None).unwrap().is_some());
    }

    #[test]
    fn test_cancel_event() {
        let _event_loop = EventLoop::new();
        let future: Future<u32> = Future::new();
        let watcher = FutureWatcher::new(future.clone());
        let log = record(&watcher);

        assert!(future.cancel());
        assert_eq!(log.lock().unwrap()[0].0, WatcherEvent::Cancelled);
        assert!(watcher.is_cancelled());
        assert!(!watcher.is_started());
        assert!(matches!(watcher.result(None), Err(FutureError::Cancelled)));
    }

    #[test]
    fn test_dropped_watcher_stops_delivery() {
        let event_loop = EventLoop::new();
        let future: Future<u32> = Future::new();
        let watcher = FutureWatcher::new(future.clone());
        let log = record(&watcher);
        drop(watcher);

        future.cancel();
        event_loop.process_events();
        assert!(log.lock().unwrap().is_empty());
    }
}
