// Signal - thread-aware notification fan-out
//
// A Signal delivers a value to every connected slot. Each connection decides on which
// thread its slot runs: the emitting thread (Direct), a receiver context (Queued), or the
// receiver context but inline when the emitter already runs there (Auto).

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::context::Context;
use crate::future::panic_message;

/// How a connected slot is invoked relative to the emitting thread
#[derive(Clone, Debug)]
pub enum ConnectionKind {
    /// Run on the emitting thread, before `emit` returns
    Direct,
    /// Always post to the receiver context
    Queued(Context),
    /// Run inline if the emitter is on the receiver context, post otherwise
    Auto(Context),
}

/// Handle used to disconnect a slot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

type Slot<A> = Arc<dyn Fn(&A) + Send + Sync>;

struct Connection<A> {
    id: ConnectionId,
    kind: ConnectionKind,
    slot: Slot<A>,
}

/// A list of slots notified with a value of type `A`
pub struct Signal<A> {
    connections: Mutex<Vec<Connection<A>>>,
}

impl<A> Default for Signal<A> {
    fn default() -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
        }
    }
}

impl<A> fmt::Debug for Signal<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("receivers", &self.receiver_count())
            .finish()
    }
}

impl<A> Signal<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receiver_count(&self) -> usize {
        self.lock().len()
    }

    /// Remove a connection; returns whether it existed
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let mut connections = self.lock();
        let before = connections.len();
        connections.retain(|c| c.id != id);
        connections.len() != before
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Connection<A>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<A: Clone + Send + 'static> Signal<A> {
    pub fn connect<F>(&self, kind: ConnectionKind, slot: F) -> ConnectionId
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let id = ConnectionId::next();
        self.lock().push(Connection {
            id,
            kind,
            slot: Arc::new(slot),
        });
        id
    }

    /// Deliver `value` to every slot connected at the time of the call
    ///
    /// Slots run in connection order (queued slots in the order they were posted).
    /// A panicking direct slot is logged and does not stop delivery to the others.
    pub fn emit(&self, value: &A) {
        let targets: Vec<(ConnectionKind, Slot<A>)> = self
            .lock()
            .iter()
            .map(|c| (c.kind.clone(), Arc::clone(&c.slot)))
            .collect();

        for (kind, slot) in targets {
            match kind {
                ConnectionKind::Direct => invoke(&slot, value),
                ConnectionKind::Auto(ref context) if context.is_current() => invoke(&slot, value),
                ConnectionKind::Queued(context) | ConnectionKind::Auto(context) => {
                    let value = value.clone();
                    if context.post(move || invoke(&slot, &value)).is_err() {
                        tracing::debug!(
                            context = %context.id(),
                            "dropping signal for closed receiver context"
                        );
                    }
                }
            }
        }
    }
}

fn invoke<A>(slot: &Slot<A>, value: &A) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| slot(value))) {
        tracing::warn!("signal slot panicked: {}", panic_message(payload.as_ref()));
    }
}
