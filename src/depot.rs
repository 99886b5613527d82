// Depot - process-wide transport context for relocating tasks
//
// Submitting a task parks it on the depot thread. A pool worker then asks the depot,
// with a blocking round trip, to hand the task over to the worker's own context. The
// depot is the only party that may do so because it is the task's owner at that time.

use std::sync::{Arc, Mutex, PoisonError};

use crate::context::{Context, ContextError, ContextThread};
use crate::metrics::Metrics;
use crate::task::{Task, TaskError};

/// Name of the depot's thread
pub const DEPOT_THREAD_NAME: &str = "taskdepot-transport";

static INSTANCE: Mutex<Option<Arc<Depot>>> = Mutex::new(None);

/// Singleton transport context used to move tasks into pool threads
pub struct Depot {
    thread: ContextThread,
}

impl Depot {
    /// The process-wide depot, started on first use
    ///
    /// Construction is serialized by a single mutex. After [`teardown`](Self::teardown)
    /// the next call starts a fresh depot.
    pub fn instance() -> Result<Arc<Depot>, ContextError> {
        let mut slot = INSTANCE.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(depot) = slot.as_ref().filter(|d| !d.context().is_closed()) {
            return Ok(Arc::clone(depot));
        }

        let depot = Arc::new(Depot {
            thread: ContextThread::spawn(DEPOT_THREAD_NAME)?,
        });
        tracing::info!(context = %depot.context().id(), "transport depot started");
        *slot = Some(Arc::clone(&depot));
        Ok(depot)
    }

    /// Stop the depot thread, if one is running
    ///
    /// Meant for process exit. Transfers still in flight fail with a closed context.
    pub fn teardown() {
        let depot = INSTANCE
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(depot) = depot {
            depot.thread.join();
            tracing::info!("transport depot stopped");
        }
    }

    pub fn context(&self) -> &Context {
        self.thread.context()
    }

    /// Whether `context` belongs to the running depot
    ///
    /// Tasks owned by that context are parked, and must not run there.
    pub fn is_transport(context: &Context) -> bool {
        INSTANCE
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|depot| depot.context() == context)
    }

    /// Move `task` from the depot to `target`, waiting until the move is confirmed
    ///
    /// # Errors
    /// - [`TaskError::ForeignOwner`] if the task is not parked on the depot
    /// - [`TaskError::Context`] if the depot has been torn down
    pub fn transfer<T>(&self, task: &Task<T>, target: &Context) -> Result<(), TaskError>
    where
        T: Clone + Send + 'static,
    {
        let task = task.clone();
        let target = target.clone();
        self.context()
            .call_blocking(move || task.move_to(&target))??;

        Metrics::global().record_task_transfer();
        Ok(())
    }
}
