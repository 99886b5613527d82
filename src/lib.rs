// taskdepot - Thread-affine futures, tasks and a worker-pool executor
//
// This is the library crate containing the concurrency runtime used by GUI widgets:
// result cells, owner-confined tasks, the worker-pool executor and the helpers that
// marshal work back onto a thread's event loop.
// The binary crate (main.rs) provides a small demo driver.

pub mod config;
pub mod context;
pub mod depot;
pub mod executor;
pub mod future;
pub mod invoke;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod pool;
pub mod signal;
pub mod task;
pub mod watcher;

// Re-export commonly used types for convenience
pub use config::ConfigManager;
pub use context::{Context, ContextError, ContextThread, EventLoop};
pub use depot::Depot;
pub use executor::{ExecutorError, MapResults, ThreadExecutor, WorkItem};
pub use future::{Failure, Future, FutureError, FutureState, StateError, futures_iter};
pub use invoke::{Affine, AffineError, Invoker};
pub use models::{LoggingSettings, PoolSettings, RuntimeConfig};
pub use pool::WorkerPool;
pub use signal::{ConnectionId, ConnectionKind, Signal};
pub use task::{Task, TaskBody, TaskError, TaskEvent};
pub use watcher::{FutureWatcher, WatcherEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
