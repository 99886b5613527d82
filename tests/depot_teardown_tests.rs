//! Integration tests for the transport depot lifecycle
//!
//! Kept in their own test binary: tearing the depot down affects every task
//! submission in the process.

use std::sync::Arc;
use std::time::Duration;
use taskdepot::{Depot, PoolSettings, Task, ThreadExecutor, WorkerPool};

#[test]
fn test_teardown_and_restart() {
    let pool = WorkerPool::new(&PoolSettings {
        max_threads: 1,
        ..PoolSettings::default()
    })
    .unwrap();
    let executor = ThreadExecutor::with_pool(Arc::new(pool));

    let first = Task::new(|| Ok("first"));
    let future = executor.submit_task(&first).unwrap();
    assert_eq!(future.result(Some(Duration::from_secs(10))).unwrap(), "first");

    let depot = Depot::instance().unwrap();
    let old_context = depot.context().clone();
    drop(depot);
    Depot::teardown();
    assert!(old_context.is_closed());

    // Teardown twice is harmless
    Depot::teardown();

    // The next submission starts a fresh depot
    let second = Task::new(|| Ok("second"));
    let future = executor.submit_task(&second).unwrap();
    assert_eq!(future.result(Some(Duration::from_secs(10))).unwrap(), "second");
    assert_ne!(*Depot::instance().unwrap().context(), old_context);

    executor.shutdown(true);
    Depot::teardown();
}
