//! taskdepot - demo driver for the concurrency runtime
//!
//! # Overview
//!
//! The binary plays the part of a GUI application: the main thread is the owner
//! ("UI") context with its own event loop, and everything slow is pushed to the
//! worker pool. It initializes:
//! - Logging infrastructure (file rotation + console output)
//! - Runtime configuration ([`ConfigManager`], `taskdepot.yaml` + `TASKDEPOT_*`)
//! - The worker pool and a [`ThreadExecutor`] on top of it
//! - A thread-confined progress view updated through an [`Invoker`]
//!
//! # Execution Flow
//!
//! 1. Load configuration from `taskdepot-data/` and set up logging
//! 2. Create the worker pool and executor
//! 3. `map` a batch of plain work items, reporting progress to the owner loop
//! 4. Submit an owned task and watch its future from the owner context
//! 5. Drive the owner loop until both are done
//! 6. Shut down the executor (waiting for outstanding work) and the depot

use anyhow::{Context as _, Result};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use taskdepot::metrics::Metrics;
use taskdepot::{
    APP_NAME, Affine, ConfigManager, ConnectionKind, Depot, EventLoop, FutureWatcher, Invoker,
    Task, TaskEvent, ThreadExecutor, VERSION, WatcherEvent, WorkerPool,
};

/// How long the owner loop waits for the demo work before giving up
const DEMO_TIMEOUT: Duration = Duration::from_secs(30);

/// Thread-confined state standing in for a UI widget
#[derive(Debug, Default)]
struct ProgressView {
    completed: usize,
    total: usize,
    messages: Vec<String>,
}

impl ProgressView {
    fn report(&mut self, message: String) {
        self.completed += 1;
        tracing::info!("[{}/{}] {}", self.completed, self.total, message);
        self.messages.push(message);
    }
}

/// Slow, fallible work: the sum of squares below `n`
fn sum_of_squares(n: u64) -> Result<u64> {
    thread::sleep(Duration::from_millis(20 * (n % 5)));
    (0..n)
        .try_fold(0u64, |acc, i| acc.checked_add(i.checked_mul(i)?))
        .with_context(|| format!("sum of squares below {n} overflows"))
}

fn main() -> Result<()> {
    let config_manager = ConfigManager::new("taskdepot-data")?;
    let config = config_manager.load()?;

    let _log_guard = taskdepot::logging::setup_from_settings(&config.logging)?;
    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    let pool = Arc::new(WorkerPool::new(&config.pool)?);
    let executor = ThreadExecutor::with_pool(pool);

    // The main thread is the owner context
    let event_loop = EventLoop::new();

    let inputs: Vec<u64> = (1..=8).map(|i| i * 1000).collect();
    let view = Affine::new(ProgressView {
        total: inputs.len() + 1,
        ..ProgressView::default()
    });
    let report = Invoker::new(&view, "report", ProgressView::report);

    // Plain work items, results in input order
    let progress = report.clone();
    let sums = executor.map(
        move |n| {
            let sum = sum_of_squares(n)?;
            progress.invoke(format!("sum of squares below {n} = {sum}"));
            Ok(sum)
        },
        inputs,
    )?;

    // An owned task whose events are delivered on the owner context
    let task = Task::new(|| {
        thread::sleep(Duration::from_millis(50));
        Ok(thread::current().name().unwrap_or("unnamed").to_string())
    });
    let progress = report.clone();
    task.connect(
        ConnectionKind::Auto(event_loop.context().clone()),
        move |event: &TaskEvent<String>| match event {
            TaskEvent::ResultReady(worker) => progress.invoke(format!("task ran on {worker}")),
            TaskEvent::ErrorReady(error) => progress.invoke(format!("task failed: {error}")),
            _ => {}
        },
    );

    let future = executor.submit_task(&task)?;
    let watcher = FutureWatcher::new(future);
    watcher.connect(|event| match event {
        WatcherEvent::Started => tracing::info!("task started"),
        WatcherEvent::Finished => tracing::info!("task finished"),
        WatcherEvent::Cancelled => tracing::warn!("task cancelled"),
    });

    let total = view.with(|v| v.total)?;
    let finished = event_loop.run_until(DEMO_TIMEOUT, || {
        watcher.is_done() && view.with(|v| v.completed >= total).unwrap_or(false)
    });
    if !finished {
        tracing::warn!("Demo work did not finish within {:?}", DEMO_TIMEOUT);
    }

    for (index, sum) in sums.enumerate() {
        match sum {
            Ok(sum) => tracing::info!("result {index}: {sum}"),
            Err(e) => tracing::error!("result {index} failed: {e}"),
        }
    }
    tracing::info!("task result: {:?}", watcher.result(Some(Duration::ZERO)));

    executor.shutdown(true);
    Depot::teardown();
    // Progress reports posted after the loop stopped
    event_loop.process_events();

    Metrics::global().log_summary();
    tracing::info!(
        "Application shutdown complete, {} progress messages",
        view.with(|v| v.messages.len())?
    );
    Ok(())
}
