// Worker pool - bounded set of threads running blocking jobs
//
// The pool is a tokio runtime used only for its blocking thread pool: `spawn_blocking`
// runs each job on a dedicated OS thread, at most `max_threads` at a time, and queues
// the rest. Worker threads are reused and retired after an idle keep-alive.

use std::fmt;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Handle, Runtime};

use crate::models::PoolSettings;

static GLOBAL: Mutex<Option<Arc<WorkerPool>>> = Mutex::new(None);

/// Count of jobs accepted but not yet finished
#[derive(Default)]
struct ActiveJobs {
    count: Mutex<usize>,
    idle: Condvar,
}

impl ActiveJobs {
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Decrements the active count when a job ends, runs or not
struct ActiveGuard(Arc<ActiveJobs>);

impl ActiveGuard {
    fn new(active: &Arc<ActiveJobs>) -> Self {
        *active.lock() += 1;
        Self(Arc::clone(active))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut count = self.0.lock();
        *count -= 1;
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

/// Bounded pool of worker threads
///
/// # Example
/// ```
/// use taskdepot::{PoolSettings, WorkerPool};
///
/// let pool = WorkerPool::new(&PoolSettings { max_threads: 2, ..Default::default() }).unwrap();
/// pool.start(|| println!("running on a worker"));
/// assert!(pool.wait_for_done(None));
/// ```
pub struct WorkerPool {
    runtime: Option<Runtime>,
    handle: Handle,
    max_threads: usize,
    active: Arc<ActiveJobs>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_threads", &self.max_threads)
            .field("active", &self.active_count())
            .finish()
    }
}

impl WorkerPool {
    /// Create a pool bounded by `settings.resolved_max_threads()` workers
    pub fn new(settings: &PoolSettings) -> io::Result<Self> {
        let max_threads = settings.resolved_max_threads();

        let mut builder = Builder::new_multi_thread();
        // Jobs only use the blocking threads; one async worker is the runtime's minimum
        builder
            .worker_threads(1)
            .max_blocking_threads(max_threads)
            .thread_name(settings.thread_name.clone())
            .thread_keep_alive(settings.keep_alive());
        if let Some(stack_size) = settings.stack_size {
            builder.thread_stack_size(stack_size);
        }
        let runtime = builder.build()?;

        tracing::info!(
            max_threads,
            thread_name = %settings.thread_name,
            "worker pool initialized"
        );

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            max_threads,
            active: Arc::new(ActiveJobs::default()),
        })
    }

    /// The process-wide shared pool, sized to the available parallelism
    pub fn global() -> io::Result<Arc<WorkerPool>> {
        let mut slot = GLOBAL.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = slot.as_ref() {
            return Ok(Arc::clone(pool));
        }

        let pool = Arc::new(WorkerPool::new(&PoolSettings::default())?);
        *slot = Some(Arc::clone(&pool));
        Ok(pool)
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Number of jobs queued or running
    pub fn active_count(&self) -> usize {
        *self.active.lock()
    }

    /// Queue `job` to run on a worker thread
    pub fn start<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = ActiveGuard::new(&self.active);
        drop(self.handle.spawn_blocking(move || {
            let _guard = guard;
            job();
        }));
    }

    /// Block until every accepted job has finished
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub fn wait_for_done(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut count = self.active.lock();
        while *count > 0 {
            match deadline {
                None => {
                    count = self
                        .active
                        .idle
                        .wait(count)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    count = self
                        .active
                        .idle
                        .wait_timeout(count, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        true
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            // Does not block, so the pool may be dropped from one of its own workers
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn pool(max_threads: usize) -> WorkerPool {
        WorkerPool::new(&PoolSettings {
            max_threads,
            thread_name: "pool-test".to_string(),
            ..PoolSettings::default()
        })
        .unwrap()
    }

    #[test]
    fn test_jobs_run_off_thread() {
        let pool = pool(2);
        let ran_on = Arc::new(Mutex::new(None));

        let r = ran_on.clone();
        pool.start(move || *r.lock().unwrap() = thread::current().name().map(str::to_string));
        assert!(pool.wait_for_done(Some(Duration::from_secs(5))));

        assert_eq!(ran_on.lock().unwrap().as_deref(), Some("pool-test"));
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn test_concurrency_is_bounded() {
        let pool = pool(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let running = running.clone();
            let peak = peak.clone();
            pool.start(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        assert!(pool.wait_for_done(Some(Duration::from_secs(10))));
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_wait_for_done_times_out() {
        let pool = pool(1);
        pool.start(|| thread::sleep(Duration::from_millis(200)));
        assert!(!pool.wait_for_done(Some(Duration::from_millis(10))));
        assert!(pool.wait_for_done(None));
    }

    #[test]
    fn test_global_pool_is_shared() {
        let a = WorkerPool::global().unwrap();
        let b = WorkerPool::global().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.max_threads() >= 1);
    }
}
