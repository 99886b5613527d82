//! Integration tests for ThreadExecutor
//!
//! These tests verify:
//! - Plain work items: values, computation errors, panics
//! - `map` ordering independent of completion order
//! - Owned task submission, ownership preconditions and event delivery
//! - Graceful shutdown draining outstanding work

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use taskdepot::{
    Affine, ConnectionKind, ContextThread, EventLoop, ExecutorError, FutureError, FutureWatcher,
    Invoker, PoolSettings, Task, TaskError, TaskEvent, ThreadExecutor, WatcherEvent, WorkerPool,
};
use thiserror::Error;

const TIMEOUT: Duration = Duration::from_secs(10);

fn create_test_executor(max_threads: usize) -> ThreadExecutor {
    let pool = WorkerPool::new(&PoolSettings {
        max_threads,
        thread_name: "executor-test".to_string(),
        ..PoolSettings::default()
    })
    .unwrap();
    ThreadExecutor::with_pool(Arc::new(pool))
}

/// `base^exp` as little-endian decimal digits
fn pow_digits(base: u32, exp: u32) -> Vec<u8> {
    let mut digits = vec![1u8];
    for _ in 0..exp {
        let mut carry = 0u32;
        for digit in digits.iter_mut() {
            let value = u32::from(*digit) * base + carry;
            *digit = (value % 10) as u8;
            carry = value / 10;
        }
        while carry > 0 {
            digits.push((carry % 10) as u8);
            carry /= 10;
        }
    }
    digits
}

fn digits_to_string(digits: &[u8]) -> String {
    digits.iter().rev().map(|d| char::from(b'0' + d)).collect()
}

#[derive(Error, Debug)]
#[error("division by zero")]
struct ZeroDivisionError;

fn divide(a: i64, b: i64) -> anyhow::Result<i64> {
    if b == 0 {
        return Err(ZeroDivisionError.into());
    }
    Ok(a / b)
}

#[test]
fn test_submit_big_power() {
    let executor = create_test_executor(2);
    let future = executor
        .submit(|| Ok(digits_to_string(&pow_digits(100, 100))))
        .unwrap();

    let value = future.result(Some(TIMEOUT)).unwrap();
    assert_eq!(value, format!("1{}", "0".repeat(200)));
    assert!(future.done());
    assert!(!future.cancelled());
}

#[test]
fn test_submit_error_is_reraised() {
    let executor = create_test_executor(2);
    let future = executor.submit(|| divide(1, 0)).unwrap();

    match future.result(Some(TIMEOUT)) {
        Err(FutureError::Failed(failure)) => {
            assert!(failure.downcast_ref::<ZeroDivisionError>().is_some());
        }
        other => panic!("expected a computation error, got {other:?}"),
    }

    let exception = future.exception(Some(TIMEOUT)).unwrap().unwrap();
    assert!(exception.is::<ZeroDivisionError>());
    assert_eq!(exception.to_string(), "division by zero");
}

#[test]
fn test_successful_future_has_no_exception() {
    let executor = create_test_executor(1);
    let future = executor.submit(|| divide(10, 2)).unwrap();
    assert!(future.exception(Some(TIMEOUT)).unwrap().is_none());
    assert_eq!(future.result(None).unwrap(), 5);
}

#[test]
fn test_map_order_independent_of_completion() {
    let executor = create_test_executor(4);
    let xs = vec![1u64, 2, 3, 4, 5, 6];
    let ys = vec![10u64, 20, 30, 40, 50, 60];
    let completed = Arc::new(Mutex::new(Vec::new()));

    let c = completed.clone();
    let results = executor
        .map(
            move |(x, y): (u64, u64)| {
                // Later inputs finish first
                thread::sleep(Duration::from_millis(10 * (7 - x)));
                c.lock().unwrap().push(x);
                Ok(x * y)
            },
            xs.into_iter().zip(ys),
        )
        .unwrap();
    assert_eq!(results.len(), 6);

    let values: Vec<u64> = results.map(Result::unwrap).collect();
    assert_eq!(values, vec![10, 40, 90, 160, 250, 360]);

    let completed = completed.lock().unwrap();
    assert_eq!(completed.len(), 6);
    assert_ne!(*completed, vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn test_map_surfaces_individual_failures() {
    let executor = create_test_executor(2);
    let results: Vec<_> = executor
        .map(|d: i64| divide(12, d), vec![3, 0, 4])
        .unwrap()
        .collect();

    assert_eq!(results[0].as_ref().unwrap(), &4);
    assert!(matches!(results[1], Err(FutureError::Failed(_))));
    assert_eq!(results[2].as_ref().unwrap(), &3);
}

#[test]
fn test_shutdown_waits_for_outstanding() {
    let executor = create_test_executor(2);
    let finished = Arc::new(AtomicUsize::new(0));

    let futures: Vec<_> = (0..6)
        .map(|_| {
            let finished = finished.clone();
            executor
                .submit(move || {
                    thread::sleep(Duration::from_millis(30));
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap()
        })
        .collect();

    executor.shutdown(true);

    assert_eq!(finished.load(Ordering::SeqCst), 6);
    assert!(futures.iter().all(|f| f.done()));
    assert!(matches!(
        executor.submit(|| Ok(())),
        Err(ExecutorError::ShuttingDown)
    ));
}

#[test]
fn test_shutdown_waits_for_outstanding_tasks() {
    let executor = create_test_executor(2);
    let finished = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..5u64)
        .map(|i| {
            let finished = finished.clone();
            Task::new(move || {
                thread::sleep(Duration::from_millis(20));
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(i * i)
            })
        })
        .collect();
    let futures: Vec<_> = tasks
        .iter()
        .map(|task| executor.submit_task(task).unwrap())
        .collect();

    executor.shutdown(true);

    assert_eq!(finished.load(Ordering::SeqCst), 5);
    assert!(futures.iter().all(|f| f.done()));
    let values: Vec<u64> = futures.iter().map(|f| f.result(None).unwrap()).collect();
    assert_eq!(values, vec![0, 1, 4, 9, 16]);
    assert!(matches!(
        executor.submit_task(&Task::new(|| Ok(0u64))),
        Err(ExecutorError::ShuttingDown)
    ));
}

#[test]
fn test_start_while_parked_does_not_stall_worker() {
    let executor = create_test_executor(1);
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let blocker = executor
        .submit(move || {
            release_rx.recv().ok();
            Ok(())
        })
        .unwrap();

    let task = Task::new(|| Ok(thread::current().name().map(str::to_string)));
    let future = executor.submit_task(&task).unwrap();

    // Parked on the depot: only the receiving worker may start it
    assert!(matches!(task.start(), Err(TaskError::InTransit { .. })));

    release_tx.send(()).unwrap();
    blocker.result(Some(TIMEOUT)).unwrap();

    let ran_on = future.result(Some(TIMEOUT)).unwrap();
    assert_eq!(ran_on.as_deref(), Some("executor-test"));

    let next = executor.submit(|| Ok(7)).unwrap();
    assert_eq!(next.result(Some(TIMEOUT)).unwrap(), 7);
    assert!(executor.pool().wait_for_done(Some(TIMEOUT)));
    assert_eq!(executor.pool().active_count(), 0);
}

#[test]
fn test_shutdown_tolerates_cancelled_work() {
    let executor = create_test_executor(1);
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

    let blocker = executor
        .submit(move || {
            release_rx.recv().ok();
            Ok(1)
        })
        .unwrap();
    let queued = executor.submit(|| Ok(2)).unwrap();
    let failing = executor.submit(|| divide(1, 0)).unwrap();
    assert!(queued.cancel());

    release_tx.send(()).unwrap();
    executor.shutdown(true);

    assert_eq!(blocker.result(None).unwrap(), 1);
    assert!(queued.cancelled());
    assert!(failing.exception(None).unwrap().is_some());
}

#[test]
fn test_submit_task_from_non_owner_is_rejected() {
    let executor = create_test_executor(1);
    let owner = ContextThread::spawn("task-owner").unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    let r = ran.clone();
    let task = Task::new(move || {
        r.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    task.move_to(owner.context()).unwrap();

    let err = executor.submit_task(&task).unwrap_err();
    assert!(matches!(
        err,
        ExecutorError::Task(TaskError::ForeignOwner { .. })
    ));

    // Nothing was scheduled
    assert!(executor.pool().wait_for_done(Some(TIMEOUT)));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(task.owner(), *owner.context());
}

#[test]
fn test_submit_parented_task_is_rejected() {
    let executor = create_test_executor(1);
    let parent = Task::new(|| Ok(()));
    let child = Task::new(|| Ok(()));
    child.set_parent(Some(parent.id())).unwrap();

    let err = executor.submit_task(&child).unwrap_err();
    assert!(matches!(err, ExecutorError::Task(TaskError::HasParent { .. })));
    assert!(child.owner().is_current());
    assert_eq!(executor.outstanding_count(), 0);
}

#[test]
fn test_task_events_arrive_on_owner_context() {
    let event_loop = EventLoop::new();
    let executor = create_test_executor(2);
    let events = Arc::new(Mutex::new(Vec::new()));

    let task = Task::new(|| Ok(thread::current().id()));
    let e = events.clone();
    task.connect(
        ConnectionKind::Auto(event_loop.context().clone()),
        move |event: &TaskEvent<thread::ThreadId>| {
            let name = match event {
                TaskEvent::Started => "started",
                TaskEvent::ResultReady(_) => "result",
                TaskEvent::ErrorReady(_) => "error",
                TaskEvent::Finished => "finished",
                TaskEvent::Cancelled => "cancelled",
            };
            e.lock().unwrap().push((name, thread::current().id()));
        },
    );

    let future = executor.submit_task(&task).unwrap();
    let worker = future.result(Some(TIMEOUT)).unwrap();
    assert_ne!(worker, thread::current().id());

    assert!(event_loop.run_until(TIMEOUT, || events.lock().unwrap().len() == 3));
    let events = events.lock().unwrap();
    let names: Vec<_> = events.iter().map(|(n, _)| *n).collect();
    assert_eq!(names, vec!["started", "result", "finished"]);
    assert!(events.iter().all(|(_, id)| *id == thread::current().id()));
}

#[test]
fn test_task_cancelled_before_dispatch() {
    let executor = create_test_executor(1);
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let blocker = executor
        .submit(move || {
            release_rx.recv().ok();
            Ok(())
        })
        .unwrap();

    let cancelled = Arc::new(AtomicUsize::new(0));
    let task = Task::new(|| Ok(()));
    let c = cancelled.clone();
    task.connect(ConnectionKind::Direct, move |event: &TaskEvent<()>| {
        if matches!(event, TaskEvent::Cancelled) {
            c.fetch_add(1, Ordering::SeqCst);
        }
    });

    let future = executor.submit_task(&task).unwrap();
    assert!(future.cancel());
    release_tx.send(()).unwrap();
    blocker.result(None).unwrap();

    assert!(executor.pool().wait_for_done(Some(TIMEOUT)));
    assert!(matches!(future.result(None), Err(FutureError::Cancelled)));
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    assert!(task.owner().is_current());
}

#[test]
fn test_watcher_reports_worker_transitions() {
    let event_loop = EventLoop::new();
    let executor = create_test_executor(1);
    let (start_tx, start_rx) = std::sync::mpsc::channel::<()>();

    // Occupy the only worker so the watched item stays pending
    executor
        .submit(move || {
            start_rx.recv().ok();
            Ok("blocker")
        })
        .unwrap();
    let future = executor.submit(|| Ok("watched")).unwrap();
    let watcher = FutureWatcher::new(future);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    watcher.connect(move |event| s.lock().unwrap().push(*event));
    start_tx.send(()).unwrap();

    assert!(event_loop.run_until(TIMEOUT, || seen.lock().unwrap().len() == 2));
    assert_eq!(
        *seen.lock().unwrap(),
        vec![WatcherEvent::Started, WatcherEvent::Finished]
    );
    assert!(watcher.is_done());
    assert_eq!(watcher.result(None).unwrap(), "watched");
}

#[test]
fn test_workers_report_progress_through_invoker() {
    let event_loop = EventLoop::new();
    let executor = create_test_executor(3);
    let progress = Affine::new(Vec::<u32>::new());
    let report = Invoker::new(&progress, "report", |log: &mut Vec<u32>, value: u32| {
        log.push(value)
    });

    let futures: Vec<_> = (1..=5)
        .map(|i| {
            let report = report.clone();
            executor
                .submit(move || {
                    report.invoke(i);
                    Ok(())
                })
                .unwrap()
        })
        .collect();
    for future in &futures {
        future.result(Some(TIMEOUT)).unwrap();
    }

    event_loop.process_events();
    let mut reported = progress.with(|log| log.clone()).unwrap();
    reported.sort_unstable();
    assert_eq!(reported, vec![1, 2, 3, 4, 5]);
}
