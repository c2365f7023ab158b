use super::*;
use crate::scheduler::task::TaskId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn name_fn() -> ThreadNameFn {
    ThreadNameFn(Arc::new(|idx| format!("edat-test-worker-{}", idx)))
}

fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    predicate()
}

#[test]
fn dispatch_runs_tasks_on_workers() {
    let pool = ThreadPool::new(2, false, name_fn());
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..8 {
        let counter = counter.clone();
        pool.start_task(
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            TaskId::next(),
        );
    }
    assert!(wait_until(Duration::from_secs(5), || counter
        .load(Ordering::SeqCst)
        == 8));
    assert!(wait_until(Duration::from_secs(5), || pool.is_idle()));
    pool.shutdown();
}

#[test]
fn overflow_queue_drains_in_order() {
    let pool = ThreadPool::new(1, false, name_fn());
    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..4usize {
        let order = order.clone();
        pool.start_task(
            Box::new(move || {
                thread::sleep(Duration::from_millis(5));
                order.lock().push(i);
            }),
            TaskId::next(),
        );
    }
    assert!(wait_until(Duration::from_secs(5), || order.lock().len() == 4));
    assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    pool.shutdown();
}

#[test]
fn busy_pool_is_not_idle() {
    let pool = ThreadPool::new(1, false, name_fn());
    assert!(pool.is_idle());
    let release = Arc::new(AtomicUsize::new(0));
    let gate = release.clone();
    pool.start_task(
        Box::new(move || {
            while gate.load(Ordering::SeqCst) == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }),
        TaskId::next(),
    );
    assert!(wait_until(Duration::from_secs(2), || !pool.is_idle()));
    release.store(1, Ordering::SeqCst);
    assert!(wait_until(Duration::from_secs(5), || pool.is_idle()));
    pool.shutdown();
}

/// A slot with a paused task must not pick up queued work until that task
/// has resumed and completed; the resumed package runs before anything from
/// the global queue.
#[test]
fn paused_slot_defers_queued_work_until_completion() {
    let pool = ThreadPool::new(1, false, name_fn());
    let events = Arc::new(Mutex::new(Vec::new()));
    let paused_id = TaskId::next();

    let p = pool.clone();
    let log = events.clone();
    pool.start_task(
        Box::new(move || {
            log.lock().push("start");
            p.pause_thread(paused_id, ());
            log.lock().push("resumed");
        }),
        TaskId::next(),
    );
    let log = events.clone();
    pool.start_task(
        Box::new(move || {
            log.lock().push("queued");
        }),
        TaskId::next(),
    );

    assert!(wait_until(Duration::from_secs(2), || {
        pool.paused_owner.lock().contains_key(&paused_id)
    }));
    thread::sleep(Duration::from_millis(30));
    assert_eq!(*events.lock(), vec!["start"]);

    pool.mark_thread_resume(paused_id);
    assert!(wait_until(Duration::from_secs(5), || events.lock().len() == 3));
    assert_eq!(*events.lock(), vec!["start", "resumed", "queued"]);
    pool.shutdown();
}

#[test]
fn resume_before_any_other_work_is_immediate() {
    let pool = ThreadPool::new(2, false, name_fn());
    let done = Arc::new(AtomicUsize::new(0));
    let paused_id = TaskId::next();

    let p = pool.clone();
    let flag = done.clone();
    pool.start_task(
        Box::new(move || {
            p.pause_thread(paused_id, ());
            flag.store(1, Ordering::SeqCst);
        }),
        TaskId::next(),
    );
    assert!(wait_until(Duration::from_secs(2), || {
        pool.paused_owner.lock().contains_key(&paused_id)
    }));
    pool.mark_thread_resume(paused_id);
    assert!(wait_until(Duration::from_secs(5), || done.load(Ordering::SeqCst) == 1));
    pool.shutdown();
}

#[test]
fn main_worker_serves_queued_tasks_during_adoption() {
    let pool = ThreadPool::new(1, true, name_fn());
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let counter = counter.clone();
        pool.start_task(
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            TaskId::next(),
        );
    }
    // Nothing can run yet: the only slot belongs to the busy main thread.
    thread::sleep(Duration::from_millis(20));
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    let releaser = {
        let pool = pool.clone();
        let counter = counter.clone();
        thread::spawn(move || {
            wait_until(Duration::from_secs(5), || counter.load(Ordering::SeqCst) == 3);
            pool.release_main();
        })
    };
    pool.run_main_until_released();
    releaser.join().unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    pool.shutdown();
}

#[test]
fn worker_threads_carry_configured_names() {
    let pool = ThreadPool::new(2, false, name_fn());
    let name = Arc::new(Mutex::new(String::new()));
    let sink = name.clone();
    pool.start_task(
        Box::new(move || {
            *sink.lock() = thread::current().name().unwrap_or("").to_string();
        }),
        TaskId::next(),
    );
    assert!(wait_until(Duration::from_secs(2), || !name.lock().is_empty()));
    assert!(name.lock().starts_with("edat-test-worker-"));
    pool.shutdown();
}
