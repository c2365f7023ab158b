use super::*;
use crate::event::{Payload, ANY};
use crate::runtime::Builder;
use crate::transport::memory::MemoryFabric;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn single_rank() -> (crate::runtime::Runtime, Arc<Scheduler>) {
    crate::test_utils::init_tracing();
    let transport = MemoryFabric::new(1).remove(0);
    let runtime = Builder::new()
        .transport(transport)
        .worker_threads(2)
        .main_thread_worker(false)
        .try_build()
        .unwrap();
    let scheduler = runtime.handle().inner().scheduler.clone();
    (runtime, scheduler)
}

fn local_event(source: i32, id: &str, value: i32) -> Event {
    Event::new(source, false, id.to_string(), Payload::from_i32s(&[value]))
}

fn persistent_event(source: i32, id: &str, value: i32) -> Event {
    Event::new(source, true, id.to_string(), Payload::from_i32s(&[value]))
}

fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    predicate()
}

#[test]
fn unmatched_events_rest_in_the_store() {
    let (runtime, scheduler) = single_rank();
    scheduler.register_event(local_event(0, "lonely", 1));
    scheduler.register_event(local_event(0, "lonely", 2));
    assert_eq!(scheduler.outstanding_to_handle(), 2);
    scheduler.assert_invariants();
    assert!(!scheduler.is_finished());
    drop(runtime);
}

#[test]
fn stored_events_satisfy_a_late_task_in_fifo_order() {
    let (runtime, scheduler) = single_rank();
    let handle = runtime.handle();
    scheduler.register_event(local_event(0, "seq", 1));
    scheduler.register_event(local_event(0, "seq", 2));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    handle
        .schedule_task(
            move |_h, events| {
                sink.lock().push(events[0].as_i32s().unwrap()[0]);
            },
            &[(0, "seq")],
        )
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || seen.lock().len() == 1));
    assert_eq!(*seen.lock(), vec![1]);
    assert_eq!(scheduler.outstanding_to_handle(), 1);
    scheduler.assert_invariants();
    drop(runtime);
}

#[test]
fn partial_arrival_keeps_the_accounting_identity() {
    let (runtime, scheduler) = single_rank();
    let handle = runtime.handle();
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = ran.clone();
    handle
        .schedule_task(
            move |_h, events| {
                assert_eq!(events.len(), 3);
                counter.fetch_add(1, Ordering::SeqCst);
            },
            &[(0, "a"), (0, "a"), (0, "b")],
        )
        .unwrap();

    scheduler.register_event(local_event(0, "a", 1));
    scheduler.assert_invariants();
    assert_eq!(scheduler.registered_count(), 1);

    scheduler.register_event(local_event(0, "a", 2));
    scheduler.assert_invariants();
    scheduler.register_event(local_event(0, "b", 3));
    assert!(wait_until(Duration::from_secs(5), || ran.load(Ordering::SeqCst) == 1));
    assert_eq!(scheduler.registered_count(), 0);
    scheduler.assert_invariants();
    drop(runtime);
}

#[test]
fn wildcard_takes_the_oldest_event_across_sources() {
    let (runtime, scheduler) = single_rank();
    let handle = runtime.handle();
    // Sources here are just key data; they need not be live ranks.
    scheduler.register_event(local_event(4, "q", 40));
    scheduler.register_event(local_event(2, "q", 20));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    handle
        .schedule_task(
            move |_h, events| {
                sink.lock().push(events[0].source());
            },
            &[(ANY, "q")],
        )
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || seen.lock().len() == 1));
    assert_eq!(*seen.lock(), vec![4]);
    assert_eq!(scheduler.outstanding_to_handle(), 1);
    drop(runtime);
}

#[test]
fn persistent_event_feeds_every_matching_task_and_stays_stored() {
    let (runtime, scheduler) = single_rank();
    let handle = runtime.handle();
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let counter = ran.clone();
        handle
            .schedule_task(
                move |_h, events| {
                    assert_eq!(events[0].as_i32s().unwrap(), vec![9]);
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                &[(0, "broadcast")],
            )
            .unwrap();
    }
    scheduler.register_event(persistent_event(0, "broadcast", 9));
    assert!(wait_until(Duration::from_secs(5), || ran.load(Ordering::SeqCst) == 2));
    // The persistent event is still stored and does not count towards the
    // transient outstanding total.
    assert_eq!(scheduler.outstanding_to_handle(), 0);
    scheduler.assert_invariants();

    // A later task consumes a copy immediately at registration.
    let counter = ran.clone();
    handle
        .schedule_task(
            move |_h, _events| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            &[(0, "broadcast")],
        )
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || ran.load(Ordering::SeqCst) == 3));
    drop(runtime);
}

#[test]
fn persistent_task_rearms_for_each_stored_event() {
    let (runtime, scheduler) = single_rank();
    let handle = runtime.handle();
    for value in 0..5 {
        scheduler.register_event(local_event(0, "work", value));
    }
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = ran.clone();
    handle
        .schedule_persistent_named_task(
            move |_h, _events| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            "drainer",
            &[(0, "work")],
        )
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || ran.load(Ordering::SeqCst) == 5));
    assert!(wait_until(Duration::from_secs(5), || scheduler
        .outstanding_to_handle()
        == 0));
    // The template survives every dispatch.
    assert!(handle.is_task_scheduled("drainer"));
    scheduler.assert_invariants();
    drop(runtime);
}

#[test]
fn deschedule_unknown_name_is_a_clean_no_op() {
    let (runtime, scheduler) = single_rank();
    let handle = runtime.handle();
    assert!(!handle.deschedule_task("ghost"));
    handle
        .schedule_named_task(|_h, _e| {}, "real", &[(0, "never")])
        .unwrap();
    assert!(handle.is_task_scheduled("real"));
    assert!(handle.deschedule_task("real"));
    assert!(!handle.is_task_scheduled("real"));
    assert_eq!(scheduler.registered_count(), 0);
    drop(runtime);
}

#[test]
fn retrieve_matching_takes_fronts_without_blocking() {
    let (runtime, scheduler) = single_rank();
    let handle = runtime.handle();
    scheduler.register_event(local_event(0, "x", 1));
    let found = handle.find_events(&[(0, "x"), (0, "missing")]).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id(), "x");
    assert_eq!(scheduler.outstanding_to_handle(), 0);
    assert!(handle.find_events(&[(0, "x")]).unwrap().is_empty());
    drop(runtime);
}

#[test]
fn finished_only_when_nothing_transient_remains() {
    let (runtime, scheduler) = single_rank();
    let handle = runtime.handle();
    assert!(scheduler.is_finished());
    handle
        .schedule_persistent_named_task(|_h, _e| {}, "keeper", &[(0, "tick")])
        .unwrap();
    // A persistent template alone does not block finishedness.
    assert!(scheduler.is_finished());
    scheduler.register_event(local_event(0, "other", 1));
    assert!(!scheduler.is_finished());
    let _ = handle.find_events(&[(0, "other")]).unwrap();
    assert!(scheduler.is_finished());
    drop(runtime);
}
