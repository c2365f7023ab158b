//! End-to-end scenarios over the in-process memory fabric. Each rank runs
//! in its own thread with its own runtime; `finalise` exercises the full
//! termination protocol.

use crate::event::{Payload, ANY};
use crate::runtime::Builder;
use crate::transport::memory::{MemoryFabric, MemoryTransport};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

fn build(transport: MemoryTransport) -> crate::runtime::Runtime {
    crate::test_utils::init_tracing();
    Builder::new()
        .transport(transport)
        .worker_threads(2)
        .main_thread_worker(false)
        .try_build()
        .unwrap()
}

#[test]
fn single_rank_local_echo() {
    let transport = MemoryFabric::new(1).remove(0);
    let runtime = build(transport);
    let handle = runtime.handle();

    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    handle
        .schedule_task(
            move |_h, events| {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].as_i32s().unwrap(), vec![42]);
                counter.fetch_add(1, Ordering::SeqCst);
            },
            &[(0, "ping")],
        )
        .unwrap();
    handle
        .fire_event(Payload::from_i32s(&[42]), 0, "ping")
        .unwrap();

    runtime.finalise().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn persistent_task_consumes_twenty_remote_events() {
    let mut fabric = MemoryFabric::new(2);
    let t1 = fabric.remove(1);
    let t0 = fabric.remove(0);
    let runs = Arc::new(AtomicUsize::new(0));

    let counter = runs.clone();
    let rank0 = thread::spawn(move || {
        let runtime = build(t0);
        let handle = runtime.handle();
        handle
            .schedule_persistent_named_task(
                move |_h, _events| {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                "sink",
                &[(1, "a")],
            )
            .unwrap();
        runtime.finalise().unwrap();
        assert!(handle.is_task_scheduled("sink"));
    });
    let rank1 = thread::spawn(move || {
        let runtime = build(t1);
        let handle = runtime.handle();
        for i in 0..20 {
            handle.fire_event(Payload::from_i32s(&[i]), 0, "a").unwrap();
        }
        runtime.finalise().unwrap();
    });

    rank0.join().unwrap();
    rank1.join().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 20);
}

#[test]
fn paused_task_resumes_with_the_awaited_payload() {
    let transport = MemoryFabric::new(1).remove(0);
    let runtime = build(transport);
    let handle = runtime.handle();
    let log = Arc::new(Mutex::new(Vec::new()));

    let sink = log.clone();
    handle
        .schedule_task(
            move |h, _events| {
                sink.lock().push("started".to_string());
                h.fire_event(Payload::None, 0, "y").unwrap();
                let resumed = h.wait_on(&[(0, "z")]).unwrap();
                sink.lock()
                    .push(format!("z={}", resumed[0].as_i32s().unwrap()[0]));
            },
            &[(0, "x")],
        )
        .unwrap();
    handle
        .schedule_task(
            move |h, _events| {
                h.fire_event(Payload::from_i32s(&[7]), 0, "z").unwrap();
            },
            &[(0, "y")],
        )
        .unwrap();
    handle.fire_event(Payload::None, 0, "x").unwrap();

    runtime.finalise().unwrap();
    assert_eq!(*log.lock(), vec!["started".to_string(), "z=7".to_string()]);
}

#[test]
fn wildcard_consumes_the_first_arrival_only() {
    let mut fabric = MemoryFabric::new(3);
    let t2 = fabric.remove(2);
    let t1 = fabric.remove(1);
    let t0 = fabric.remove(0);

    let wildcard_source = Arc::new(AtomicUsize::new(usize::MAX));
    let second_source = Arc::new(AtomicUsize::new(usize::MAX));
    let (scheduled_tx, scheduled_rx) = mpsc::channel::<()>();
    let (fired_tx, fired_rx) = mpsc::channel::<()>();

    let wild = wildcard_source.clone();
    let second = second_source.clone();
    let rank0 = thread::spawn(move || {
        let runtime = build(t0);
        let handle = runtime.handle();
        handle
            .schedule_task(
                move |_h, events| {
                    wild.store(events[0].source() as usize, Ordering::SeqCst);
                },
                &[(ANY, "q")],
            )
            .unwrap();
        handle
            .schedule_task(
                move |_h, events| {
                    second.store(events[0].source() as usize, Ordering::SeqCst);
                },
                &[(2, "q")],
            )
            .unwrap();
        scheduled_tx.send(()).unwrap();
        runtime.finalise().unwrap();
    });
    let rank1 = thread::spawn(move || {
        let runtime = build(t1);
        scheduled_rx.recv().unwrap();
        runtime
            .handle()
            .fire_event(Payload::from_i32s(&[1]), 0, "q")
            .unwrap();
        fired_tx.send(()).unwrap();
        runtime.finalise().unwrap();
    });
    let rank2 = thread::spawn(move || {
        let runtime = build(t2);
        fired_rx.recv().unwrap();
        runtime
            .handle()
            .fire_event(Payload::from_i32s(&[2]), 0, "q")
            .unwrap();
        runtime.finalise().unwrap();
    });

    rank0.join().unwrap();
    rank1.join().unwrap();
    rank2.join().unwrap();
    assert_eq!(wildcard_source.load(Ordering::SeqCst), 1);
    assert_eq!(second_source.load(Ordering::SeqCst), 2);
}

#[test]
fn quiet_job_finalises_promptly() {
    let mut fabric = MemoryFabric::new(2);
    let t1 = fabric.remove(1);
    let t0 = fabric.remove(0);
    let start = Instant::now();
    let rank0 = thread::spawn(move || build(t0).finalise().unwrap());
    let rank1 = thread::spawn(move || build(t1).finalise().unwrap());
    rank0.join().unwrap();
    rank1.join().unwrap();
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[test]
fn ping_pong_volley_terminates() {
    let mut fabric = MemoryFabric::new(2);
    let t1 = fabric.remove(1);
    let t0 = fabric.remove(0);
    let bounces = Arc::new(AtomicUsize::new(0));

    let spawn_rank = |transport: MemoryTransport, my_rank: i32, counter: Arc<AtomicUsize>| {
        thread::spawn(move || {
            let runtime = build(transport);
            let handle = runtime.handle();
            let peer = 1 - my_rank;
            handle
                .schedule_persistent_task(
                    move |h, events| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let remaining = events[0].as_i32s().unwrap()[0];
                        if remaining > 0 {
                            h.fire_event(Payload::from_i32s(&[remaining - 1]), peer, "ball")
                                .unwrap();
                        }
                    },
                    &[(peer, "ball")],
                )
                .unwrap();
            if my_rank == 0 {
                handle
                    .fire_event(Payload::from_i32s(&[6]), 1, "ball")
                    .unwrap();
            }
            runtime.finalise().unwrap();
        })
    };

    let rank0 = spawn_rank(t0, 0, bounces.clone());
    let rank1 = spawn_rank(t1, 1, bounces.clone());
    rank0.join().unwrap();
    rank1.join().unwrap();
    assert_eq!(bounces.load(Ordering::SeqCst), 7);
}

#[test]
fn failed_resilient_task_is_rescued_and_its_events_suppressed() {
    let transport = MemoryFabric::new(1).remove(0);
    let runtime = Builder::new()
        .transport(transport)
        .worker_threads(2)
        .main_thread_worker(false)
        .resilience(1)
        .try_build()
        .unwrap();
    let handle = runtime.handle();

    let attempts = Arc::new(AtomicUsize::new(0));
    let deliveries = Arc::new(AtomicUsize::new(0));

    let seen = deliveries.clone();
    handle
        .schedule_task(
            move |_h, events| {
                assert_eq!(events[0].as_i32s().unwrap(), vec![5]);
                seen.fetch_add(1, Ordering::SeqCst);
            },
            &[(0, "out")],
        )
        .unwrap();

    let tries = attempts.clone();
    handle
        .schedule_task(
            move |h, _events| {
                h.fire_event(Payload::from_i32s(&[5]), 0, "out").unwrap();
                if tries.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("injected worker failure");
                }
            },
            &[(0, "go")],
        )
        .unwrap();
    handle.fire_event(Payload::None, 0, "go").unwrap();

    runtime.finalise().unwrap();
    // The first run's fired event was purged; only the successful rerun
    // published it.
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(deliveries.load(Ordering::SeqCst), 1);
}

#[test]
fn batched_arrivals_flush_by_size_and_timeout() {
    let mut fabric = MemoryFabric::new(2);
    let t1 = fabric.remove(1);
    let t0 = fabric.remove(0);
    let runs = Arc::new(AtomicUsize::new(0));

    let counter = runs.clone();
    let rank0 = thread::spawn(move || {
        let runtime = Builder::new()
            .transport(t0)
            .worker_threads(2)
            .main_thread_worker(false)
            .batch_events(true)
            .max_batched_events(3)
            .batch_timeout(Duration::from_millis(10))
            .try_build()
            .unwrap();
        let handle = runtime.handle();
        handle
            .schedule_persistent_task(
                move |_h, _events| {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                &[(1, "data")],
            )
            .unwrap();
        runtime.finalise().unwrap();
    });
    let rank1 = thread::spawn(move || {
        let runtime = build(t1);
        let handle = runtime.handle();
        for i in 0..7 {
            handle
                .fire_event(Payload::from_i32s(&[i]), 0, "data")
                .unwrap();
        }
        runtime.finalise().unwrap();
    });

    rank0.join().unwrap();
    rank1.join().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 7);
}

#[test]
fn main_thread_serves_as_worker_inside_finalise() {
    let transport = MemoryFabric::new(1).remove(0);
    let runtime = Builder::new()
        .transport(transport)
        .worker_threads(1)
        .main_thread_worker(true)
        .try_build()
        .unwrap();
    let handle = runtime.handle();

    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    handle
        .schedule_task(
            move |_h, _events| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            &[(0, "tick")],
        )
        .unwrap();
    handle.fire_event(Payload::None, 0, "tick").unwrap();

    // The only worker slot is the main thread; nothing can run until
    // finalise lends it to the pool.
    thread::sleep(Duration::from_millis(30));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    runtime.finalise().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn idle_workers_steal_the_polling_loop_when_no_progress_thread() {
    let transport = MemoryFabric::new(1).remove(0);
    let runtime = Builder::new()
        .transport(transport)
        .worker_threads(2)
        .main_thread_worker(false)
        .progress_thread(false)
        .try_build()
        .unwrap();
    let handle = runtime.handle();

    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    handle
        .schedule_task(
            move |_h, _events| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            &[(0, "stolen")],
        )
        .unwrap();
    handle.fire_event(Payload::None, 0, "stolen").unwrap();

    runtime.finalise().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn context_events_deliver_the_region_address() {
    let transport = MemoryFabric::new(1).remove(0);
    let runtime = build(transport);
    let handle = runtime.handle();

    let context = handle.define_context(32);
    let address = handle.create_context(context);
    let observed = Arc::new(AtomicUsize::new(0));

    let sink = observed.clone();
    handle
        .schedule_task(
            move |_h, events| {
                assert!(events[0].is_context());
                sink.store(events[0].context_address().unwrap(), Ordering::SeqCst);
            },
            &[(0, "ctx")],
        )
        .unwrap();
    handle
        .fire_context_event(context, address, 0, "ctx")
        .unwrap();

    runtime.finalise().unwrap();
    assert_eq!(observed.load(Ordering::SeqCst), address);
}

#[test]
fn sealed_ledger_recovery_skips_consumed_events() {
    crate::test_utils::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let ledger_path = dir.path().join("rank0.ledger");
    let first_runs = Arc::new(AtomicUsize::new(0));

    // First life: events rest in the store, then a named task absorbs one
    // at registration, runs and completes; the ledger is sealed at
    // finalise.
    {
        let transport = MemoryFabric::new(1).remove(0);
        let runtime = Builder::new()
            .transport(transport)
            .worker_threads(2)
            .main_thread_worker(false)
            .resilience(2)
            .ledger_path(&ledger_path)
            .try_build()
            .unwrap();
        let handle = runtime.handle();
        handle
            .fire_event(Payload::from_i32s(&[11]), 0, "job")
            .unwrap();
        handle
            .fire_persistent_event(Payload::from_i32s(&[22]), 0, "extra")
            .unwrap();

        let counter = first_runs.clone();
        handle
            .schedule_named_task(
                move |_h, events| {
                    assert_eq!(events[0].as_i32s().unwrap(), vec![11]);
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                "consumer",
                &[(0, "job")],
            )
            .unwrap();
        runtime.finalise().unwrap();
    }
    assert_eq!(first_runs.load(Ordering::SeqCst), 1);

    // Second life: replaying the sealed ledger must not resurrect the event
    // the completed task consumed, while the untouched persistent event
    // flows again.
    let transport = MemoryFabric::new(1).remove(0);
    let runtime = build(transport);
    let handle = runtime.handle();
    let mut registry = crate::runtime::FunctionRegistry::new();
    let second_runs = Arc::new(AtomicUsize::new(0));
    let counter = second_runs.clone();
    registry.register("consumer", move |_h, _events| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let recovered = runtime.recover(&ledger_path, &registry).unwrap();
    assert_eq!(recovered, 0);
    assert_eq!(handle.inner().scheduler.outstanding_to_handle(), 0);
    assert!(handle.find_events(&[(0, "job")]).unwrap().is_empty());

    let extra = handle.find_events(&[(0, "extra")]).unwrap();
    assert_eq!(extra.len(), 1);
    assert_eq!(extra[0].as_i32s().unwrap(), vec![22]);

    runtime.finalise().unwrap();
    assert_eq!(second_runs.load(Ordering::SeqCst), 0);
}

#[test]
fn sentinel_self_rank_routes_locally() {
    let transport = MemoryFabric::new(1).remove(0);
    let runtime = build(transport);
    let handle = runtime.handle();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    handle
        .schedule_task(
            move |_h, _events| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            &[(crate::event::SELF_RANK, "loop")],
        )
        .unwrap();
    handle
        .fire_event(Payload::None, crate::event::SELF_RANK, "loop")
        .unwrap();
    runtime.finalise().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn invalid_targets_are_rejected_without_side_effects() {
    let transport = MemoryFabric::new(1).remove(0);
    let runtime = build(transport);
    let handle = runtime.handle();
    assert!(handle.fire_event(Payload::None, 5, "nope").is_err());
    assert!(handle
        .schedule_task(|_h, _e| {}, &[(9, "nope")])
        .is_err());
    runtime.finalise().unwrap();
}
