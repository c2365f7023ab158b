//! Worker thread pool.
//!
//! A fixed set of worker *slots*, each owning an active [`ThreadPackage`],
//! a map of paused-task packages, a FIFO of resumable (waiting) packages and
//! a pool of spare packages whose threads are parked between lives. Tasks
//! overflow into a global FIFO queue when every slot is busy.
//!
//! A slot whose task has paused stays busy: no new work is dispatched to it
//! until the paused task has resumed and completed. Spare threads exist so
//! the pausing thread can sleep on its own package while the slot keeps a
//! wake target for future dispatches.

use crate::messaging::Messaging;
use crate::scheduler::task::TaskId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use tracing::trace;

mod package;
pub(crate) use package::ThreadPackage;

#[cfg(test)]
mod tests;

pub(crate) type PoolTask = Box<dyn FnOnce() + Send + 'static>;

/// Names worker threads by slot index.
#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn(usize) -> String + Send + Sync>);

impl std::fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

struct PoolCommand {
    run: PoolTask,
    task_id: TaskId,
}

struct Worker {
    inner: Mutex<WorkerInner>,
}

struct WorkerInner {
    /// A task is in flight on this slot (running or paused).
    busy: bool,
    /// An OS thread is actively executing the in-flight task.
    running: bool,
    /// Command handed to the active package but not yet picked up.
    command: Option<PoolCommand>,
    /// The package dispatches wake.
    active: Arc<ThreadPackage>,
    /// Paused-task id -> the package its thread sleeps on.
    paused: HashMap<TaskId, Arc<ThreadPackage>>,
    /// Resumed packages, run in FIFO order once the current task finishes.
    waiting: VecDeque<Arc<ThreadPackage>>,
    /// Reusable packages with a parked thread attached.
    spares: Vec<Arc<ThreadPackage>>,
}

impl WorkerInner {
    fn new(active: Arc<ThreadPackage>, busy: bool) -> WorkerInner {
        WorkerInner {
            busy,
            running: false,
            command: None,
            active,
            paused: HashMap::new(),
            waiting: VecDeque::new(),
            spares: Vec::new(),
        }
    }
}

pub(crate) struct ThreadPool {
    workers: Vec<Worker>,
    queue: Mutex<VecDeque<PoolCommand>>,
    next_hint: AtomicUsize,
    /// Paused-task id -> owning worker slot.
    paused_owner: Mutex<HashMap<TaskId, usize>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    shutdown: AtomicBool,
    /// Slot adopted by the process-main thread during finalise, if any.
    main_worker: Option<usize>,
    /// The package the main thread parks on; it follows the main thread
    /// through pauses and hand-offs, so release must target it directly.
    main_package: OnceLock<Arc<ThreadPackage>>,
    main_release: AtomicBool,
    /// Single transport-polling duty slot for idle workers.
    poll_claimed: AtomicBool,
    messaging: OnceLock<Arc<Messaging>>,
    thread_name: ThreadNameFn,
    self_ref: OnceLock<Weak<ThreadPool>>,
}

thread_local! {
    static WORKER_INDEX: std::cell::Cell<Option<usize>> = const { std::cell::Cell::new(None) };
}

impl ThreadPool {
    /// Create the pool and spawn one thread per non-main worker slot. The
    /// main slot (last index, when enabled) starts busy and thread-less; the
    /// main thread adopts it inside finalise.
    pub(crate) fn new(
        num_workers: usize,
        main_thread_is_worker: bool,
        thread_name: ThreadNameFn,
    ) -> Arc<ThreadPool> {
        assert!(num_workers > 0, "thread pool needs at least one worker");

        let main_worker = main_thread_is_worker.then_some(num_workers - 1);
        let workers = (0..num_workers)
            .map(|idx| Worker {
                inner: Mutex::new(WorkerInner::new(
                    ThreadPackage::new(),
                    main_worker == Some(idx),
                )),
            })
            .collect();

        let pool = Arc::new(ThreadPool {
            workers,
            queue: Mutex::new(VecDeque::new()),
            next_hint: AtomicUsize::new(0),
            paused_owner: Mutex::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            main_worker,
            main_package: OnceLock::new(),
            main_release: AtomicBool::new(false),
            poll_claimed: AtomicBool::new(false),
            messaging: OnceLock::new(),
            thread_name,
            self_ref: OnceLock::new(),
        });
        pool.self_ref
            .set(Arc::downgrade(&pool))
            .expect("pool self reference already set");

        for idx in 0..num_workers {
            if main_worker == Some(idx) {
                continue;
            }
            let package = pool.workers[idx].inner.lock().active.clone();
            pool.spawn_thread(idx, package);
        }
        pool
    }

    pub(crate) fn set_messaging(&self, messaging: Arc<Messaging>) {
        let steal_polling = !messaging.has_progress_thread();
        self.messaging
            .set(messaging)
            .unwrap_or_else(|_| panic!("messaging already wired to pool"));
        if steal_polling {
            // No dedicated progress thread: nudge an idle worker onto
            // polling duty so remote events flow before the first dispatch.
            if let Some((_, worker)) = self
                .workers
                .iter()
                .enumerate()
                .find(|(idx, _)| self.main_worker != Some(*idx))
            {
                worker.inner.lock().active.wake();
            }
        }
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Slot index of the calling thread, when it is (or is standing in for)
    /// a pool worker.
    pub(crate) fn current_worker(&self) -> Option<usize> {
        WORKER_INDEX.with(|slot| slot.get())
    }

    /// Dispatch a task: round-robin hint over idle slots, linear fallback,
    /// FIFO overflow queue when every slot is busy.
    pub(crate) fn start_task(&self, run: PoolTask, task_id: TaskId) {
        let command = PoolCommand { run, task_id };
        let n = self.workers.len();
        let start = self.next_hint.fetch_add(1, Ordering::Relaxed) % n;
        for offset in 0..n {
            let idx = (start + offset) % n;
            let mut w = self.workers[idx].inner.lock();
            if w.busy {
                continue;
            }
            w.busy = true;
            w.command = Some(command);
            let package = w.active.clone();
            drop(w);
            trace!(task = task_id.as_u64(), worker = idx, "task dispatched");
            package.wake();
            // The dispatched worker may have been on polling duty; push the
            // duty onto another idle worker.
            if matches!(self.messaging.get(), Some(m) if !m.has_progress_thread()) {
                self.wake_one_idle_worker(idx);
            }
            return;
        }
        trace!(task = task_id.as_u64(), "all workers busy, task queued");
        self.queue.lock().push_back(command);
    }

    fn wake_one_idle_worker(&self, except: usize) {
        for (idx, worker) in self.workers.iter().enumerate() {
            if idx == except || self.main_worker == Some(idx) {
                continue;
            }
            let w = worker.inner.lock();
            if !w.busy {
                let package = w.active.clone();
                drop(w);
                package.wake();
                return;
            }
        }
    }

    /// Park the calling worker thread on its current package until the
    /// paused task is resumed. The supplied scheduler guard is released only
    /// after the paused record is visible, so a concurrent resume cannot be
    /// missed.
    pub(crate) fn pause_thread<G>(&self, paused_id: TaskId, scheduler_guard: G) {
        let idx = self
            .current_worker()
            .expect("pause called outside a worker thread");
        let me = {
            let mut owners = self.paused_owner.lock();
            let mut w = self.workers[idx].inner.lock();
            let me = w.active.clone();
            w.paused.insert(paused_id, me.clone());
            // Keep a wake target on the slot while this thread sleeps. The
            // slot stays busy, so the replacement only ever serves the
            // resume bookkeeping, never new dispatches.
            let replacement = w.spares.pop().unwrap_or_else(|| self.spawn_spare(idx));
            w.active = replacement;
            w.running = false;
            owners.insert(paused_id, idx);
            me
        };
        drop(scheduler_guard);
        trace!(worker = idx, "task paused, thread parked");
        me.park();
    }

    /// Move a paused task's package to its slot's waiting queue. Resumption
    /// happens when the slot's current task finishes, or immediately when
    /// nothing is running there.
    pub(crate) fn mark_thread_resume(&self, paused_id: TaskId) {
        let idx = self
            .paused_owner
            .lock()
            .remove(&paused_id)
            .expect("resumed task is not paused on any worker");
        let mut w = self.workers[idx].inner.lock();
        let package = w
            .paused
            .remove(&paused_id)
            .expect("paused package missing from owning worker");
        if w.running {
            w.waiting.push_back(package);
            return;
        }
        let placeholder = std::mem::replace(&mut w.active, package.clone());
        w.spares.push(placeholder);
        w.running = true;
        drop(w);
        trace!(worker = idx, "paused task resumed immediately");
        package.wake();
    }

    /// True when no slot has a task in flight and nothing is queued. Part of
    /// the local-quiescence test.
    pub(crate) fn is_idle(&self) -> bool {
        if !self.queue.lock().is_empty() {
            return false;
        }
        self.workers.iter().all(|worker| {
            let w = worker.inner.lock();
            !w.busy && w.command.is_none()
        })
    }

    /// Adopt the main-thread worker slot until the messaging layer releases
    /// it. Only meaningful when the pool was built with a main worker.
    pub(crate) fn run_main_until_released(&self) {
        let idx = self.main_worker.expect("main thread is not a worker");
        WORKER_INDEX.with(|slot| slot.set(Some(idx)));
        let me = {
            let mut w = self.workers[idx].inner.lock();
            w.busy = false;
            w.active.clone()
        };
        let _ = self.main_package.set(me.clone());
        // Serve like any worker; released only between tasks. After release
        // no further dispatch can occur because every rank has quiesced.
        loop {
            // Work may have queued while this slot was still owned by the
            // application code; adopt it, nobody else will hand it over.
            self.adopt_queued_work(idx);
            if self.main_release.load(Ordering::Acquire) {
                let w = self.workers[idx].inner.lock();
                if w.command.is_none() && !w.running {
                    break;
                }
            }
            me.park();
            self.serve(idx, &me);
        }
        WORKER_INDEX.with(|slot| slot.set(None));
    }

    /// Pull one globally queued command onto an idle slot. Normal slots get
    /// queued work through their finish path; the main slot needs this once
    /// on adoption because it becomes idle without finishing anything.
    fn adopt_queued_work(&self, idx: usize) {
        let mut w = self.workers[idx].inner.lock();
        if w.busy || w.command.is_some() {
            return;
        }
        if let Some(command) = self.queue.lock().pop_front() {
            w.busy = true;
            w.command = Some(command);
            let package = w.active.clone();
            drop(w);
            package.wake();
        }
    }

    /// Wake the parked main thread out of `run_main_until_released`.
    pub(crate) fn release_main(&self) {
        self.main_release.store(true, Ordering::Release);
        if let Some(package) = self.main_package.get() {
            package.wake();
        } else if let Some(idx) = self.main_worker {
            // Released before the main thread adopted its slot; make sure an
            // eventual adoption sees the flag straight away.
            self.workers[idx].inner.lock().active.wake();
        }
    }

    /// Stop every worker thread and join them.
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for worker in &self.workers {
            let w = worker.inner.lock();
            w.active.wake();
            for spare in &w.spares {
                spare.wake();
            }
        }
        let mut handles = self.handles.lock();
        for handle in handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked during shutdown");
            }
        }
    }

    fn spawn_thread(&self, idx: usize, package: Arc<ThreadPackage>) {
        let pool = self
            .self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("pool self reference not initialised");
        let name = (self.thread_name.0)(idx);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || thread_entry(pool, idx, package))
            .expect("failed to spawn worker thread");
        self.handles.lock().push(handle);
    }

    /// A fresh package with a parked thread, used as a pause replacement
    /// when the slot has no spare.
    fn spawn_spare(&self, idx: usize) -> Arc<ThreadPackage> {
        let package = ThreadPackage::new();
        self.spawn_thread(idx, package.clone());
        package
    }

    /// Serve as the slot's active runner until superseded or out of work.
    fn serve(&self, idx: usize, me: &Arc<ThreadPackage>) {
        loop {
            let command = {
                let mut w = self.workers[idx].inner.lock();
                if !Arc::ptr_eq(&w.active, me) {
                    // Superseded (a resumed task took the slot); go back to
                    // sleep as a spare.
                    return;
                }
                match w.command.take() {
                    Some(command) => {
                        w.running = true;
                        command
                    }
                    None => {
                        drop(w);
                        self.poll_transport_while_idle(me);
                        return;
                    }
                }
            };
            trace!(task = command.task_id.as_u64(), worker = idx, "task starting");
            (command.run)();
            if !self.finish_current(idx, me) {
                return;
            }
        }
    }

    /// Post-task path: waiting queue first, then the global queue, then
    /// idle. Returns false when this thread must park (slot handed over or
    /// nothing left to do).
    fn finish_current(&self, idx: usize, me: &Arc<ThreadPackage>) -> bool {
        let mut w = self.workers[idx].inner.lock();
        if let Some(resumed) = w.waiting.pop_front() {
            let spare = std::mem::replace(&mut w.active, resumed.clone());
            w.spares.push(spare);
            drop(w);
            resumed.wake();
            return false;
        }
        if let Some(command) = self.queue.lock().pop_front() {
            w.command = Some(command);
            return true;
        }
        w.busy = false;
        w.running = false;
        drop(w);
        // A released main thread re-checks its exit condition only when
        // woken; the last task finishing on its slot must nudge it.
        if self.main_worker == Some(idx) && self.main_release.load(Ordering::Acquire) {
            if let Some(package) = self.main_package.get() {
                package.wake();
            }
        }
        // The serve loop notices the empty command slot, takes a turn on
        // transport-polling duty if available, and parks.
        true
    }

    /// Claim the single transport-polling duty slot.
    pub(crate) fn try_claim_poll(&self) -> bool {
        self.poll_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release_poll(&self) {
        self.poll_claimed.store(false, Ordering::Release);
    }

    /// An idle worker may stand in for the transport progress loop when no
    /// dedicated progress thread exists. Only one worker polls at a time;
    /// polling stops the moment this worker is handed work.
    fn poll_transport_while_idle(&self, me: &Arc<ThreadPackage>) {
        let messaging = match self.messaging.get() {
            Some(messaging) if !messaging.has_progress_thread() => messaging,
            _ => return,
        };
        if !self.try_claim_poll() {
            return;
        }
        messaging.poll_while(|| !me.is_signalled() && !self.shutdown.load(Ordering::Acquire));
        self.release_poll();
    }
}

fn thread_entry(pool: Arc<ThreadPool>, idx: usize, me: Arc<ThreadPackage>) {
    WORKER_INDEX.with(|slot| slot.set(Some(idx)));
    loop {
        me.park();
        if pool.shutdown.load(Ordering::Acquire) {
            break;
        }
        pool.serve(idx, &me);
        if pool.shutdown.load(Ordering::Acquire) {
            break;
        }
    }
}
