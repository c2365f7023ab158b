//! Dependency-matching scheduler core.
//!
//! All state transitions happen under one coarse mutex. Dispatch into the
//! thread pool and resume signalling always happen after that mutex is
//! released; the single sanctioned exception is `pause_task`, which hands
//! its guard to the pool so the paused record is published before the lock
//! drops.

use crate::event::{DependencyKey, Event};
use crate::ledger::process::ProcessLedger;
use crate::ledger::thread::ThreadLedger;
use crate::pool::ThreadPool;
use crate::runtime::Handle;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, trace};

pub(crate) mod task;
use task::{DependencyTracking, PausedSlot, PendingTask, TaskFn, TaskId};

#[cfg(test)]
mod tests;

/// Unmatched events rest here until a task consumes them. Events of every
/// source rank share one arrival-ordered queue per event id, so a wildcard
/// dependency always takes the oldest event on the id while concrete-rank
/// lookups still see per-source FIFO order.
#[derive(Default)]
struct EventStore {
    by_id: HashMap<String, VecDeque<Event>>,
    /// Count of stored non-persistent events, for the quiescence test.
    to_handle: usize,
}

impl EventStore {
    /// Take (or copy, for persistent events) the oldest event matching the
    /// key. Persistent events stay in the store and satisfy any number of
    /// consumers.
    fn take_matching(&mut self, key: &DependencyKey) -> Option<Event> {
        let queue = self.by_id.get_mut(key.id())?;
        let idx = queue
            .iter()
            .position(|event| key.matches_source(event.source()))?;
        if queue[idx].is_persistent() {
            return Some(queue[idx].clone());
        }
        let event = queue.remove(idx).expect("indexed event vanished");
        self.to_handle -= 1;
        if queue.is_empty() {
            self.by_id.remove(key.id());
        }
        Some(event)
    }

    fn store(&mut self, event: Event) {
        if !event.is_persistent() {
            self.to_handle += 1;
        }
        self.by_id
            .entry(event.id().to_string())
            .or_default()
            .push_back(event);
    }

    fn clear(&mut self) {
        self.by_id.clear();
        self.to_handle = 0;
    }
}

struct SchedulerState {
    registered: Vec<PendingTask>,
    paused: Vec<Arc<PausedSlot>>,
    store: EventStore,
}

/// Which descriptor an event was matched into.
enum Matched {
    Pending(usize, TaskId),
    Paused(usize, TaskId),
}

pub(crate) struct Scheduler {
    state: Mutex<SchedulerState>,
    pool: Arc<ThreadPool>,
    resilience_level: i32,
    handle: OnceLock<Handle>,
    thread_ledger: OnceLock<Arc<ThreadLedger>>,
    process_ledger: OnceLock<Arc<ProcessLedger>>,
}

impl Scheduler {
    pub(crate) fn new(pool: Arc<ThreadPool>, resilience_level: i32) -> Arc<Scheduler> {
        Arc::new(Scheduler {
            state: Mutex::new(SchedulerState {
                registered: Vec::new(),
                paused: Vec::new(),
                store: EventStore::default(),
            }),
            pool,
            resilience_level,
            handle: OnceLock::new(),
            thread_ledger: OnceLock::new(),
            process_ledger: OnceLock::new(),
        })
    }

    pub(crate) fn wire_handle(&self, handle: Handle) {
        self.handle
            .set(handle)
            .unwrap_or_else(|_| panic!("scheduler handle already wired"));
    }

    pub(crate) fn wire_thread_ledger(&self, ledger: Arc<ThreadLedger>) {
        self.thread_ledger
            .set(ledger)
            .unwrap_or_else(|_| panic!("thread ledger already wired"));
    }

    pub(crate) fn wire_process_ledger(&self, ledger: Arc<ProcessLedger>) {
        self.process_ledger
            .set(ledger)
            .unwrap_or_else(|_| panic!("process ledger already wired"));
    }

    /// Register a task: satisfy whatever dependencies the store already
    /// holds, dispatch if complete (persistent tasks are cloned for
    /// execution and the template re-armed), store otherwise.
    pub(crate) fn register_task(
        &self,
        task_fn: TaskFn,
        name: &str,
        dependencies: Vec<DependencyKey>,
        persistent: bool,
    ) {
        let mut pending = PendingTask::new(task_fn, name, persistent);
        let mut st = self.state.lock();
        for key in dependencies {
            pending.deps.order.push(key.clone());
            pending.original.increment(&key);
            match st.store.take_matching(&key) {
                Some(event) => {
                    pending.deps.num_arrived += 1;
                    if let Some(ledger) = self.process_ledger.get() {
                        ledger.event_moved(&key, pending.task_id);
                    }
                    pending.deps.arrived.push(&key, event);
                }
                None => pending.deps.outstanding.increment(&key),
            }
        }

        if let Some(ledger) = self.process_ledger.get() {
            ledger.task_scheduled(&pending);
        }

        if pending.deps.is_satisfied() {
            let exec = if persistent {
                let exec = pending.rearm();
                if let Some(ledger) = self.process_ledger.get() {
                    ledger.task_scheduled(&pending);
                }
                st.registered.push(pending);
                exec
            } else {
                pending
            };
            drop(st);
            self.ready_to_run(exec);
            self.consume_events_by_persistent_tasks();
        } else {
            st.registered.push(pending);
        }
    }

    /// Re-submission path used by the resilience ledger: the task's
    /// dependencies are already satisfied, dispatch straight away.
    pub(crate) fn resubmit(&self, task: PendingTask) {
        debug!(task = task.task_id.as_u64(), "resubmitting rescued task");
        self.ready_to_run(task);
    }

    /// Match an event against registered then paused tasks (registration
    /// order, pending before paused). A persistent event keeps matching,
    /// re-scanning from the start after every hit, and always ends up in the
    /// store; a non-persistent event is consumed by its first match.
    pub(crate) fn register_event(&self, event: Event) {
        if let Some(ledger) = self.process_ledger.get() {
            ledger.event_arrived(&event);
        }
        let key = event.key();
        let mut st = self.state.lock();
        if event.is_persistent() {
            loop {
                match Self::find_and_absorb(&mut st, event.clone()) {
                    Ok(matched) => {
                        self.record_move(&key, &matched);
                        st = self.after_match(matched, st);
                    }
                    Err(_) => break,
                }
            }
            st.store.store(event);
        } else {
            match Self::find_and_absorb(&mut st, event) {
                Ok(matched) => {
                    self.record_move(&key, &matched);
                    let _ = self.after_match(matched, st);
                }
                Err(event) => st.store.store(event),
            }
        }
    }

    /// Batched hand-off from the messaging layer.
    pub(crate) fn register_events(&self, events: Vec<Event>) {
        for event in events {
            self.register_event(event);
        }
    }

    fn record_move(&self, key: &DependencyKey, matched: &Matched) {
        if let Some(ledger) = self.process_ledger.get() {
            let task_id = match matched {
                Matched::Pending(_, id) | Matched::Paused(_, id) => *id,
            };
            ledger.event_moved(key, task_id);
        }
    }

    fn find_and_absorb(st: &mut SchedulerState, event: Event) -> Result<Matched, Event> {
        let key = event.key();
        for (idx, task) in st.registered.iter_mut().enumerate() {
            if task.deps.outstanding.contains_matching(&key) {
                task.deps.absorb(event);
                return Ok(Matched::Pending(idx, task.task_id));
            }
        }
        for (idx, slot) in st.paused.iter().enumerate() {
            let mut deps = slot.deps.lock();
            if deps.outstanding.contains_matching(&key) {
                deps.absorb(event);
                return Ok(Matched::Paused(idx, slot.id));
            }
        }
        Err(event)
    }

    /// If the matched descriptor became runnable, dispatch or resume it.
    /// Releases the scheduler mutex around pool calls and re-acquires it for
    /// the caller.
    fn after_match<'a>(
        &'a self,
        matched: Matched,
        mut st: MutexGuard<'a, SchedulerState>,
    ) -> MutexGuard<'a, SchedulerState> {
        match matched {
            Matched::Pending(idx, _) => {
                if !st.registered[idx].deps.is_satisfied() {
                    return st;
                }
                let exec = if st.registered[idx].persistent {
                    let exec = st.registered[idx].rearm();
                    if let Some(ledger) = self.process_ledger.get() {
                        ledger.task_scheduled(&st.registered[idx]);
                    }
                    exec
                } else {
                    st.registered.remove(idx)
                };
                drop(st);
                self.ready_to_run(exec);
                self.consume_events_by_persistent_tasks();
                self.state.lock()
            }
            Matched::Paused(idx, _) => {
                if !st.paused[idx].deps.lock().is_satisfied() {
                    return st;
                }
                let slot = st.paused.remove(idx);
                drop(st);
                self.pool.mark_thread_resume(slot.id);
                self.state.lock()
            }
        }
    }

    /// Sweep every persistent registered task, draining as many stored
    /// events as possible; one dispatch per full satisfaction, re-arming
    /// after each. Loops until a full round makes no progress, because
    /// unlocking one persistent task may enqueue events consumable by
    /// another.
    pub(crate) fn consume_events_by_persistent_tasks(&self) {
        loop {
            let ready = {
                let mut st = self.state.lock();
                self.drain_persistent_round(&mut st)
            };
            if ready.is_empty() {
                break;
            }
            for exec in ready {
                self.ready_to_run(exec);
            }
        }
    }

    fn drain_persistent_round(&self, st: &mut SchedulerState) -> Vec<PendingTask> {
        let mut ready = Vec::new();
        let mut idx = 0;
        while idx < st.registered.len() {
            if !st.registered[idx].persistent {
                idx += 1;
                continue;
            }
            let keys: Vec<DependencyKey> = st.registered[idx]
                .deps
                .outstanding
                .iter()
                .map(|(key, _)| key.clone())
                .collect();
            for key in keys {
                if let Some(event) = st.store.take_matching(&key) {
                    if let Some(ledger) = self.process_ledger.get() {
                        ledger.event_moved(&key, st.registered[idx].task_id);
                    }
                    st.registered[idx].deps.absorb(event);
                }
            }
            if st.registered[idx].deps.is_satisfied() {
                let exec = st.registered[idx].rearm();
                if let Some(ledger) = self.process_ledger.get() {
                    ledger.task_scheduled(&st.registered[idx]);
                }
                ready.push(exec);
            }
            idx += 1;
        }
        ready
    }

    /// Park the calling worker until the given dependencies are satisfied,
    /// returning the payload events. Dependencies already in the store are
    /// consumed immediately; a fully satisfied call never parks.
    pub(crate) fn pause_task(&self, dependencies: Vec<DependencyKey>) -> Vec<Event> {
        let mut st = self.state.lock();
        let mut tracking = DependencyTracking::default();
        for key in dependencies {
            tracking.order.push(key.clone());
            match st.store.take_matching(&key) {
                Some(event) => {
                    tracking.num_arrived += 1;
                    tracking.arrived.push(&key, event);
                }
                None => tracking.outstanding.increment(&key),
            }
        }
        if tracking.is_satisfied() {
            drop(st);
            return tracking.take_payload();
        }
        let slot = PausedSlot::new(tracking);
        st.paused.push(slot.clone());
        trace!("task pausing on unsatisfied dependencies");
        // The pool publishes the paused record, then releases our guard.
        self.pool.pause_thread(slot.id, st);
        let mut deps = slot.deps.lock();
        deps.take_payload()
    }

    /// Non-blocking poll: take the front event of every dependency that has
    /// one stored. Returns the subset found, possibly empty.
    pub(crate) fn retrieve_any_matching_events(
        &self,
        dependencies: Vec<DependencyKey>,
    ) -> Vec<Event> {
        let mut st = self.state.lock();
        let mut found = Vec::new();
        for key in dependencies {
            if let Some(event) = st.store.take_matching(&key) {
                found.push(event);
            }
        }
        found
    }

    pub(crate) fn is_task_scheduled(&self, name: &str) -> bool {
        let st = self.state.lock();
        st.registered
            .iter()
            .any(|task| !task.name.is_empty() && task.name == name)
    }

    /// Remove a registered task by name. Unknown names are a no-op returning
    /// false; a persistent clone already dispatched is committed and runs.
    pub(crate) fn deschedule_task(&self, name: &str) -> bool {
        let mut st = self.state.lock();
        let Some(idx) = st
            .registered
            .iter()
            .position(|task| !task.name.is_empty() && task.name == name)
        else {
            return false;
        };
        let task = st.registered.remove(idx);
        debug!(task = task.task_id.as_u64(), name, "task descheduled");
        true
    }

    /// True iff no non-persistent task is registered, no non-persistent
    /// event is stored, and the resilience ledger is drained.
    pub(crate) fn is_finished(&self) -> bool {
        let st = self.state.lock();
        if st.registered.iter().any(|task| !task.persistent) {
            return false;
        }
        if st.store.to_handle != 0 {
            return false;
        }
        self.thread_ledger
            .get()
            .map_or(true, |ledger| ledger.is_finished())
    }

    /// Drop every registered and paused task and all stored events. Restart
    /// support; the caller is responsible for quiescing workers first.
    pub(crate) fn reset(&self) {
        let mut st = self.state.lock();
        st.registered.clear();
        st.paused.clear();
        st.store.clear();
    }

    /// Hand a satisfied task to the thread pool. Never called with the
    /// scheduler mutex held.
    pub(crate) fn ready_to_run(&self, mut task: PendingTask) {
        task.resilience = self.resilience_level;
        let handle = self
            .handle
            .get()
            .expect("scheduler not wired to a runtime")
            .clone();
        let task_id = task.task_id;
        if let Some(ledger) = self.process_ledger.get() {
            ledger.task_running(task_id);
        }
        self.pool
            .start_task(Box::new(move || run_task(handle, task)), task_id);
    }

    #[cfg(test)]
    pub(crate) fn outstanding_to_handle(&self) -> usize {
        self.state.lock().store.to_handle
    }

    #[cfg(test)]
    pub(crate) fn registered_count(&self) -> usize {
        self.state.lock().registered.len()
    }

    /// Check the bookkeeping identities that must hold at every externally
    /// observable moment.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let st = self.state.lock();
        for task in &st.registered {
            assert_eq!(
                task.deps.num_arrived + task.deps.outstanding.total(),
                task.original.total(),
                "arrival accounting broken for task {:?}",
                task
            );
        }
        let stored_transient: usize = st
            .store
            .by_id
            .values()
            .map(|queue| queue.iter().filter(|e| !e.is_persistent()).count())
            .sum();
        assert_eq!(
            stored_transient, st.store.to_handle,
            "outstanding counter diverged from stored events"
        );
    }
}

/// Thread-side task entry: snapshot for the ledger, assemble the payload,
/// invoke, and report the outcome.
fn run_task(handle: Handle, mut task: PendingTask) {
    let thread_id = std::thread::current().id();
    let resilient = task.resilience > 0;
    let ledger = handle.thread_ledger();

    if resilient {
        if let Some(ledger) = ledger.as_ref() {
            ledger.task_running(thread_id, &task);
        }
    }

    let task_id = task.task_id;
    let payload = task.deps.take_payload();
    let task_fn = task.task_fn.clone();
    let outcome = catch_unwind(AssertUnwindSafe(|| task_fn(&handle, payload)));

    match (outcome, resilient, ledger) {
        (Ok(()), true, Some(ledger)) => {
            ledger.task_completed(thread_id, task_id);
            if let Some(process) = handle.process_ledger() {
                process.task_completed(task_id);
            }
        }
        (Ok(()), _, _) => {
            if let Some(process) = handle.process_ledger() {
                process.task_completed(task_id);
            }
        }
        (Err(_), true, Some(ledger)) => {
            error!(task = task_id.as_u64(), "task panicked, reporting worker failure");
            ledger.task_failed(task_id);
        }
        (Err(_), _, _) => {
            // Without resilience a dead task would hang the job; keep the
            // worker alive and make the failure loud.
            error!(task = task_id.as_u64(), "task panicked and resilience is disabled");
        }
    }
}
