//! Task descriptors and their dependency-tracking substructure.
//!
//! Three descriptor variants share the same tracking core: a registered
//! [`PendingTask`] (with a re-arm template for persistent tasks), a
//! [`PausedSlot`] whose thread is parked awaiting events, and the ledger's
//! `ActiveTask` snapshot taken at dispatch.

use crate::event::{DependencyKey, Event};
use crate::runtime::Handle;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) type TaskFn = Arc<dyn Fn(&Handle, Vec<Event>) + Send + Sync + 'static>;

/// Monotonic 64-bit task identifier. Zero is reserved to mean "no task".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    pub(crate) fn next() -> TaskId {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn as_u64(self) -> u64 {
        self.0
    }

    pub(crate) fn from_u64(raw: u64) -> TaskId {
        TaskId(raw)
    }
}

static NEXT_FN_ID: AtomicU32 = AtomicU32::new(1);

pub(crate) fn next_fn_id() -> u32 {
    NEXT_FN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Multiset of dependency keys. Lookups use wildcard matching, and a key that
/// wildcard-matches an existing entry merges into it rather than creating a
/// second entry, so `(1, "q")` followed by `(ANY, "q")` counts 2 under one
/// slot.
#[derive(Clone, Debug, Default)]
pub(crate) struct DependencyCounts {
    entries: SmallVec<[(DependencyKey, u32); 4]>,
}

impl DependencyCounts {
    pub(crate) fn increment(&mut self, key: &DependencyKey) {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| k.matches(key)) {
            entry.1 += 1;
        } else {
            self.entries.push((key.clone(), 1));
        }
    }

    /// Decrement the multiplicity of the matching entry, removing it at
    /// zero. Returns false when no entry matches.
    pub(crate) fn decrement(&mut self, key: &DependencyKey) -> bool {
        let Some(idx) = self.entries.iter().position(|(k, _)| k.matches(key)) else {
            return false;
        };
        self.entries[idx].1 -= 1;
        if self.entries[idx].1 == 0 {
            self.entries.remove(idx);
        }
        true
    }

    pub(crate) fn contains_matching(&self, key: &DependencyKey) -> bool {
        self.entries.iter().any(|(k, _)| k.matches(key))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn total(&self) -> u32 {
        self.entries.iter().map(|(_, n)| n).sum()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &(DependencyKey, u32)> {
        self.entries.iter()
    }
}

/// Per-key FIFO queues of events already matched to a task.
#[derive(Clone, Debug, Default)]
pub(crate) struct ArrivedEvents {
    entries: SmallVec<[(DependencyKey, VecDeque<Event>); 4]>,
}

impl ArrivedEvents {
    pub(crate) fn push(&mut self, key: &DependencyKey, event: Event) {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| k.matches(key)) {
            entry.1.push_back(event);
        } else {
            let mut queue = VecDeque::new();
            queue.push_back(event);
            self.entries.push((key.clone(), queue));
        }
    }

    pub(crate) fn pop(&mut self, key: &DependencyKey) -> Option<Event> {
        self.entries
            .iter_mut()
            .find(|(k, q)| k.matches(key) && !q.is_empty())
            .and_then(|(_, q)| q.pop_front())
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.iter().all(|(_, q)| q.is_empty())
    }
}

/// The substructure every descriptor variant tracks its dependencies with.
#[derive(Clone, Debug, Default)]
pub(crate) struct DependencyTracking {
    /// Declared order; drives the payload order the task sees.
    pub(crate) order: Vec<DependencyKey>,
    /// Multiset still awaited.
    pub(crate) outstanding: DependencyCounts,
    pub(crate) arrived: ArrivedEvents,
    pub(crate) num_arrived: u32,
}

impl DependencyTracking {
    /// Count an event against the outstanding multiset and queue it for the
    /// payload. The caller has already established the match.
    pub(crate) fn absorb(&mut self, event: Event) {
        let key = event.key();
        self.num_arrived += 1;
        self.outstanding.decrement(&key);
        self.arrived.push(&key, event);
    }

    pub(crate) fn is_satisfied(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Assemble the payload in declared-dependency order, consuming the
    /// arrived queues. Missing events at this point mean scheduler state was
    /// corrupted, which is unrecoverable.
    pub(crate) fn take_payload(&mut self) -> Vec<Event> {
        let order = std::mem::take(&mut self.order);
        let mut payload = Vec::with_capacity(order.len());
        for key in &order {
            let event = self.arrived.pop(key).unwrap_or_else(|| {
                panic!(
                    "no arrived event for dependency {} when mapping task onto a thread",
                    key
                )
            });
            payload.push(event);
        }
        payload
    }
}

/// A registered, not-yet-runnable task.
#[derive(Clone)]
pub(crate) struct PendingTask {
    pub(crate) task_id: TaskId,
    pub(crate) fn_id: u32,
    pub(crate) task_fn: TaskFn,
    pub(crate) name: String,
    pub(crate) persistent: bool,
    /// Resilience level stamped at dispatch time.
    pub(crate) resilience: i32,
    /// Template the dependency multiset is restored from when a persistent
    /// task re-arms.
    pub(crate) original: DependencyCounts,
    pub(crate) deps: DependencyTracking,
}

impl PendingTask {
    pub(crate) fn new(task_fn: TaskFn, name: &str, persistent: bool) -> PendingTask {
        PendingTask {
            task_id: TaskId::next(),
            fn_id: next_fn_id(),
            task_fn,
            name: name.to_string(),
            persistent,
            resilience: 0,
            original: DependencyCounts::default(),
            deps: DependencyTracking::default(),
        }
    }

    /// Clone this (satisfied) task for execution and restore the stored
    /// template: outstanding refilled from the original multiset, arrived
    /// queues cleared, a fresh task id drawn.
    pub(crate) fn rearm(&mut self) -> PendingTask {
        let exec = self.clone();
        self.deps.outstanding = self.original.clone();
        self.deps.arrived.clear();
        self.deps.num_arrived = 0;
        self.task_id = TaskId::next();
        exec
    }
}

impl std::fmt::Debug for PendingTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTask")
            .field("task_id", &self.task_id)
            .field("name", &self.name)
            .field("persistent", &self.persistent)
            .field("outstanding", &self.deps.outstanding)
            .field("num_arrived", &self.deps.num_arrived)
            .finish()
    }
}

/// A task that paused mid-execution; its worker thread is parked on the
/// owning slot until the remaining dependencies arrive.
#[derive(Debug)]
pub(crate) struct PausedSlot {
    pub(crate) id: TaskId,
    pub(crate) deps: Mutex<DependencyTracking>,
}

impl PausedSlot {
    pub(crate) fn new(deps: DependencyTracking) -> Arc<PausedSlot> {
        Arc::new(PausedSlot {
            id: TaskId::next(),
            deps: Mutex::new(deps),
        })
    }
}

/// An event fired by a resilient task while it runs, buffered by the ledger
/// until the task completes.
#[derive(Clone, Debug)]
pub(crate) struct HeldEvent {
    pub(crate) target: i32,
    pub(crate) event: Event,
}

/// Ledger snapshot of a dispatched task, deep-copied before the payload is
/// consumed so a failed run can be resynthesised.
pub(crate) struct ActiveTask {
    pub(crate) snapshot: PendingTask,
    pub(crate) held: VecDeque<HeldEvent>,
}

impl ActiveTask {
    pub(crate) fn new(task: &PendingTask) -> ActiveTask {
        ActiveTask {
            snapshot: task.clone(),
            held: VecDeque::new(),
        }
    }

    /// A fresh pending task carrying the snapshot's event queues and
    /// templates under a new task id. Its dependencies are already
    /// satisfied, so it goes straight back to dispatch.
    pub(crate) fn into_pending(self) -> PendingTask {
        let mut task = self.snapshot;
        task.task_id = TaskId::next();
        task
    }
}
