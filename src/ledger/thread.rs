//! Thread-failure resilience ledger.
//!
//! Every resilient task is registered here at dispatch with a deep snapshot
//! of its descriptor. Events the task fires while running are intercepted
//! and *held*; they only reach the messaging layer once the task completes.
//! When a worker is declared failed, the held events are purged and a fresh
//! task is synthesised from the snapshot and resubmitted, so the failed
//! run's outputs never leak.
//!
//! Ledger locks are independent of the scheduler mutex: no method here is
//! ever called with that mutex held, and no held lock spans a call back
//! into scheduler or messaging.

use crate::event::Event;
use crate::messaging::Messaging;
use crate::scheduler::task::{ActiveTask, HeldEvent, PendingTask, TaskId};
use crate::scheduler::Scheduler;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread::ThreadId;
use tracing::{error, info, warn};

#[derive(Default)]
struct Outcomes {
    completed: HashSet<TaskId>,
    failed: HashSet<TaskId>,
}

pub(crate) struct ThreadLedger {
    scheduler: Arc<Scheduler>,
    messaging: Arc<Messaging>,
    active: DashMap<TaskId, ActiveTask>,
    /// Stack of task ids per worker thread; the top entry is the task
    /// currently executing there.
    by_thread: DashMap<ThreadId, Vec<TaskId>>,
    outcomes: Mutex<Outcomes>,
}

impl ThreadLedger {
    pub(crate) fn new(scheduler: Arc<Scheduler>, messaging: Arc<Messaging>) -> Arc<ThreadLedger> {
        Arc::new(ThreadLedger {
            scheduler,
            messaging,
            active: DashMap::new(),
            by_thread: DashMap::new(),
            outcomes: Mutex::new(Outcomes::default()),
        })
    }

    /// Register a dispatched task under its id, keyed by the worker thread.
    /// Must run before the task's payload is consumed so the snapshot still
    /// carries the arrived event queues.
    pub(crate) fn task_running(&self, thread_id: ThreadId, task: &PendingTask) {
        self.active.insert(task.task_id, ActiveTask::new(task));
        self.by_thread
            .entry(thread_id)
            .or_default()
            .push(task.task_id);
    }

    /// The task currently executing on a thread, if that thread is running
    /// a ledger-tracked task at all. Fired events from any other thread
    /// (the process main thread in particular) bypass the ledger.
    pub(crate) fn current_task(&self, thread_id: ThreadId) -> Option<TaskId> {
        self.by_thread
            .get(&thread_id)
            .and_then(|stack| stack.last().copied())
    }

    /// Buffer an event fired by a running resilient task.
    pub(crate) fn hold_event(&self, task_id: TaskId, target: i32, event: Event) {
        match self.active.get_mut(&task_id) {
            Some(mut active) => active.held.push_back(HeldEvent { target, event }),
            None => error!(
                task = task_id.as_u64(),
                "held event for a task the ledger does not know"
            ),
        }
    }

    /// Release the held events in enqueue order and retire the task. A task
    /// already marked failed is refused: its replacement owns the outcome.
    pub(crate) fn task_completed(&self, thread_id: ThreadId, task_id: TaskId) {
        {
            let mut outcomes = self.outcomes.lock();
            if outcomes.failed.contains(&task_id) {
                warn!(
                    task = task_id.as_u64(),
                    "task attempted to complete but was already reported failed and resubmitted"
                );
                return;
            }
            outcomes.completed.insert(task_id);
        }
        if let Some(mut stack) = self.by_thread.get_mut(&thread_id) {
            stack.pop();
        }
        let Some((_, active)) = self.active.remove(&task_id) else {
            error!(task = task_id.as_u64(), "completed task missing from ledger");
            return;
        };
        for held in active.held {
            if let Err(err) = self.messaging.fire_prebuilt(held.event, held.target) {
                error!(?err, "failed to release held event");
            }
        }
    }

    /// Handle a worker failure: purge the held events and resubmit a fresh
    /// task synthesised from the dispatch-time snapshot. A no-op when the
    /// task already completed.
    pub(crate) fn task_failed(&self, task_id: TaskId) {
        {
            let mut outcomes = self.outcomes.lock();
            if outcomes.completed.contains(&task_id) {
                info!(
                    task = task_id.as_u64(),
                    "task reported as failed but had already completed"
                );
                return;
            }
            outcomes.failed.insert(task_id);
        }
        warn!(
            task = task_id.as_u64(),
            "task reported as failed, purging its held events"
        );
        // The worker may have survived (caught panic); drop the stale
        // current-task entry wherever it is.
        for mut entry in self.by_thread.iter_mut() {
            if let Some(pos) = entry.value().iter().rposition(|id| *id == task_id) {
                entry.value_mut().remove(pos);
                break;
            }
        }
        let Some((_, active)) = self.active.remove(&task_id) else {
            error!(task = task_id.as_u64(), "failed task missing from ledger");
            return;
        };
        // Dropping `held` purges the write-ahead events.
        let replacement = active.into_pending();
        info!(
            task = task_id.as_u64(),
            replacement = replacement.task_id.as_u64(),
            "task rescheduled under a new id"
        );
        self.scheduler.resubmit(replacement);
    }

    /// External failure notification for whatever task runs on a thread.
    pub(crate) fn report_thread_failure(&self, thread_id: ThreadId) {
        match self.current_task(thread_id) {
            Some(task_id) => self.task_failed(task_id),
            None => warn!(?thread_id, "failure reported for a thread with no active task"),
        }
    }

    /// Drained ledger; part of the scheduler's finished predicate.
    pub(crate) fn is_finished(&self) -> bool {
        self.active.is_empty()
    }
}
