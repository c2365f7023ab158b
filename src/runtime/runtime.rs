use crate::context::{ContextManager, ContextRef};
use crate::event::{DependencyKey, Event, Payload, ALL, ANY, SELF_RANK};
use crate::ledger::process::ProcessLedger;
use crate::ledger::thread::ThreadLedger;
use crate::messaging::Messaging;
use crate::pool::ThreadPool;
use crate::runtime::builder::RuntimeConfig;
use crate::scheduler::task::TaskFn;
use crate::scheduler::Scheduler;
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;
use tracing::{info, warn};

pub(crate) struct Inner {
    pub(crate) cfg: RuntimeConfig,
    pub(crate) contexts: ContextManager,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) pool: Arc<ThreadPool>,
    pub(crate) messaging: Arc<Messaging>,
    pub(crate) thread_ledger: Option<Arc<ThreadLedger>>,
    pub(crate) process_ledger: Option<Arc<ProcessLedger>>,
}

/// Cheap cloneable handle to a running rank. Every task receives one; the
/// application keeps its own through [`Runtime::handle`].
#[derive(Clone)]
pub struct Handle {
    inner: Arc<Inner>,
}

impl Handle {
    pub(crate) fn new(inner: Arc<Inner>) -> Handle {
        Handle { inner }
    }

    pub fn rank(&self) -> i32 {
        self.inner.messaging.rank()
    }

    pub fn num_ranks(&self) -> i32 {
        self.inner.messaging.num_ranks()
    }

    pub fn num_workers(&self) -> usize {
        self.inner.pool.num_workers()
    }

    /// Worker slot index of the calling thread, when it is one.
    pub fn worker_id(&self) -> Option<usize> {
        self.inner.pool.current_worker()
    }

    /// Register a transient task gated on the given `(source, event-id)`
    /// dependencies.
    pub fn schedule_task<F>(&self, task: F, dependencies: &[(i32, &str)]) -> Result<()>
    where
        F: Fn(&Handle, Vec<Event>) + Send + Sync + 'static,
    {
        self.schedule(Arc::new(task), "", dependencies, false)
    }

    pub fn schedule_named_task<F>(
        &self,
        task: F,
        name: &str,
        dependencies: &[(i32, &str)],
    ) -> Result<()>
    where
        F: Fn(&Handle, Vec<Event>) + Send + Sync + 'static,
    {
        self.schedule(Arc::new(task), name, dependencies, false)
    }

    /// A persistent task re-arms itself after every dispatch.
    pub fn schedule_persistent_task<F>(&self, task: F, dependencies: &[(i32, &str)]) -> Result<()>
    where
        F: Fn(&Handle, Vec<Event>) + Send + Sync + 'static,
    {
        self.schedule(Arc::new(task), "", dependencies, true)
    }

    pub fn schedule_persistent_named_task<F>(
        &self,
        task: F,
        name: &str,
        dependencies: &[(i32, &str)],
    ) -> Result<()>
    where
        F: Fn(&Handle, Vec<Event>) + Send + Sync + 'static,
    {
        self.schedule(Arc::new(task), name, dependencies, true)
    }

    fn schedule(
        &self,
        task: TaskFn,
        name: &str,
        dependencies: &[(i32, &str)],
        persistent: bool,
    ) -> Result<()> {
        let keys = self.expand_dependencies(dependencies)?;
        self.inner.scheduler.register_task(task, name, keys, persistent);
        Ok(())
    }

    /// Expand sentinel sources: `ALL` becomes one dependency per rank,
    /// `SELF_RANK` resolves to the local rank, `ANY` stays a wildcard.
    fn expand_dependencies(&self, dependencies: &[(i32, &str)]) -> Result<Vec<DependencyKey>> {
        let num_ranks = self.num_ranks();
        let mut keys = Vec::with_capacity(dependencies.len());
        for &(source, id) in dependencies {
            match source {
                ALL => {
                    for rank in 0..num_ranks {
                        keys.push(DependencyKey::new(rank, id));
                    }
                }
                SELF_RANK => keys.push(DependencyKey::new(self.rank(), id)),
                ANY => keys.push(DependencyKey::new(ANY, id)),
                rank if (0..num_ranks).contains(&rank) => keys.push(DependencyKey::new(rank, id)),
                rank => bail!("invalid dependency source rank {}", rank),
            }
        }
        Ok(keys)
    }

    /// Fire a transient event at `target` (a rank, [`ALL`] or
    /// [`SELF_RANK`]).
    pub fn fire_event(&self, payload: Payload, target: i32, event_id: &str) -> Result<()> {
        self.fire(payload, target, false, event_id)
    }

    /// Fire a persistent event: it satisfies arbitrarily many dependencies
    /// and is only removed by explicit descheduling of the store.
    pub fn fire_persistent_event(
        &self,
        payload: Payload,
        target: i32,
        event_id: &str,
    ) -> Result<()> {
        self.fire(payload, target, true, event_id)
    }

    fn fire(&self, payload: Payload, target: i32, persistent: bool, event_id: &str) -> Result<()> {
        // Events fired by a running resilient task are write-ahead records:
        // the ledger holds them until the task completes. Fires from the
        // main thread (or any non-task thread) pass straight through.
        if let Some(ledger) = &self.inner.thread_ledger {
            if let Some(task_id) = ledger.current_task(std::thread::current().id()) {
                let target = self.resolve_target(target)?;
                let event =
                    Event::new(self.rank(), persistent, event_id.to_string(), payload);
                ledger.hold_event(task_id, target, event);
                return Ok(());
            }
        }
        self.inner
            .messaging
            .fire_event(payload, target, persistent, event_id)
    }

    /// Fire an event whose payload is the address of a context region
    /// created with [`Handle::create_context`].
    pub fn fire_context_event(
        &self,
        context: ContextRef,
        address: usize,
        target: i32,
        event_id: &str,
    ) -> Result<()> {
        if !self.inner.contexts.is_context_tag(context.tag()) {
            bail!("context was not defined on this rank");
        }
        if let Some(ledger) = &self.inner.thread_ledger {
            if let Some(task_id) = ledger.current_task(std::thread::current().id()) {
                let target = self.resolve_target(target)?;
                let event = Event::new_context(
                    self.rank(),
                    event_id.to_string(),
                    context.tag(),
                    address,
                );
                ledger.hold_event(task_id, target, event);
                return Ok(());
            }
        }
        self.inner
            .messaging
            .fire_context_event(context.tag(), address, target, event_id)
    }

    fn resolve_target(&self, target: i32) -> Result<i32> {
        let target = if target == SELF_RANK { self.rank() } else { target };
        if target != ALL && (target < 0 || target >= self.num_ranks()) {
            bail!("invalid target rank {}", target);
        }
        Ok(target)
    }

    /// Block the calling task until the given dependencies are satisfied
    /// and return their payloads. Only valid from a task running on a
    /// worker thread; the worker is parked, not spun.
    pub fn wait_on(&self, dependencies: &[(i32, &str)]) -> Result<Vec<Event>> {
        if dependencies.is_empty() {
            bail!("wait_on requires at least one dependency");
        }
        if self.inner.pool.current_worker().is_none() {
            bail!("wait_on may only be called from a task running on a worker");
        }
        let keys = self.expand_dependencies(dependencies)?;
        Ok(self.inner.scheduler.pause_task(keys))
    }

    /// Non-blocking poll of the outstanding-event store: returns whichever
    /// of the given dependencies have an event ready, possibly none.
    pub fn find_events(&self, dependencies: &[(i32, &str)]) -> Result<Vec<Event>> {
        let keys = self.expand_dependencies(dependencies)?;
        Ok(self.inner.scheduler.retrieve_any_matching_events(keys))
    }

    pub fn is_task_scheduled(&self, name: &str) -> bool {
        self.inner.scheduler.is_task_scheduled(name)
    }

    /// Remove a named task from the registered list. Returns false for
    /// unknown names, without side effects.
    pub fn deschedule_task(&self, name: &str) -> bool {
        self.inner.scheduler.deschedule_task(name)
    }

    /// Define a context kind of `size` bytes.
    pub fn define_context(&self, size: usize) -> ContextRef {
        self.inner.contexts.define(size)
    }

    /// Allocate an instance of a context kind, returning its address.
    pub fn create_context(&self, context: ContextRef) -> usize {
        self.inner.contexts.create(context)
    }

    /// Declare the task running on `thread_id` failed; the resilience
    /// ledger purges its held events and reschedules it.
    pub fn report_thread_failure(&self, thread_id: ThreadId) -> Result<()> {
        match &self.inner.thread_ledger {
            Some(ledger) => {
                ledger.report_thread_failure(thread_id);
                Ok(())
            }
            None => bail!("resilience is not enabled"),
        }
    }

    pub(crate) fn thread_ledger(&self) -> Option<Arc<ThreadLedger>> {
        self.inner.thread_ledger.clone()
    }

    pub(crate) fn process_ledger(&self) -> Option<Arc<ProcessLedger>> {
        self.inner.process_ledger.clone()
    }

    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }
}

/// Name-keyed task functions used to resolve persisted tasks at recovery.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    map: HashMap<String, TaskFn>,
}

impl FunctionRegistry {
    pub fn new() -> FunctionRegistry {
        FunctionRegistry::default()
    }

    pub fn register<F>(&mut self, name: &str, task: F) -> &mut FunctionRegistry
    where
        F: Fn(&Handle, Vec<Event>) + Send + Sync + 'static,
    {
        self.map.insert(name.to_string(), Arc::new(task));
        self
    }

    fn get(&self, name: &str) -> Option<TaskFn> {
        self.map.get(name).cloned()
    }
}

/// An initialised rank of the job. Owns the lifecycle: build, run, and the
/// collective `finalise`.
pub struct Runtime {
    handle: Handle,
    finalised: AtomicBool,
}

impl Runtime {
    pub(crate) fn new(handle: Handle) -> Runtime {
        Runtime {
            handle,
            finalised: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    pub fn rank(&self) -> i32 {
        self.handle.rank()
    }

    pub fn num_ranks(&self) -> i32 {
        self.handle.num_ranks()
    }

    /// Collective shutdown: every rank must call this. Blocks until the
    /// termination protocol proves global quiescence, then stops workers
    /// and the polling loop. When the main thread is a worker it serves
    /// tasks while it waits here.
    pub fn finalise(&self) -> Result<()> {
        if self.finalised.swap(true, Ordering::AcqRel) {
            bail!("finalise called twice");
        }
        let inner = self.handle.inner();
        inner.messaging.begin_shutdown();

        if inner.cfg.main_thread_worker {
            inner.pool.run_main_until_released();
        } else {
            while !inner.messaging.polling_stopped() {
                if !inner.messaging.has_progress_thread() && inner.pool.try_claim_poll() {
                    let messaging = inner.messaging.clone();
                    inner.messaging.poll_while(move || !messaging.polling_stopped());
                    inner.pool.release_poll();
                } else {
                    std::thread::sleep(Duration::from_micros(50));
                }
            }
        }

        inner.messaging.finalise();
        inner.pool.shutdown();
        if let Some(ledger) = &inner.process_ledger {
            ledger.finalise()?;
            info!(path = %ledger.path().display(), "scheduling ledger sealed");
        }
        inner.messaging.transport().barrier();
        Ok(())
    }

    /// Drop all scheduled state and restart the polling machinery, keeping
    /// the worker pool. Used after a recovery to run the job again.
    pub fn restart(&self) -> Result<()> {
        if self.finalised.load(Ordering::Acquire) {
            bail!("cannot restart a finalised runtime");
        }
        self.handle.inner().scheduler.reset();
        self.handle.inner().messaging.reset_polling();
        Ok(())
    }

    /// Stop polling and the worker pool without the collective protocol.
    /// For runtimes abandoned before `finalise` (error paths, tests).
    fn teardown(&self) {
        let inner = self.handle.inner();
        inner.messaging.finalise();
        inner.pool.shutdown();
    }

    /// Replay a sealed scheduling ledger: re-register every task that never
    /// completed (resolving functions by name through the registry) and
    /// every event not consumed by a completed task. Returns how many tasks
    /// were re-registered.
    pub fn recover<P: AsRef<Path>>(
        &self,
        path: P,
        registry: &FunctionRegistry,
    ) -> Result<usize> {
        let records = ProcessLedger::load(path)?;
        let recovered = ProcessLedger::replay(records);
        let scheduler = &self.handle.inner().scheduler;
        let mut registered = 0;
        for task in recovered.tasks {
            let Some(task_fn) = registry.get(&task.name) else {
                warn!(
                    name = %task.name,
                    "no function registered for recovered task, skipping"
                );
                continue;
            };
            scheduler.register_task(task_fn, &task.name, task.order, task.persistent);
            registered += 1;
        }
        for event in recovered.events {
            scheduler.register_event(event);
        }
        Ok(registered)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if !self.finalised.load(Ordering::Acquire) {
            self.teardown();
        }
    }
}
