//! Messaging core: fire paths, the polling loop, batching, send-progress
//! sweeps and the hook-up of the termination protocol.
//!
//! One tick of the polling loop: fire one queued startup event, every Nth
//! tick sweep outstanding sends, probe each configured communicator and
//! deliver anything pending, and - only on an idle tick - flush stale
//! batches and evaluate local quiescence. The loop runs on a dedicated
//! progress thread by default, or is stolen by one idle worker at a time.

use crate::event::{Event, Payload, ALL, SELF_RANK};
use crate::pool::ThreadPool;
use crate::scheduler::Scheduler;
use crate::transport::{Comm, Envelope, SendHandle, Transport, DATA_TAG};
use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::error;

pub(crate) mod quiesce;
pub(crate) mod wire;

use quiesce::QuiesceProtocol;

/// Outstanding-send sweep cadence, in polling iterations.
const SEND_PROGRESS_PERIOD: u32 = 10;

#[derive(Debug, Clone)]
pub(crate) struct MessagingConfig {
    pub(crate) batch_events: bool,
    pub(crate) max_batched_events: usize,
    pub(crate) batch_timeout: Duration,
    pub(crate) enable_bridge: bool,
    pub(crate) progress_thread: bool,
}

#[derive(Default)]
struct BatchStore {
    events: Vec<Event>,
    last_arrival: Option<Instant>,
}

pub(crate) struct Messaging {
    transport: Arc<dyn Transport>,
    scheduler: Arc<Scheduler>,
    pool: Arc<ThreadPool>,
    cfg: MessagingConfig,
    /// Handles of sends whose receipt has not been confirmed yet. Local
    /// quiescence requires this to be empty.
    outstanding_sends: Mutex<Vec<SendHandle>>,
    /// Events fired locally before polling went live; drained one per tick.
    startup_queue: Mutex<VecDeque<Event>>,
    started: AtomicBool,
    batch: Mutex<BatchStore>,
    continue_polling: AtomicBool,
    stopped: AtomicBool,
    /// The termination protocol only decides once the application has
    /// entered finalise on this rank.
    eligible_for_termination: AtomicBool,
    quiesce: Mutex<QuiesceProtocol>,
    progress: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Messaging {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        scheduler: Arc<Scheduler>,
        pool: Arc<ThreadPool>,
        cfg: MessagingConfig,
    ) -> Arc<Messaging> {
        let rank = transport.rank();
        let num_ranks = transport.num_ranks();
        Arc::new(Messaging {
            transport,
            scheduler,
            pool,
            cfg,
            outstanding_sends: Mutex::new(Vec::new()),
            startup_queue: Mutex::new(VecDeque::new()),
            started: AtomicBool::new(false),
            batch: Mutex::new(BatchStore::default()),
            continue_polling: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            eligible_for_termination: AtomicBool::new(false),
            quiesce: Mutex::new(QuiesceProtocol::new(rank, num_ranks)),
            progress: Mutex::new(None),
        })
    }

    /// Mark the layer live and launch the progress thread when configured.
    pub(crate) fn start(self: &Arc<Messaging>) {
        self.started.store(true, Ordering::Release);
        if self.cfg.progress_thread {
            let messaging = Arc::clone(self);
            let handle = thread::Builder::new()
                .name("edat-progress".into())
                .spawn(move || messaging.run_polling_loop())
                .expect("failed to spawn progress thread");
            *self.progress.lock() = Some(handle);
        }
    }

    pub(crate) fn rank(&self) -> i32 {
        self.transport.rank()
    }

    pub(crate) fn num_ranks(&self) -> i32 {
        self.transport.num_ranks()
    }

    pub(crate) fn has_progress_thread(&self) -> bool {
        self.cfg.progress_thread
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Fire an event at `target`: local delivery for the own rank and the
    /// broadcast sentinel, a serialized send per remote target.
    pub(crate) fn fire_event(
        &self,
        payload: Payload,
        target: i32,
        persistent: bool,
        event_id: &str,
    ) -> Result<()> {
        let my_rank = self.rank();
        let target = if target == SELF_RANK { my_rank } else { target };
        if target != ALL && (target < 0 || target >= self.num_ranks()) {
            bail!("invalid target rank {}", target);
        }
        let event = Event::new(my_rank, persistent, event_id.to_string(), payload);
        self.route(event, target)
    }

    /// Fire an event carrying the address of a process-local context region.
    pub(crate) fn fire_context_event(
        &self,
        tag: i32,
        address: usize,
        target: i32,
        event_id: &str,
    ) -> Result<()> {
        let my_rank = self.rank();
        let target = if target == SELF_RANK { my_rank } else { target };
        if target != ALL && (target < 0 || target >= self.num_ranks()) {
            bail!("invalid target rank {}", target);
        }
        let event = Event::new_context(my_rank, event_id.to_string(), tag, address);
        self.route(event, target)
    }

    /// Re-fire an already-built event, used by the resilience ledger when it
    /// releases held events. The target was validated when the event was
    /// held.
    pub(crate) fn fire_prebuilt(&self, event: Event, target: i32) -> Result<()> {
        self.route(event, target)
    }

    fn route(&self, event: Event, target: i32) -> Result<()> {
        let my_rank = self.rank();
        if target != my_rank && target != ALL {
            return self.send_single(&event, target);
        }
        if target == ALL {
            for peer in 0..self.num_ranks() {
                if peer != my_rank {
                    self.send_single(&event, peer)?;
                }
            }
        }
        self.deliver_local(event);
        Ok(())
    }

    fn deliver_local(&self, event: Event) {
        if self.started.load(Ordering::Acquire) {
            self.scheduler.register_event(event);
        } else {
            self.startup_queue.lock().push_back(event);
        }
    }

    fn send_single(&self, event: &Event, target: i32) -> Result<()> {
        let packet = wire::encode_event(event);
        let handle = self.transport.send(Comm::Primary, target, DATA_TAG, packet)?;
        self.outstanding_sends.lock().push(handle);
        Ok(())
    }

    /// One polling-loop tick. Returns false once the collective decision is
    /// to terminate.
    pub(crate) fn poll_tick(&self, iteration: &mut u32) -> Result<bool> {
        self.fire_one_startup_event();

        if *iteration >= SEND_PROGRESS_PERIOD {
            self.sweep_send_progress();
            *iteration = 0;
        } else {
            *iteration += 1;
        }

        let mut pending = false;
        if let Some(env) = self.transport.probe(Comm::Primary, None, DATA_TAG) {
            self.handle_remote_arrival(Comm::Primary, env)?;
            pending = true;
        }
        if self.cfg.enable_bridge && self.transport.has_global() {
            if let Some(env) = self.transport.probe(Comm::Global, None, DATA_TAG) {
                self.handle_remote_arrival(Comm::Global, env)?;
                pending = true;
            }
        }

        if pending {
            self.quiesce.lock().mark_active();
        } else {
            self.flush_batch_if_stale();
            let quiescent = self.is_locally_finished();
            self.quiesce
                .lock()
                .observe_local(quiescent, self.transport.as_ref())?;
        }

        if self.eligible_for_termination.load(Ordering::Acquire) {
            self.quiesce.lock().step(self.transport.as_ref())
        } else {
            Ok(true)
        }
    }

    fn handle_remote_arrival(&self, comm: Comm, env: Envelope) -> Result<()> {
        let packet = self.transport.recv(comm, env.source, DATA_TAG)?;
        let event = wire::decode_event(&packet)
            .unwrap_or_else(|err| panic!("malformed event packet from rank {}: {:#}", env.source, err));
        if self.cfg.batch_events {
            let flush = {
                let mut batch = self.batch.lock();
                batch.events.push(event);
                batch.last_arrival = Some(Instant::now());
                (batch.events.len() >= self.cfg.max_batched_events)
                    .then(|| std::mem::take(&mut batch.events))
            };
            if let Some(events) = flush {
                self.scheduler.register_events(events);
            }
        } else {
            self.scheduler.register_event(event);
        }
        Ok(())
    }

    fn flush_batch_if_stale(&self) {
        if !self.cfg.batch_events {
            return;
        }
        let flush = {
            let mut batch = self.batch.lock();
            let stale = !batch.events.is_empty()
                && batch
                    .last_arrival
                    .is_some_and(|at| at.elapsed() >= self.cfg.batch_timeout);
            stale.then(|| std::mem::take(&mut batch.events))
        };
        if let Some(events) = flush {
            self.scheduler.register_events(events);
        }
    }

    fn fire_one_startup_event(&self) {
        let event = self.startup_queue.lock().pop_front();
        if let Some(event) = event {
            self.scheduler.register_event(event);
        }
    }

    /// Drop completed send handles; the serialized buffers they guard go
    /// with them.
    fn sweep_send_progress(&self) {
        self.outstanding_sends
            .lock()
            .retain(|handle| !handle.is_complete());
    }

    /// Local quiescence: nothing probed on any communicator, no outstanding
    /// sends, empty batch and startup buffers, scheduler finished and the
    /// thread pool idle. The pool condition matters because a dispatched
    /// task can still fire events after the scheduler has emptied.
    pub(crate) fn is_locally_finished(&self) -> bool {
        if self.transport.probe(Comm::Primary, None, DATA_TAG).is_some() {
            return false;
        }
        if self.cfg.enable_bridge
            && self.transport.has_global()
            && self.transport.probe(Comm::Global, None, DATA_TAG).is_some()
        {
            return false;
        }
        self.outstanding_sends.lock().is_empty()
            && self.batch.lock().events.is_empty()
            && self.startup_queue.lock().is_empty()
            && self.pool.is_idle()
            && self.scheduler.is_finished()
    }

    /// Called at the top of finalise: from here on the termination protocol
    /// may decide.
    pub(crate) fn begin_shutdown(&self) {
        self.eligible_for_termination.store(true, Ordering::Release);
    }

    pub(crate) fn polling_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Dedicated progress-thread body.
    fn run_polling_loop(&self) {
        let mut iteration = 0u32;
        while self.continue_polling.load(Ordering::Acquire) {
            match self.poll_tick(&mut iteration) {
                Ok(true) => thread::yield_now(),
                Ok(false) => break,
                Err(err) => {
                    error!(?err, "fatal transport failure in polling loop");
                    panic!("fatal transport failure in polling loop: {:#}", err);
                }
            }
        }
        self.mark_stopped();
    }

    /// Polling body for a stolen loop (an idle worker or the finalising main
    /// thread). `keep` turning false relinquishes the duty.
    pub(crate) fn poll_while(&self, keep: impl Fn() -> bool) {
        let mut iteration = 0u32;
        while keep()
            && self.continue_polling.load(Ordering::Acquire)
            && !self.stopped.load(Ordering::Acquire)
        {
            match self.poll_tick(&mut iteration) {
                Ok(true) => thread::yield_now(),
                Ok(false) => {
                    self.mark_stopped();
                    break;
                }
                Err(err) => {
                    error!(?err, "fatal transport failure in polling loop");
                    panic!("fatal transport failure in polling loop: {:#}", err);
                }
            }
        }
    }

    fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::Release);
        self.pool.release_main();
    }

    /// Force the polling loop down and join the progress thread.
    pub(crate) fn finalise(&self) {
        self.continue_polling.store(false, Ordering::Release);
        if let Some(handle) = self.progress.lock().take() {
            if handle.join().is_err() {
                error!("progress thread panicked");
            }
        }
    }

    /// Restart support: reset protocol and polling state and relaunch the
    /// progress thread. Only call on a fully quiesced runtime.
    pub(crate) fn reset_polling(self: &Arc<Messaging>) {
        self.finalise();
        *self.quiesce.lock() = QuiesceProtocol::new(self.rank(), self.num_ranks());
        self.eligible_for_termination.store(false, Ordering::Release);
        self.stopped.store(false, Ordering::Release);
        self.continue_polling.store(true, Ordering::Release);
        self.start();
    }
}
