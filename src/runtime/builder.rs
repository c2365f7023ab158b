use crate::config::{self, Config};
use crate::context::ContextManager;
use crate::ledger::process::ProcessLedger;
use crate::ledger::thread::ThreadLedger;
use crate::messaging::{Messaging, MessagingConfig};
use crate::pool::{ThreadNameFn, ThreadPool};
use crate::runtime::runtime::{Inner, Runtime};
use crate::runtime::Handle;
use crate::scheduler::Scheduler;
use crate::transport::Transport;
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;

fn default_thread_name_fn() -> ThreadNameFn {
    ThreadNameFn(Arc::new(|idx| format!("edat-worker-{}", idx)))
}

/// Configures and assembles a [`Runtime`].
///
/// Explicit setters win over the string-keyed [`Config`] table, which wins
/// over the built-in defaults.
pub struct Builder {
    transport: Option<Arc<dyn Transport>>,
    options: Config,
    worker_threads: Option<usize>,
    main_thread_worker: Option<bool>,
    progress_thread: Option<bool>,
    batch_events: Option<bool>,
    max_batched_events: Option<usize>,
    batch_timeout: Option<Duration>,
    enable_bridge: Option<bool>,
    resilience: Option<i32>,
    ledger_path: Option<PathBuf>,
    thread_name: ThreadNameFn,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            transport: None,
            options: Config::new(),
            worker_threads: None,
            main_thread_worker: None,
            progress_thread: None,
            batch_events: None,
            max_batched_events: None,
            batch_timeout: None,
            enable_bridge: None,
            resilience: None,
            ledger_path: None,
            thread_name: default_thread_name_fn(),
        }
    }

    /// The point-to-point message layer carrying this rank.
    pub fn transport<T: Transport>(mut self, transport: T) -> Builder {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn transport_arc(mut self, transport: Arc<dyn Transport>) -> Builder {
        self.transport = Some(transport);
        self
    }

    /// Merge a string-keyed option table (see [`crate::config`]).
    pub fn options(mut self, options: Config) -> Builder {
        self.options = options;
        self
    }

    /// Merge the recognised keys from the process environment.
    pub fn options_from_env(mut self) -> Builder {
        self.options = Config::from_env();
        self
    }

    pub fn worker_threads(mut self, count: usize) -> Builder {
        assert!(count > 0, "worker threads cannot be set to 0");
        self.worker_threads = Some(count);
        self
    }

    /// Use the process-main thread as the last worker (default true). The
    /// main thread serves tasks once it enters `finalise`.
    pub fn main_thread_worker(mut self, yes: bool) -> Builder {
        self.main_thread_worker = Some(yes);
        self
    }

    /// Run the polling loop on a dedicated progress thread (default true);
    /// otherwise idle workers steal the loop.
    pub fn progress_thread(mut self, yes: bool) -> Builder {
        self.progress_thread = Some(yes);
        self
    }

    pub fn batch_events(mut self, yes: bool) -> Builder {
        self.batch_events = Some(yes);
        self
    }

    pub fn max_batched_events(mut self, count: usize) -> Builder {
        assert!(count > 0, "batch threshold cannot be 0");
        self.max_batched_events = Some(count);
        self
    }

    pub fn batch_timeout(mut self, timeout: Duration) -> Builder {
        self.batch_timeout = Some(timeout);
        self
    }

    pub fn enable_bridge(mut self, yes: bool) -> Builder {
        self.enable_bridge = Some(yes);
        self
    }

    /// Resilience level: 0 = off, 1 = thread-failure rescue, 2 = thread
    /// rescue plus a persisted scheduling ledger.
    pub fn resilience(mut self, level: i32) -> Builder {
        self.resilience = Some(level);
        self
    }

    /// Where the level-2 ledger file lives. Defaults to
    /// `edat-ledger-<rank>.bin` in the working directory.
    pub fn ledger_path(mut self, path: impl Into<PathBuf>) -> Builder {
        self.ledger_path = Some(path.into());
        self
    }

    pub fn thread_name_fn<F>(mut self, f: F) -> Builder
    where
        F: Fn(usize) -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Assemble the runtime: thread pool, scheduler, messaging, ledgers,
    /// and start the polling loop.
    pub fn try_build(self) -> Result<Runtime> {
        let transport = self
            .transport
            .as_ref()
            .cloned()
            .context("a transport is required to build the runtime")?;
        let rank = transport.rank();
        let cfg = RuntimeConfig::try_from(self)?;

        let pool = ThreadPool::new(
            cfg.worker_threads,
            cfg.main_thread_worker,
            cfg.thread_name.clone(),
        );
        let scheduler = Scheduler::new(pool.clone(), cfg.resilience);
        let messaging = Messaging::new(
            transport.clone(),
            scheduler.clone(),
            pool.clone(),
            MessagingConfig {
                batch_events: cfg.batch_events,
                max_batched_events: cfg.max_batched_events,
                batch_timeout: cfg.batch_timeout,
                enable_bridge: cfg.enable_bridge,
                progress_thread: cfg.progress_thread,
            },
        );
        pool.set_messaging(messaging.clone());

        let thread_ledger = if cfg.resilience > 0 {
            let ledger = ThreadLedger::new(scheduler.clone(), messaging.clone());
            scheduler.wire_thread_ledger(ledger.clone());
            if rank == 0 {
                info!(level = cfg.resilience, "resilience active");
            }
            Some(ledger)
        } else {
            None
        };

        let process_ledger = if cfg.resilience >= 2 {
            let path = cfg
                .ledger_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(format!("edat-ledger-{}.bin", rank)));
            let ledger = ProcessLedger::create(path)?;
            scheduler.wire_process_ledger(ledger.clone());
            Some(ledger)
        } else {
            None
        };

        let inner = Arc::new(Inner {
            cfg,
            contexts: ContextManager::new(),
            scheduler: scheduler.clone(),
            pool,
            messaging: messaging.clone(),
            thread_ledger,
            process_ledger,
        });
        let handle = Handle::new(inner);
        scheduler.wire_handle(handle.clone());
        messaging.start();
        Ok(Runtime::new(handle))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}

/// Fully resolved configuration, shared by every component.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) worker_threads: usize,
    pub(crate) main_thread_worker: bool,
    pub(crate) progress_thread: bool,
    pub(crate) batch_events: bool,
    pub(crate) max_batched_events: usize,
    pub(crate) batch_timeout: Duration,
    pub(crate) enable_bridge: bool,
    pub(crate) resilience: i32,
    pub(crate) ledger_path: Option<PathBuf>,
    pub(crate) thread_name: ThreadNameFn,
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let options = &builder.options;
        let worker_threads = match builder.worker_threads {
            Some(count) => count,
            None => {
                let fallback = thread::available_parallelism().map_or(1, |n| n.get());
                let raw = options.get_int(config::NUM_THREADS, fallback as i64)?;
                usize::try_from(raw).context("EDAT_NUM_THREADS must be positive")?
            }
        };
        let cfg = RuntimeConfig {
            worker_threads,
            main_thread_worker: match builder.main_thread_worker {
                Some(yes) => yes,
                None => options.get_bool(config::MAIN_THREAD_WORKER, true)?,
            },
            progress_thread: match builder.progress_thread {
                Some(yes) => yes,
                None => options.get_bool(config::PROGRESS_THREAD, true)?,
            },
            batch_events: match builder.batch_events {
                Some(yes) => yes,
                None => options.get_bool(config::BATCH_EVENTS, false)?,
            },
            max_batched_events: match builder.max_batched_events {
                Some(count) => count,
                None => {
                    let raw = options.get_int(config::MAX_BATCHED_EVENTS, 1000)?;
                    usize::try_from(raw).context("EDAT_MAX_BATCHED_EVENTS must be positive")?
                }
            },
            batch_timeout: match builder.batch_timeout {
                Some(timeout) => timeout,
                None => {
                    let secs = options.get_float(config::BATCHING_EVENTS_TIMEOUT, 0.1)?;
                    if !secs.is_finite() || secs < 0.0 {
                        bail!("EDAT_BATCHING_EVENTS_TIMEOUT must be non-negative");
                    }
                    Duration::from_secs_f64(secs)
                }
            },
            enable_bridge: match builder.enable_bridge {
                Some(yes) => yes,
                None => options.get_bool(config::ENABLE_BRIDGE, false)?,
            },
            resilience: match builder.resilience {
                Some(level) => level,
                None => i32::try_from(options.get_int(config::RESILIENCE, 0)?)
                    .context("EDAT_RESILIENCE out of range")?,
            },
            ledger_path: builder.ledger_path,
            thread_name: builder.thread_name,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            bail!("worker thread count must be positive");
        }
        if self.max_batched_events == 0 {
            bail!("batch threshold must be positive");
        }
        if !(0..=2).contains(&self.resilience) {
            bail!("resilience level {} is not in 0..=2", self.resilience);
        }
        Ok(())
    }
}
