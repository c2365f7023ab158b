//! Distributed event-driven task scheduling.
//!
//! Each process (rank) in a parallel job registers tasks whose execution is
//! gated on the arrival of named, typed events. Events may be fired locally
//! or sent from peer ranks over a point-to-point [`transport::Transport`].
//! Once the conjunction of a task's declared dependencies is satisfied, the
//! task is dispatched to a worker thread.
//!
//! ```no_run
//! use edat::transport::memory::MemoryFabric;
//! use edat::{Builder, Payload};
//!
//! let transport = MemoryFabric::new(1).remove(0);
//! let runtime = Builder::new().transport(transport).try_build().unwrap();
//! let handle = runtime.handle();
//!
//! handle
//!     .schedule_task(
//!         |_h, events| println!("got {:?}", events[0].as_i32s()),
//!         &[(0, "ping")],
//!     )
//!     .unwrap();
//! handle.fire_event(Payload::from_i32s(&[42]), 0, "ping").unwrap();
//! runtime.finalise().unwrap();
//! ```

pub mod config;

pub mod context;

pub mod event;
pub use event::{DependencyKey, Event, EventType, Payload, ALL, ANY, SELF_RANK};

pub(crate) mod ledger;

pub(crate) mod messaging;

pub(crate) mod pool;

pub mod runtime;
pub use runtime::{Builder, Handle, Runtime};

pub(crate) mod scheduler;

#[cfg(test)]
pub(crate) mod test_utils;

pub mod transport;
