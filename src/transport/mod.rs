//! Rank-addressed point-to-point transport.
//!
//! The messaging layer assumes a reliable, in-order message substrate with a
//! non-blocking probe, a receive, and a non-blocking *synchronous-mode* send:
//! the returned handle completes only once the peer has begun receiving the
//! message. The termination protocol's correctness argument rests on that
//! property, so implementations must not complete handles early.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod memory;

/// Tag carried by serialized data events.
pub const DATA_TAG: i32 = 16384;

/// Tag of quiescence announcements (worker -> coordinator) and of the
/// zero-byte pingback request (coordinator -> worker).
pub const QUIESCE_ANNOUNCE_TAG: i32 = 16385;

/// Tag of quiescence confirmations (worker -> coordinator) and of the
/// one-word decision (coordinator -> worker).
pub const QUIESCE_CONFIRM_TAG: i32 = 16386;

/// Logical communicator. `Global` only exists in bridge deployments where the
/// job is a sub-group of a larger one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comm {
    Primary,
    Global,
}

/// Result of a successful probe.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub source: i32,
    pub tag: i32,
    pub len: usize,
}

/// Completion handle of a non-blocking send. The owning side keeps the
/// serialized buffer alive until the handle reports complete.
#[derive(Clone, Debug)]
pub struct SendHandle {
    done: Arc<AtomicBool>,
}

impl SendHandle {
    pub fn new() -> SendHandle {
        SendHandle {
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn complete(&self) {
        self.done.store(true, Ordering::Release);
    }
}

impl Default for SendHandle {
    fn default() -> Self {
        SendHandle::new()
    }
}

pub trait Transport: Send + Sync + 'static {
    /// Zero-based index of this process in the job.
    fn rank(&self) -> i32;

    fn num_ranks(&self) -> i32;

    /// Non-blocking check for a pending message. `source` of `None` matches
    /// any sender. Returns the oldest matching message without removing it.
    fn probe(&self, comm: Comm, source: Option<i32>, tag: i32) -> Option<Envelope>;

    /// Receive the oldest message matching (source, tag), blocking until one
    /// arrives. Completes the sender's handle.
    fn recv(&self, comm: Comm, source: i32, tag: i32) -> Result<Vec<u8>>;

    /// Non-blocking synchronous-mode send.
    fn send(&self, comm: Comm, target: i32, tag: i32, payload: Vec<u8>) -> Result<SendHandle>;

    /// Collective barrier over the primary communicator.
    fn barrier(&self);

    /// Whether a distinct global communicator exists for bridge mode.
    fn has_global(&self) -> bool {
        false
    }
}
