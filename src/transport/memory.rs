//! In-process transport fabric.
//!
//! Wires N ranks of one OS process together through per-rank mailboxes.
//! Useful for tests and single-node experiments; every guarantee the trait
//! asks for (in-order delivery per peer, synchronous-mode completion) holds
//! by construction.

use crate::transport::{Comm, Envelope, SendHandle, Transport};
use anyhow::{bail, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Barrier};

struct InFlight {
    source: i32,
    tag: i32,
    payload: Vec<u8>,
    handle: SendHandle,
}

impl InFlight {
    fn matches(&self, source: Option<i32>, tag: i32) -> bool {
        self.tag == tag && source.map_or(true, |s| s == self.source)
    }
}

#[derive(Default)]
struct Mailbox {
    queue: Mutex<Vec<InFlight>>,
    arrived: Condvar,
}

struct Fabric {
    mailboxes: Vec<Mailbox>,
    barrier: Barrier,
}

/// Builder for a set of connected [`MemoryTransport`] endpoints, one per rank.
pub struct MemoryFabric;

impl MemoryFabric {
    pub fn new(num_ranks: usize) -> Vec<MemoryTransport> {
        assert!(num_ranks > 0, "fabric needs at least one rank");
        let fabric = Arc::new(Fabric {
            mailboxes: (0..num_ranks).map(|_| Mailbox::default()).collect(),
            barrier: Barrier::new(num_ranks),
        });
        (0..num_ranks)
            .map(|rank| MemoryTransport {
                rank: rank as i32,
                fabric: fabric.clone(),
            })
            .collect()
    }
}

pub struct MemoryTransport {
    rank: i32,
    fabric: Arc<Fabric>,
}

impl MemoryTransport {
    fn mailbox(&self, rank: i32) -> Option<&Mailbox> {
        self.fabric.mailboxes.get(rank as usize)
    }
}

impl Transport for MemoryTransport {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn num_ranks(&self) -> i32 {
        self.fabric.mailboxes.len() as i32
    }

    fn probe(&self, _comm: Comm, source: Option<i32>, tag: i32) -> Option<Envelope> {
        let mailbox = self.mailbox(self.rank).expect("own mailbox missing");
        let queue = mailbox.queue.lock();
        queue
            .iter()
            .find(|m| m.matches(source, tag))
            .map(|m| Envelope {
                source: m.source,
                tag: m.tag,
                len: m.payload.len(),
            })
    }

    fn recv(&self, _comm: Comm, source: i32, tag: i32) -> Result<Vec<u8>> {
        let mailbox = self.mailbox(self.rank).expect("own mailbox missing");
        let mut queue = mailbox.queue.lock();
        loop {
            if let Some(idx) = queue.iter().position(|m| m.matches(Some(source), tag)) {
                let msg = queue.remove(idx);
                // Synchronous-mode contract: the sender's handle completes
                // once the receiver has taken the message.
                msg.handle.complete();
                return Ok(msg.payload);
            }
            mailbox.arrived.wait(&mut queue);
        }
    }

    fn send(&self, _comm: Comm, target: i32, tag: i32, payload: Vec<u8>) -> Result<SendHandle> {
        let mailbox = match self.mailbox(target) {
            Some(mb) => mb,
            None => bail!("send to invalid rank {}", target),
        };
        let handle = SendHandle::new();
        mailbox.queue.lock().push(InFlight {
            source: self.rank,
            tag,
            payload,
            handle: handle.clone(),
        });
        mailbox.arrived.notify_all();
        Ok(handle)
    }

    fn barrier(&self) {
        self.fabric.barrier.wait();
    }
}
