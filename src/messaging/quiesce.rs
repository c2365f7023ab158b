//! Collective termination detection.
//!
//! A locally-quiescent rank may re-activate on an incoming message, so local
//! quiescence alone proves nothing. Rank 0 coordinates a two-phase
//! ID-comparison protocol: every rank draws a fresh random nonce each time
//! it goes quiescent and announces it; once the coordinator holds a nonce
//! from everyone it pings the workers, who confirm with their *current*
//! nonce (or -1 if they woke up again). Two consecutive rounds in which
//! every nonce is unchanged prove no rank re-activated in between - remote
//! activation needs a received message, and synchronous-mode sends ensure
//! such a message's sender cannot have completed the send without the
//! receiver noticing, which would have advanced the receiver's nonce.

use crate::transport::{Comm, SendHandle, Transport, QUIESCE_ANNOUNCE_TAG, QUIESCE_CONFIRM_TAG};
use anyhow::Result;
use tracing::{debug, trace};

/// Slot value for a rank currently active.
const ACTIVE: i32 = -1;

/// Slot value for a worker that has not yet confirmed this round.
const AWAITING: i32 = -2;

const COORDINATOR: i32 = 0;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Mode {
    /// Collecting announcements.
    Announce,
    /// Pinged the workers, collecting confirmations.
    Confirm,
}

#[derive(Debug)]
struct Coordinator {
    mode: Mode,
    /// Last announced nonce per rank, `ACTIVE` when unknown or active.
    tentative: Vec<i32>,
    /// Confirmation round, `AWAITING` until a rank replies.
    pingback: Vec<i32>,
}

#[derive(Debug, Default)]
struct WorkerSide {
    /// Willing to consume the next coordinator ping.
    ping_posted: bool,
    /// Replied to a ping, expecting a decision.
    decision_posted: bool,
    announce: Option<SendHandle>,
    confirm: Option<SendHandle>,
}

#[derive(Debug)]
pub(crate) struct QuiesceProtocol {
    rank: i32,
    num_ranks: i32,
    quiescent: bool,
    nonce: i32,
    coordinator: Option<Coordinator>,
    worker: WorkerSide,
}

impl QuiesceProtocol {
    pub(crate) fn new(rank: i32, num_ranks: i32) -> QuiesceProtocol {
        QuiesceProtocol {
            rank,
            num_ranks,
            quiescent: false,
            nonce: ACTIVE,
            coordinator: (rank == COORDINATOR).then(|| Coordinator {
                mode: Mode::Announce,
                tentative: vec![ACTIVE; num_ranks as usize],
                pingback: vec![ACTIVE; num_ranks as usize],
            }),
            worker: WorkerSide::default(),
        }
    }

    /// A message arrived: this rank is no longer quiescent.
    pub(crate) fn mark_active(&mut self) {
        self.quiescent = false;
        self.refresh_own_slot();
    }

    /// End-of-tick local quiescence observation. On the transition into
    /// quiescence a fresh nonce is drawn and (on workers) announced
    /// asynchronously to the coordinator.
    pub(crate) fn observe_local(&mut self, quiescent: bool, transport: &dyn Transport) -> Result<()> {
        if quiescent && !self.quiescent {
            self.nonce = fastrand::i32(1..i32::MAX);
            trace!(nonce = self.nonce, "rank went quiescent");
            if self.rank != COORDINATOR {
                // Skip the announce while a previous one is still in
                // flight; the pingback round will pick the change up.
                let in_flight = self.worker.announce.as_ref().is_some_and(|h| !h.is_complete());
                if !in_flight {
                    let handle = transport.send(
                        Comm::Primary,
                        COORDINATOR,
                        QUIESCE_ANNOUNCE_TAG,
                        self.nonce.to_le_bytes().to_vec(),
                    )?;
                    self.worker.announce = Some(handle);
                }
                self.worker.ping_posted = true;
            }
        }
        self.quiescent = quiescent;
        self.refresh_own_slot();
        Ok(())
    }

    /// The coordinator tracks its own state in slot 0 like any worker's.
    fn refresh_own_slot(&mut self) {
        let code = if self.quiescent { self.nonce } else { ACTIVE };
        if let Some(coordinator) = self.coordinator.as_mut() {
            coordinator.tentative[0] = code;
        }
    }

    /// One protocol step. Returns false when the collective decision is to
    /// terminate and polling should stop.
    pub(crate) fn step(&mut self, transport: &dyn Transport) -> Result<bool> {
        if self.coordinator.is_some() {
            self.coordinator_step(transport)
        } else {
            self.worker_step(transport)
        }
    }

    fn coordinator_step(&mut self, transport: &dyn Transport) -> Result<bool> {
        self.track_announcements(transport)?;
        let coordinator = self.coordinator.as_ref().expect("coordinator state missing");
        if coordinator.mode == Mode::Confirm {
            return self.collect_confirmations(transport);
        }
        Ok(true)
    }

    /// Mode 0: greedily drain announcements, and once every slot holds a
    /// nonce while we are quiescent ourselves, ping every worker and open
    /// the confirmation round.
    fn track_announcements(&mut self, transport: &dyn Transport) -> Result<()> {
        let quiescent = self.quiescent;
        let nonce = self.nonce;
        let num_ranks = self.num_ranks;
        let coordinator = self.coordinator.as_mut().expect("coordinator state missing");

        while let Some(env) = transport.probe(Comm::Primary, None, QUIESCE_ANNOUNCE_TAG) {
            let raw = transport.recv(Comm::Primary, env.source, QUIESCE_ANNOUNCE_TAG)?;
            coordinator.tentative[env.source as usize] = decode_word(&raw);
        }

        if coordinator.mode == Mode::Announce
            && quiescent
            && !coordinator.tentative.contains(&ACTIVE)
        {
            debug!("all ranks announced quiescence, starting confirmation round");
            coordinator.mode = Mode::Confirm;
            coordinator.pingback = vec![AWAITING; num_ranks as usize];
            coordinator.pingback[0] = nonce;
            for worker in 1..num_ranks {
                transport.send(Comm::Primary, worker, QUIESCE_ANNOUNCE_TAG, Vec::new())?;
            }
        }
        Ok(())
    }

    /// Mode 1: collect confirmations; once everyone replied, either
    /// terminate (two identical rounds) or broadcast "continue" and fall
    /// back to mode 0 with the fresher codes.
    fn collect_confirmations(&mut self, transport: &dyn Transport) -> Result<bool> {
        self.refresh_own_slot();
        let num_ranks = self.num_ranks;
        let coordinator = self.coordinator.as_mut().expect("coordinator state missing");

        while let Some(env) = transport.probe(Comm::Primary, None, QUIESCE_CONFIRM_TAG) {
            let raw = transport.recv(Comm::Primary, env.source, QUIESCE_CONFIRM_TAG)?;
            coordinator.pingback[env.source as usize] = decode_word(&raw);
        }
        if coordinator.pingback.contains(&AWAITING) {
            return Ok(true);
        }

        let all_quiescent = !coordinator.pingback.contains(&ACTIVE);
        let unchanged = coordinator.pingback == coordinator.tentative;
        let decision: i32 = i32::from(all_quiescent && unchanged);

        if decision == 0 {
            coordinator.mode = Mode::Announce;
            coordinator.tentative.copy_from_slice(&coordinator.pingback);
        } else {
            debug!("termination confirmed across {} ranks", num_ranks);
        }
        for worker in 1..num_ranks {
            transport.send(
                Comm::Primary,
                worker,
                QUIESCE_CONFIRM_TAG,
                decision.to_le_bytes().to_vec(),
            )?;
        }
        Ok(decision == 0)
    }

    fn worker_step(&mut self, transport: &dyn Transport) -> Result<bool> {
        // Coordinator ping: reply with the current nonce, or ACTIVE if this
        // rank woke up again since announcing.
        if self.worker.ping_posted
            && transport
                .probe(Comm::Primary, Some(COORDINATOR), QUIESCE_ANNOUNCE_TAG)
                .is_some()
        {
            transport.recv(Comm::Primary, COORDINATOR, QUIESCE_ANNOUNCE_TAG)?;
            if let Some(previous) = self.worker.confirm.take() {
                if !previous.is_complete() {
                    trace!("superseding an unconsumed confirmation");
                }
            }
            let code = if self.quiescent { self.nonce } else { ACTIVE };
            let handle = transport.send(
                Comm::Primary,
                COORDINATOR,
                QUIESCE_CONFIRM_TAG,
                code.to_le_bytes().to_vec(),
            )?;
            self.worker.confirm = Some(handle);
            self.worker.ping_posted = false;
            self.worker.decision_posted = true;
        }

        // Coordinator decision: stop polling, or re-arm for the next round.
        if self.worker.decision_posted
            && transport
                .probe(Comm::Primary, Some(COORDINATOR), QUIESCE_CONFIRM_TAG)
                .is_some()
        {
            let raw = transport.recv(Comm::Primary, COORDINATOR, QUIESCE_CONFIRM_TAG)?;
            self.worker.decision_posted = false;
            if decode_word(&raw) == 1 {
                return Ok(false);
            }
            self.worker.ping_posted = true;
        }
        Ok(true)
    }
}

fn decode_word(raw: &[u8]) -> i32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&raw[..4]);
    i32::from_le_bytes(word)
}
