//! Per-session ordering by arrival ticket.
//!
//! Every inbound message draws one ticket per [`Lane`] in arrival order.
//! Intake tickets keep PreProcess in arrival order; outbound tickets let a
//! context that wants strict ordering wait until all earlier arrivals have
//! finished before it sends. Tickets finish on every exit path (reply sent,
//! halted, failed), so a failed context never blocks the rest of the session.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

use super::registry::Session;

/// Which per-session ordering a ticket belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Admission of the inbound message (PreProcess).
    Intake,
    /// Sending of the reply.
    Outbound,
}

/// Arrival-order ticket dispenser for one session lane.
pub struct ArrivalSequencer {
    next_ticket: AtomicU64,
    finished: Mutex<FinishedTickets>,
    /// Every ticket below this value has finished.
    low_water_tx: watch::Sender<u64>,
}

#[derive(Default)]
struct FinishedTickets {
    low_water: u64,
    out_of_order: BTreeSet<u64>,
}

impl ArrivalSequencer {
    pub fn new() -> Self {
        let (low_water_tx, _rx) = watch::channel(0);
        Self {
            next_ticket: AtomicU64::new(0),
            finished: Mutex::new(FinishedTickets::default()),
            low_water_tx,
        }
    }

    /// Draw the next ticket.
    pub fn issue(&self) -> u64 {
        self.next_ticket.fetch_add(1, Ordering::SeqCst)
    }

    /// Wait until every ticket issued before `ticket` has finished.
    pub async fn wait_turn(&self, ticket: u64) {
        let mut rx = self.low_water_tx.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|low_water| *low_water >= ticket).await;
    }

    /// Mark `ticket` finished.
    pub fn finish(&self, ticket: u64) {
        let mut guard = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        let finished = &mut *guard;
        finished.out_of_order.insert(ticket);
        let start = finished.low_water;
        while finished.out_of_order.remove(&finished.low_water) {
            finished.low_water += 1;
        }
        if finished.low_water != start {
            self.low_water_tx.send_replace(finished.low_water);
        }
    }

    /// Lowest ticket that has not finished yet.
    pub fn low_water(&self) -> u64 {
        *self.low_water_tx.borrow()
    }
}

impl Default for ArrivalSequencer {
    fn default() -> Self {
        Self::new()
    }
}

/// A drawn ticket that finishes itself when dropped.
pub struct SequenceTicket {
    session: Arc<Session>,
    lane: Lane,
    ticket: u64,
}

impl SequenceTicket {
    /// Draw the next arrival ticket for `session` on `lane`.
    pub fn issue(session: Arc<Session>, lane: Lane) -> Self {
        let ticket = session.sequencer(lane).issue();
        Self {
            session,
            lane,
            ticket,
        }
    }

    pub fn number(&self) -> u64 {
        self.ticket
    }

    /// Wait until all earlier arrivals on this session have finished.
    pub async fn wait_turn(&self) {
        self.session.sequencer(self.lane).wait_turn(self.ticket).await;
    }
}

impl Drop for SequenceTicket {
    fn drop(&mut self) {
        self.session.sequencer(self.lane).finish(self.ticket);
    }
}
