//! Conversation sessions that survive reconnects.

pub mod registry;
pub mod sequencer;

pub use registry::{ConnectionId, HistoryEntry, HistoryRole, Session, SessionRegistry};
pub use sequencer::{ArrivalSequencer, Lane, SequenceTicket};
