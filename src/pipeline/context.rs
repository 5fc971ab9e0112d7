//! Per-message state carried through the pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{PetError, Result};
use crate::pipeline::backend::AgentReply;
use crate::protocol::{InboundKind, InboundMessage, OutboundMessage};
use crate::session::{ConnectionId, Lane, SequenceTicket, Session};

/// Capability to push outbound messages onto one connection.
#[derive(Clone)]
pub struct OutboundSender {
    connection: ConnectionId,
    tx: mpsc::Sender<OutboundMessage>,
}

impl OutboundSender {
    pub fn new(connection: ConnectionId, tx: mpsc::Sender<OutboundMessage>) -> Self {
        Self { connection, tx }
    }

    /// Queue `message` for the connection.
    ///
    /// # Errors
    ///
    /// Returns [`PetError::Channel`] when the connection has gone away.
    pub async fn send(&self, message: OutboundMessage) -> Result<()> {
        self.tx.send(message).await.map_err(|e| {
            PetError::Channel(format!(
                "outbound send on {} failed: connection closed ({})",
                self.connection,
                e.0.kind.as_str()
            ))
        })
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }
}

/// Normalized form of the inbound event, attached by PreProcess.
#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub kind: InboundKind,
    /// Text handed to the agent backend.
    pub text: String,
    /// Priority of the response this event triggers.
    pub priority: i32,
}

/// State for one inbound message's trip through the pipeline.
///
/// Dropped when execution finishes; nothing attached here outlives it.
pub struct PipelineContext {
    pub inbound: InboundMessage,
    pub session: Arc<Session>,
    outbound: OutboundSender,
    /// Released once PreProcess has admitted (or halted) the message.
    intake: Option<SequenceTicket>,
    ticket: SequenceTicket,
    /// Set by PreProcess.
    pub intent: Option<Intent>,
    /// Set by Process.
    pub reply: Option<AgentReply>,
    /// Free-form scratch space for spliced-in stages.
    pub extras: HashMap<String, serde_json::Value>,
}

impl PipelineContext {
    /// Build a context and draw its arrival tickets on `session`.
    pub fn new(inbound: InboundMessage, session: Arc<Session>, outbound: OutboundSender) -> Self {
        let intake = SequenceTicket::issue(Arc::clone(&session), Lane::Intake);
        let ticket = SequenceTicket::issue(Arc::clone(&session), Lane::Outbound);
        Self {
            inbound,
            session,
            outbound,
            intake: Some(intake),
            ticket,
            intent: None,
            reply: None,
            extras: HashMap::new(),
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.outbound.connection()
    }

    /// Arrival position of this message within its session.
    pub fn arrival(&self) -> u64 {
        self.ticket.number()
    }

    /// Send one outbound message to this context's connection.
    pub async fn send(&self, message: OutboundMessage) -> Result<()> {
        self.outbound.send(message).await
    }

    /// Wait until every earlier arrival on this session has been admitted.
    pub async fn wait_intake_turn(&self) {
        if let Some(intake) = &self.intake {
            intake.wait_turn().await;
        }
    }

    /// Let the next arrival on this session be admitted.
    pub fn release_intake(&mut self) {
        self.intake = None;
    }

    /// Wait until every earlier arrival on this session has finished.
    pub async fn wait_outbound_turn(&self) {
        self.ticket.wait_turn().await;
    }
}
