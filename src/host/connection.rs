//! Binding of transport connections to sessions and the pipeline.
//!
//! A transport (stdio, WebSocket) opens a connection against a session key,
//! feeds each inbound text frame to [`ConnectionHandle::handle_text`], and
//! writes whatever arrives on the returned outbound receiver.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::PetConfig;
use crate::error::Result;
use crate::pipeline::{
    AgentBackend, ExecutionReport, OutboundSender, PipelineContext, PipelineExecutor,
    build_default_pipeline,
};
use crate::protocol::{InboundMessage, MessageType, OutboundMessage};
use crate::session::{ConnectionId, Session, SessionRegistry};

/// Process-wide state shared by every connection.
pub struct AgentServer {
    registry: SessionRegistry,
    executor: Arc<PipelineExecutor>,
    config: PetConfig,
}

impl AgentServer {
    pub fn new(config: PetConfig, executor: PipelineExecutor) -> Self {
        Self {
            registry: SessionRegistry::new(config.session.history_limit),
            executor: Arc::new(executor),
            config,
        }
    }

    /// Server running the default pipeline over `backend`.
    pub fn with_backend(config: PetConfig, backend: Arc<dyn AgentBackend>) -> Result<Self> {
        let executor = build_default_pipeline(&config, backend)?;
        Ok(Self::new(config, executor))
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// The shared executor; stages may be spliced in while connections are live.
    pub fn executor(&self) -> &Arc<PipelineExecutor> {
        &self.executor
    }

    pub fn config(&self) -> &PetConfig {
        &self.config
    }

    /// Attach a new connection to `session_key` (or the default session).
    ///
    /// Sends a `connected` system message announcing the session key and
    /// whether an existing session was resumed.
    pub async fn open_connection(
        self: &Arc<Self>,
        session_key: Option<&str>,
    ) -> Result<(ConnectionHandle, mpsc::Receiver<OutboundMessage>)> {
        let key = session_key
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .unwrap_or(self.config.server.default_session_key.as_str())
            .to_owned();
        let connection = ConnectionId::next();
        let (session, resumed) = self.registry.attach(&key, connection);
        let (tx, rx) = mpsc::channel(self.config.server.outbound_capacity.max(1));
        let outbound = OutboundSender::new(connection, tx);

        debug!(
            %connection,
            session = %key,
            outbound_capacity = self.config.server.outbound_capacity,
            "connection opened"
        );

        // Handle first so a failed greeting still detaches on drop.
        let handle = ConnectionHandle {
            server: Arc::clone(self),
            session,
            outbound,
        };
        handle
            .outbound
            .send(OutboundMessage::unscoped(
                MessageType::System,
                serde_json::json!({
                    "event": "connected",
                    "session": key,
                    "resumed": resumed,
                }),
            ))
            .await?;
        Ok((handle, rx))
    }
}

/// One live connection. Dropping it detaches the connection from its session.
pub struct ConnectionHandle {
    server: Arc<AgentServer>,
    session: Arc<Session>,
    outbound: OutboundSender,
}

impl ConnectionHandle {
    pub fn connection(&self) -> ConnectionId {
        self.outbound.connection()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Start a pipeline execution for an already-parsed message.
    pub fn handle_message(&self, inbound: InboundMessage) -> JoinHandle<ExecutionReport> {
        let ctx = PipelineContext::new(inbound, Arc::clone(&self.session), self.outbound.clone());
        self.server.executor.spawn_execute(ctx)
    }

    /// Parse one inbound text frame and start its pipeline execution.
    ///
    /// A malformed frame is logged and dropped without a reply; the
    /// connection stays open.
    pub fn handle_text(&self, raw: &str) -> Option<JoinHandle<ExecutionReport>> {
        match InboundMessage::parse(raw) {
            Ok(inbound) => Some(self.handle_message(inbound)),
            Err(e) => {
                warn!(connection = %self.connection(), error = %e, "inbound message dropped");
                None
            }
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        let connection = self.connection();
        if self.server.registry.detach(connection).is_some() {
            debug!(%connection, session = %self.session.key(), "connection closed");
        }
    }
}
