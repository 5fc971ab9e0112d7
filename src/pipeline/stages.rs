//! Built-in stages: PreProcess, Process, Respond, and the optional content filter.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{PetError, Result};
use crate::pipeline::backend::{AgentAudio, AgentBackend, AgentRequest, ReplyText};
use crate::pipeline::context::{Intent, PipelineContext};
use crate::pipeline::stage::{Stage, StageOutcome};
use crate::protocol::envelope::{
    AudioChunkPayload, AudioEndPayload, AudioStartPayload, DialoguePayload, StreamChunkPayload,
    StreamEndPayload, StreamStartPayload, SyncCommandPayload,
};
use crate::protocol::{InboundKind, MessageType, OutboundMessage};
use crate::session::HistoryRole;

pub const PRE_PROCESS: &str = "PreProcess";
pub const PROCESS: &str = "Process";
pub const RESPOND: &str = "Respond";
pub const CONTENT_FILTER: &str = "ContentFilter";

fn to_value<T: serde::Serialize>(payload: &T) -> Result<serde_json::Value> {
    serde_json::to_value(payload)
        .map_err(|e| PetError::Protocol(format!("failed to encode payload: {e}")))
}

/// Normalizes and validates the inbound event, attaching an [`Intent`].
pub struct PreProcess {
    max_input_chars: usize,
}

impl PreProcess {
    pub fn new(max_input_chars: usize) -> Self {
        Self { max_input_chars }
    }

    fn extract_text(&self, ctx: &PipelineContext) -> Option<String> {
        let inbound = &ctx.inbound;
        let text = match inbound.kind {
            InboundKind::UserInput | InboundKind::PluginPush | InboundKind::Notice => {
                inbound.data_str("text")?.trim().to_owned()
            }
            InboundKind::Interaction => {
                let action = inbound.data_str("action")?.trim();
                match inbound.data_str("target") {
                    Some(target) => format!("[interaction] {action} on {}", target.trim()),
                    None => format!("[interaction] {action}"),
                }
            }
            InboundKind::PluginResponse => {
                let plugin = inbound.data_str("plugin").unwrap_or("plugin");
                let result = inbound
                    .data
                    .get("result")
                    .map(serde_json::Value::to_string)
                    .unwrap_or_default();
                format!("[{plugin} result] {result}")
            }
            InboundKind::Ping => String::new(),
        };
        Some(text)
    }

    fn admit(&self, ctx: &mut PipelineContext) -> StageOutcome {
        let kind = ctx.inbound.kind;
        let Some(text) = self.extract_text(ctx) else {
            warn!(
                session = ctx.session.key(),
                kind = ?kind,
                "inbound message is missing required fields; dropping"
            );
            return StageOutcome::Halt;
        };

        if kind.wants_agent_reply() && text.is_empty() {
            debug!(session = ctx.session.key(), "empty input; nothing to answer");
            return StageOutcome::Halt;
        }
        let chars = text.chars().count();
        if chars > self.max_input_chars {
            warn!(
                session = ctx.session.key(),
                chars,
                limit = self.max_input_chars,
                "input too long; dropping"
            );
            return StageOutcome::Halt;
        }

        if kind.wants_agent_reply() {
            let role = match kind {
                InboundKind::UserInput | InboundKind::Interaction => HistoryRole::User,
                _ => HistoryRole::System,
            };
            ctx.session.push_history(role, text.clone());
        }

        ctx.intent = Some(Intent {
            kind,
            text,
            priority: kind.priority(),
        });
        StageOutcome::Continue
    }
}

#[async_trait]
impl Stage for PreProcess {
    fn name(&self) -> &str {
        PRE_PROCESS
    }

    async fn run(&self, ctx: &mut PipelineContext) -> Result<StageOutcome> {
        // Admission (and the history entry it records) follows arrival order.
        ctx.wait_intake_turn().await;
        let outcome = self.admit(ctx);
        ctx.release_intake();
        Ok(outcome)
    }
}

/// Halts contexts whose input mentions a blocked term.
pub struct ContentFilter {
    blocked: Vec<String>,
}

impl ContentFilter {
    pub fn new(blocked_terms: &[String]) -> Self {
        Self {
            blocked: blocked_terms
                .iter()
                .map(|term| term.trim().to_lowercase())
                .filter(|term| !term.is_empty())
                .collect(),
        }
    }
}

#[async_trait]
impl Stage for ContentFilter {
    fn name(&self) -> &str {
        CONTENT_FILTER
    }

    async fn run(&self, ctx: &mut PipelineContext) -> Result<StageOutcome> {
        let Some(intent) = &ctx.intent else {
            return Ok(StageOutcome::Continue);
        };
        let lowered = intent.text.to_lowercase();
        if let Some(term) = self.blocked.iter().find(|term| lowered.contains(term.as_str())) {
            info!(session = ctx.session.key(), term = %term, "input blocked by content filter");
            return Ok(StageOutcome::Halt);
        }
        Ok(StageOutcome::Continue)
    }
}

/// Delegates the intent to the agent backend.
pub struct Process {
    backend: Arc<dyn AgentBackend>,
}

impl Process {
    pub fn new(backend: Arc<dyn AgentBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Stage for Process {
    fn name(&self) -> &str {
        PROCESS
    }

    async fn run(&self, ctx: &mut PipelineContext) -> Result<StageOutcome> {
        let Some(intent) = &ctx.intent else {
            return Err(PetError::stage(PROCESS, "no intent attached; PreProcess did not run"));
        };
        if !intent.kind.wants_agent_reply() {
            return Ok(StageOutcome::Continue);
        }
        let request = AgentRequest {
            session_key: ctx.session.key().to_owned(),
            kind: intent.kind,
            input: intent.text.clone(),
            history: ctx.session.history(),
        };
        let reply = self.backend.respond(request).await?;
        ctx.reply = Some(reply);
        Ok(StageOutcome::Continue)
    }
}

/// Serializes the reply into outbound protocol messages.
///
/// Assigns a fresh response id and the priority derived from the triggering
/// event. Message order for one reply: `audio_stream_start` (when audio is
/// present, so the client knows audio is due before any text completes),
/// the text as `dialogue` or `dialogue_stream_*`, `sync_command`, then the
/// audio chunks and `audio_stream_end`.
pub struct Respond {
    stream_text: bool,
    serialize_outbound: bool,
}

impl Respond {
    pub fn new(stream_text: bool, serialize_outbound: bool) -> Self {
        Self {
            stream_text,
            serialize_outbound,
        }
    }

    async fn send_text(
        &self,
        ctx: &PipelineContext,
        response_id: &str,
        priority: i32,
        text: ReplyText,
        duration: Option<u64>,
    ) -> Result<String> {
        let text = match text {
            ReplyText::Streamed(mut deltas) if !self.stream_text => {
                let mut collected = String::new();
                while let Some(delta) = deltas.recv().await {
                    collected.push_str(&delta);
                }
                ReplyText::Complete(collected)
            }
            other => other,
        };

        match text {
            ReplyText::Complete(text) => {
                let data = to_value(&DialoguePayload {
                    text: text.clone(),
                    duration,
                })?;
                ctx.send(OutboundMessage::scoped(
                    MessageType::Dialogue,
                    response_id,
                    priority,
                    data,
                ))
                .await?;
                Ok(text)
            }
            ReplyText::Streamed(mut deltas) => {
                let stream_id = uuid::Uuid::new_v4().to_string();
                ctx.session.set_streaming(true);
                let result = async {
                    ctx.send(OutboundMessage::scoped(
                        MessageType::DialogueStreamStart,
                        response_id,
                        priority,
                        to_value(&StreamStartPayload {
                            stream_id: stream_id.clone(),
                        })?,
                    ))
                    .await?;
                    let mut full_text = String::new();
                    while let Some(delta) = deltas.recv().await {
                        if delta.is_empty() {
                            continue;
                        }
                        full_text.push_str(&delta);
                        ctx.send(OutboundMessage::scoped(
                            MessageType::DialogueStreamChunk,
                            response_id,
                            priority,
                            to_value(&StreamChunkPayload {
                                stream_id: stream_id.clone(),
                                delta,
                            })?,
                        ))
                        .await?;
                    }
                    ctx.send(OutboundMessage::scoped(
                        MessageType::DialogueStreamEnd,
                        response_id,
                        priority,
                        to_value(&StreamEndPayload {
                            stream_id: stream_id.clone(),
                            full_text: Some(full_text.clone()),
                        })?,
                    ))
                    .await?;
                    Ok::<_, PetError>(full_text)
                }
                .await;
                ctx.session.set_streaming(false);
                result
            }
        }
    }

    async fn send_audio_chunks(
        &self,
        ctx: &PipelineContext,
        response_id: &str,
        priority: i32,
        stream_id: &str,
        audio: AgentAudio,
    ) -> Result<()> {
        for chunk in audio.chunks {
            let data = to_value(&AudioChunkPayload {
                stream_id: stream_id.to_owned(),
                chunk: BASE64.encode(&chunk),
            })?;
            ctx.send(OutboundMessage::scoped(
                MessageType::AudioChunk,
                response_id,
                priority,
                data,
            ))
            .await?;
        }
        let data = to_value(&AudioEndPayload {
            stream_id: stream_id.to_owned(),
        })?;
        ctx.send(OutboundMessage::scoped(
            MessageType::AudioStreamEnd,
            response_id,
            priority,
            data,
        ))
        .await
    }
}

#[async_trait]
impl Stage for Respond {
    fn name(&self) -> &str {
        RESPOND
    }

    async fn run(&self, ctx: &mut PipelineContext) -> Result<StageOutcome> {
        let Some(intent) = ctx.intent.clone() else {
            return Err(PetError::stage(RESPOND, "no intent attached; PreProcess did not run"));
        };

        if self.serialize_outbound {
            ctx.wait_outbound_turn().await;
        }

        if intent.kind == InboundKind::Ping {
            let pong = OutboundMessage::unscoped(
                MessageType::System,
                serde_json::json!({"event": "pong", "session": ctx.session.key()}),
            );
            ctx.send(pong).await?;
            return Ok(StageOutcome::Continue);
        }

        let Some(reply) = ctx.reply.take() else {
            return Err(PetError::stage(RESPOND, "no reply attached; Process did not run"));
        };

        let response_id = uuid::Uuid::new_v4().to_string();
        let priority = intent.priority;
        ctx.extras.insert(
            "response_id".to_owned(),
            serde_json::Value::String(response_id.clone()),
        );

        let audio_stream = match &reply.audio {
            Some(audio) => {
                let stream_id = uuid::Uuid::new_v4().to_string();
                let data = to_value(&AudioStartPayload {
                    stream_id: stream_id.clone(),
                    format: audio.format.clone(),
                })?;
                ctx.send(OutboundMessage::scoped(
                    MessageType::AudioStreamStart,
                    &response_id,
                    priority,
                    data,
                ))
                .await?;
                Some(stream_id)
            }
            None => None,
        };

        // With actions the timeline, not the dialogue, carries the duration.
        let dialogue_duration = if reply.actions.is_empty() {
            reply.duration_ms
        } else {
            None
        };
        let full_text = self
            .send_text(ctx, &response_id, priority, reply.text, dialogue_duration)
            .await?;

        if !reply.actions.is_empty() {
            let data = to_value(&SyncCommandPayload {
                actions: reply.actions,
                total_duration: reply.duration_ms,
            })?;
            ctx.send(OutboundMessage::scoped(
                MessageType::SyncCommand,
                &response_id,
                priority,
                data,
            ))
            .await?;
        }

        if let (Some(stream_id), Some(audio)) = (audio_stream, reply.audio) {
            self.send_audio_chunks(ctx, &response_id, priority, &stream_id, audio)
                .await?;
        }

        ctx.session.push_history(HistoryRole::Assistant, full_text);
        debug!(
            session = ctx.session.key(),
            response_id = %response_id,
            priority,
            "reply sent"
        );
        Ok(StageOutcome::Continue)
    }
}
