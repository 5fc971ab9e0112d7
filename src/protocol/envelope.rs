//! Versioned wire envelopes exchanged between the agent process and the client.
//!
//! Outbound messages (agent -> client) carry a `type` discriminant, an
//! optional `responseId`, a `priority`, and a type-specific `data` payload.
//! Inbound messages (client -> agent) carry a `type` and `data`.

use crate::error::{PetError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Protocol version for inbound and outbound envelopes.
pub const PROTOCOL_VERSION: u32 = 1;

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

/// Recommended priority scale. Higher values preempt lower ones.
pub mod priority {
    /// User-initiated input (typed or spoken).
    pub const USER_INPUT: i32 = 10;
    /// Direct interaction with the character (tap, drag).
    pub const DIRECT_INTERACTION: i32 = 8;
    /// System- or plugin-initiated push.
    pub const SYSTEM_PUSH: i32 = 5;
    /// Low-priority notice.
    pub const NOTICE: i32 = 3;
    /// Legacy/unscoped default.
    pub const LEGACY: i32 = 0;
}

/// Outbound message discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Dialogue,
    DialogueStreamStart,
    DialogueStreamChunk,
    DialogueStreamEnd,
    AudioStreamStart,
    AudioChunk,
    AudioStreamEnd,
    SyncCommand,
    ToolConfirm,
    System,
    PluginInvoke,
    PluginResponse,
    ModelInfo,
    CommandRegister,
    CommandResponse,
}

/// How the client arbitrates a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Opens (or continues) a response; subject to priority arbitration.
    Interruptable,
    /// Attached to an already-open response; dropped when that response is inactive.
    Trailing,
    /// Bypasses arbitration entirely.
    Unscoped,
}

impl MessageType {
    /// Render the type to wire format.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dialogue => "dialogue",
            Self::DialogueStreamStart => "dialogue_stream_start",
            Self::DialogueStreamChunk => "dialogue_stream_chunk",
            Self::DialogueStreamEnd => "dialogue_stream_end",
            Self::AudioStreamStart => "audio_stream_start",
            Self::AudioChunk => "audio_chunk",
            Self::AudioStreamEnd => "audio_stream_end",
            Self::SyncCommand => "sync_command",
            Self::ToolConfirm => "tool_confirm",
            Self::System => "system",
            Self::PluginInvoke => "plugin_invoke",
            Self::PluginResponse => "plugin_response",
            Self::ModelInfo => "model_info",
            Self::CommandRegister => "command_register",
            Self::CommandResponse => "command_response",
        }
    }

    /// Arbitration class for this type.
    #[must_use]
    pub fn class(self) -> MessageClass {
        match self {
            Self::Dialogue
            | Self::DialogueStreamStart
            | Self::AudioStreamStart
            | Self::SyncCommand => MessageClass::Interruptable,
            Self::AudioChunk
            | Self::AudioStreamEnd
            | Self::DialogueStreamChunk
            | Self::DialogueStreamEnd
            | Self::ToolConfirm
            | Self::CommandResponse => MessageClass::Trailing,
            Self::System
            | Self::PluginInvoke
            | Self::PluginResponse
            | Self::ModelInfo
            | Self::CommandRegister => MessageClass::Unscoped,
        }
    }
}

/// A versioned outbound envelope from agent process -> client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    #[serde(default = "default_version")]
    pub v: u32,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl OutboundMessage {
    /// Build a message scoped to `response_id`.
    #[must_use]
    pub fn scoped(
        kind: MessageType,
        response_id: impl Into<String>,
        priority: i32,
        data: serde_json::Value,
    ) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            kind,
            response_id: Some(response_id.into()),
            priority,
            data,
        }
    }

    /// Build a message with no response scope (system/plugin/data types).
    #[must_use]
    pub fn unscoped(kind: MessageType, data: serde_json::Value) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            kind,
            response_id: None,
            priority: priority::LEGACY,
            data,
        }
    }

    /// Parse one outbound message from JSON text.
    pub fn parse(raw: &str) -> Result<Self> {
        let message: Self = serde_json::from_str(raw)
            .map_err(|e| PetError::Protocol(format!("malformed outbound message: {e}")))?;
        if message.v != PROTOCOL_VERSION {
            return Err(PetError::Protocol(format!(
                "unsupported protocol version {}; expected {}",
                message.v, PROTOCOL_VERSION
            )));
        }
        Ok(message)
    }

    /// Decode the `data` payload into a typed struct.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            PetError::Protocol(format!("invalid {} payload: {e}", self.kind.as_str()))
        })
    }

    /// Serialize to a single JSON line (no trailing newline).
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| PetError::Protocol(format!("failed to serialize outbound message: {e}")))
    }
}

/// `dialogue` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialoguePayload {
    pub text: String,
    /// Display duration in ms; the client derives one from the text when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

/// `dialogue_stream_start` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStartPayload {
    pub stream_id: String,
}

/// `dialogue_stream_chunk` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunkPayload {
    pub stream_id: String,
    pub delta: String,
}

/// `dialogue_stream_end` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEndPayload {
    pub stream_id: String,
    /// Authoritative full text; preferred over the locally accumulated one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_text: Option<String>,
}

/// `audio_stream_start` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioStartPayload {
    pub stream_id: String,
    pub format: String,
}

/// `audio_chunk` payload. `chunk` is base64-encoded audio bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChunkPayload {
    pub stream_id: String,
    pub chunk: String,
}

/// `audio_stream_end` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioEndPayload {
    pub stream_id: String,
}

/// Named points in a response's duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Anchor {
    Start,
    Early,
    Middle,
    Late,
    End,
}

impl Anchor {
    /// Fraction of the total duration this anchor maps to.
    #[must_use]
    pub fn fraction(self) -> f64 {
        match self {
            Self::Start => 0.0,
            Self::Early => 0.15,
            Self::Middle => 0.5,
            Self::Late => 0.85,
            Self::End => 0.98,
        }
    }
}

/// When a timed action fires: a named anchor or a percentage (0-100) of the duration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timing {
    Anchor(Anchor),
    Percent(f64),
}

/// One renderer command scheduled against a response's duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedAction {
    pub timing: Timing,
    /// Opaque motion/expression/parameter command for the renderer.
    pub action: serde_json::Value,
}

/// `sync_command` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCommandPayload {
    pub actions: Vec<TimedAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<u64>,
}

/// Inbound message discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundKind {
    /// Typed or transcribed user input.
    UserInput,
    /// Tap/drag/gesture on the character.
    Interaction,
    /// Proactive message pushed by a plugin.
    PluginPush,
    /// Low-priority notice to relay.
    Notice,
    /// Result of a previous `plugin_invoke`.
    PluginResponse,
    /// Liveness probe.
    Ping,
}

impl InboundKind {
    /// Priority assigned to the response this event triggers.
    #[must_use]
    pub fn priority(self) -> i32 {
        match self {
            Self::UserInput => priority::USER_INPUT,
            Self::Interaction => priority::DIRECT_INTERACTION,
            Self::PluginPush | Self::PluginResponse => priority::SYSTEM_PUSH,
            Self::Notice => priority::NOTICE,
            Self::Ping => priority::LEGACY,
        }
    }

    /// Whether this event is answered by the agent backend.
    #[must_use]
    pub fn wants_agent_reply(self) -> bool {
        !matches!(self, Self::Ping)
    }
}

/// A versioned inbound envelope from client -> agent process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default = "default_version")]
    pub v: u32,
    #[serde(rename = "type")]
    pub kind: InboundKind,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl InboundMessage {
    /// Build a v1 inbound message.
    #[must_use]
    pub fn new(kind: InboundKind, data: serde_json::Value) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            kind,
            data,
        }
    }

    /// Parse and validate one inbound message from JSON text.
    pub fn parse(raw: &str) -> Result<Self> {
        let message: Self = serde_json::from_str(raw)
            .map_err(|e| PetError::Protocol(format!("malformed inbound message: {e}")))?;
        if message.v != PROTOCOL_VERSION {
            return Err(PetError::Protocol(format!(
                "unsupported protocol version {}; expected {}",
                message.v, PROTOCOL_VERSION
            )));
        }
        Ok(message)
    }

    /// Read a string field from `data`.
    #[must_use]
    pub fn data_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(serde_json::Value::as_str)
    }
}
