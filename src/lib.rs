//! Deskpet: response orchestration for a conversational desktop character.
//!
//! The crate covers both ends of the agent/client protocol:
//!
//! - **Server side**: inbound events run through a staged pipeline
//!   (PreProcess -> Process -> Respond) bound to a reconnect-safe session,
//!   and replies go out as versioned messages tagged with a response id
//!   and a priority.
//! - **Client side**: a single controller decides which response owns the
//!   character's text, voice, and motions, while buffers reassemble streamed
//!   text and audio and a timeline fires timed actions.
//!
//! # Architecture
//!
//! - **Protocol**: Wire envelopes and payloads ([`protocol`])
//! - **Sessions**: Conversation history keyed by session id ([`session`])
//! - **Pipeline**: Runtime-spliceable stage list and executor ([`pipeline`])
//! - **Client**: Arbitration, stream reassembly, and timeline ([`client`])
//! - **Host**: Stdio and WebSocket transports ([`host`])

pub mod client;
pub mod config;
pub mod error;
pub mod host;
pub mod pipeline;
pub mod protocol;
pub mod session;

pub use client::{ResponseClient, ResponseController};
pub use config::PetConfig;
pub use error::{PetError, Result};
pub use pipeline::{PipelineContext, PipelineExecutor};
pub use protocol::{InboundMessage, OutboundMessage};
pub use session::SessionRegistry;
