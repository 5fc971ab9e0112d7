//! Wire protocol shared by the agent process and the client.

pub mod envelope;

pub use envelope::{
    InboundKind, InboundMessage, MessageClass, MessageType, OutboundMessage, PROTOCOL_VERSION,
    priority,
};
