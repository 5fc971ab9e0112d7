//! Transports that carry protocol messages between clients and the pipeline.

pub mod connection;
pub mod stdio;
pub mod ws;

pub use connection::{AgentServer, ConnectionHandle};
