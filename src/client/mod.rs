//! Client-side response arbitration and streaming reassembly.
//!
//! The client receives outbound messages from the agent process and decides
//! which response owns the character's text bubble, voice, and motions.

pub mod audio_stream;
pub mod controller;
pub mod dispatcher;
pub mod text_stream;
pub mod timeline;

pub use audio_stream::{AudioSink, AudioStreamBuffer, EndStatus};
pub use controller::{DiscardedIds, ResponseController, ResponseHost, ResponseSession};
pub use dispatcher::{Dispatch, Presenter, ResponseClient};
pub use text_stream::TextStreamBuffer;
pub use timeline::{Timeline, TimelineEntry};
