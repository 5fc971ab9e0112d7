//! The seam between the Process stage and the agent / tool-calling backend.
//!
//! The reasoning backend is an external collaborator; this module only
//! defines what the pipeline hands it and what it hands back.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::InboundKind;
use crate::protocol::envelope::{Anchor, TimedAction, Timing};
use crate::session::HistoryEntry;

/// What the Process stage asks of the backend.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub session_key: String,
    pub kind: InboundKind,
    pub input: String,
    /// History snapshot, oldest first, including the current input.
    pub history: Vec<HistoryEntry>,
}

/// Reply text: complete, or arriving incrementally.
#[derive(Debug)]
pub enum ReplyText {
    Complete(String),
    /// Deltas arrive on the receiver; the stream ends when the sender is dropped.
    Streamed(mpsc::Receiver<String>),
}

/// Synthesized speech for a reply.
#[derive(Debug, Clone)]
pub struct AgentAudio {
    /// Container/codec label understood by the client's decoder (e.g. `"mp3"`).
    pub format: String,
    pub chunks: Vec<Bytes>,
}

/// The backend's answer to one [`AgentRequest`].
#[derive(Debug)]
pub struct AgentReply {
    pub text: ReplyText,
    pub audio: Option<AgentAudio>,
    /// Renderer commands timed against `duration_ms`.
    pub actions: Vec<TimedAction>,
    pub duration_ms: Option<u64>,
}

impl AgentReply {
    /// A complete text reply.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: ReplyText::Complete(text.into()),
            audio: None,
            actions: Vec::new(),
            duration_ms: None,
        }
    }

    /// A reply whose text arrives on `deltas`.
    pub fn streamed(deltas: mpsc::Receiver<String>) -> Self {
        Self {
            text: ReplyText::Streamed(deltas),
            audio: None,
            actions: Vec::new(),
            duration_ms: None,
        }
    }

    #[must_use]
    pub fn with_audio(mut self, audio: AgentAudio) -> Self {
        self.audio = Some(audio);
        self
    }

    #[must_use]
    pub fn with_actions(mut self, actions: Vec<TimedAction>, duration_ms: u64) -> Self {
        self.actions = actions;
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Agent / tool-calling backend the Process stage delegates to.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn respond(&self, request: AgentRequest) -> Result<AgentReply>;
}

/// Backend that echoes input back, used by the host binaries when no
/// reasoning backend is wired in.
#[derive(Debug, Clone)]
pub struct EchoBackend {
    /// Stream the echo word by word instead of sending it whole.
    pub stream: bool,
    /// Pause between streamed words.
    pub word_delay: Duration,
}

impl Default for EchoBackend {
    fn default() -> Self {
        Self {
            stream: true,
            word_delay: Duration::from_millis(40),
        }
    }
}

#[async_trait]
impl AgentBackend for EchoBackend {
    async fn respond(&self, request: AgentRequest) -> Result<AgentReply> {
        let text = match request.kind {
            InboundKind::Interaction => "Hey, that tickles!".to_owned(),
            _ => request.input.clone(),
        };

        let reply = if self.stream {
            let words: Vec<String> = text
                .split_inclusive(' ')
                .map(str::to_owned)
                .collect();
            let (tx, rx) = mpsc::channel(words.len().max(1));
            let delay = self.word_delay;
            tokio::spawn(async move {
                for word in words {
                    if tx.send(word).await.is_err() {
                        break;
                    }
                    tokio::time::sleep(delay).await;
                }
            });
            AgentReply::streamed(rx)
        } else {
            AgentReply::text(text)
        };

        if request.kind == InboundKind::Interaction {
            let actions = vec![
                TimedAction {
                    timing: Timing::Anchor(Anchor::Start),
                    action: serde_json::json!({"type": "expression", "name": "surprised"}),
                },
                TimedAction {
                    timing: Timing::Anchor(Anchor::Late),
                    action: serde_json::json!({"type": "expression", "name": "default"}),
                },
            ];
            return Ok(reply.with_actions(actions, 2000));
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn request(kind: InboundKind, input: &str) -> AgentRequest {
        AgentRequest {
            session_key: "local".to_owned(),
            kind,
            input: input.to_owned(),
            history: Vec::new(),
        }
    }

    #[tokio::test]
    async fn echo_complete_returns_input() {
        let backend = EchoBackend {
            stream: false,
            word_delay: Duration::ZERO,
        };
        let reply = backend
            .respond(request(InboundKind::UserInput, "hello there"))
            .await
            .expect("reply");
        match reply.text {
            ReplyText::Complete(text) => assert_eq!(text, "hello there"),
            ReplyText::Streamed(_) => panic!("expected complete text"),
        }
        assert!(reply.actions.is_empty());
    }

    #[tokio::test]
    async fn echo_stream_reassembles_to_input() {
        let backend = EchoBackend {
            stream: true,
            word_delay: Duration::ZERO,
        };
        let reply = backend
            .respond(request(InboundKind::UserInput, "one two three"))
            .await
            .expect("reply");
        let ReplyText::Streamed(mut rx) = reply.text else {
            panic!("expected streamed text");
        };
        let mut text = String::new();
        while let Some(delta) = rx.recv().await {
            text.push_str(&delta);
        }
        assert_eq!(text, "one two three");
    }

    #[tokio::test]
    async fn interaction_reply_carries_timed_actions() {
        let backend = EchoBackend {
            stream: false,
            word_delay: Duration::ZERO,
        };
        let reply = backend
            .respond(request(InboundKind::Interaction, "tap head"))
            .await
            .expect("reply");
        assert_eq!(reply.actions.len(), 2);
        assert_eq!(reply.duration_ms, Some(2000));
    }
}
