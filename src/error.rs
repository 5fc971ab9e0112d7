//! Error types for the deskpet orchestration layer.

/// Top-level error type for the response orchestration system.
#[derive(Debug, thiserror::Error)]
pub enum PetError {
    /// Malformed or unsupported protocol message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Pipeline coordination error (stage list edits, execution bookkeeping).
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// A named stage failed while processing one context.
    #[error("stage '{stage}' failed: {message}")]
    Stage {
        /// Name of the failing stage.
        stage: String,
        /// Human-readable failure description.
        message: String,
    },

    /// Agent / tool-calling backend error.
    #[error("backend error: {0}")]
    Backend(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Audio sink or audio stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PetError {
    /// Build a stage failure for `stage`.
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, PetError>;
