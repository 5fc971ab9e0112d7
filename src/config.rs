//! Configuration types for the orchestration server and client.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PetConfig {
    /// Transport settings (bind address, queue sizes).
    pub server: ServerConfig,
    /// Conversation session settings.
    pub session: SessionConfig,
    /// Server-side pipeline settings.
    pub pipeline: PipelineConfig,
    /// Client-side response arbitration settings.
    pub response: ResponseConfig,
    /// Client-side audio stream settings.
    pub audio: AudioConfig,
    /// Client-side timeline and display timing.
    pub timeline: TimelineConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket server listens on.
    pub bind_addr: String,
    /// Capacity of each connection's outbound queue.
    pub outbound_capacity: usize,
    /// Session key used by stdio and by WebSocket clients that pass none.
    pub default_session_key: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8765".to_owned(),
            outbound_capacity: 256,
            default_session_key: "local".to_owned(),
        }
    }
}

/// Conversation session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum history entries kept per session (0 = unbounded).
    pub history_limit: usize,
    /// When true, outbound replies of one session are sent in arrival order.
    ///
    /// Without it, whichever context reaches Respond first sends first.
    pub serialize_outbound: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_limit: 200,
            serialize_outbound: false,
        }
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Terms that make the content filter halt the pipeline.
    ///
    /// An empty list leaves the filter stage out of the pipeline entirely.
    pub blocked_terms: Vec<String>,
    /// Inputs longer than this (in characters) are rejected by PreProcess.
    pub max_input_chars: usize,
    /// Emit `dialogue_stream_*` messages when the backend streams its reply.
    ///
    /// When false, streamed replies are collected and sent as one `dialogue`.
    pub stream_text: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            blocked_terms: Vec::new(),
            max_input_chars: 4000,
            stream_text: true,
        }
    }
}

/// Response arbitration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseConfig {
    /// Capacity of the discarded response-id set (oldest evicted first).
    pub discarded_capacity: usize,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            discarded_capacity: 100,
        }
    }
}

/// Audio stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Delay between end-of-stream attempts while the sink is still busy (ms).
    pub end_retry_interval_ms: u64,
    /// Deferred end-of-stream attempts before a stall warning is logged.
    pub end_retry_warn_after: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            end_retry_interval_ms: 50,
            end_retry_warn_after: 40,
        }
    }
}

/// Timeline and display timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    /// Minimum time a text-only dialogue stays on screen (ms).
    pub default_display_ms: u64,
    /// Additional display time per character of text (ms).
    ///
    /// The display duration is `max(default_display_ms, chars * ms_per_char)`.
    pub ms_per_char: u64,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            default_display_ms: 5000,
            ms_per_char: 60,
        }
    }
}

impl TimelineConfig {
    /// Display duration for a text-only dialogue of `text`.
    pub fn display_duration_ms(&self, text: &str) -> u64 {
        let by_length = (text.chars().count() as u64).saturating_mul(self.ms_per_char);
        by_length.max(self.default_display_ms)
    }
}

impl PetConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::PetError::Config(e.to_string()))
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load_or_default(path: &std::path::Path) -> crate::error::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::PetError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/deskpet/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("deskpet").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("deskpet")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/deskpet-config/config.toml")
        }
    }
}
