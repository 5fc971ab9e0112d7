//! Reassembly of streamed dialogue text.
//!
//! Deltas are appended to an accumulator keyed by stream id. Chunks or an
//! end for a stream other than the one currently open are ignored, which
//! covers fragments that outlive an interruption.

use tracing::debug;

/// Accumulates `dialogue_stream_chunk` deltas for the open stream.
#[derive(Debug, Default)]
pub struct TextStreamBuffer {
    stream_id: Option<String>,
    text: String,
}

impl TextStreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `stream_id`, discarding anything accumulated for a prior stream.
    pub fn start(&mut self, stream_id: &str) {
        if let Some(previous) = self.stream_id.as_deref() {
            if previous != stream_id {
                debug!(previous, stream_id, "text stream replaced before it ended");
            }
        }
        self.stream_id = Some(stream_id.to_owned());
        self.text.clear();
    }

    /// Append `delta` and return the accumulated text so far.
    ///
    /// Returns `None` (and appends nothing) when `stream_id` is not open.
    pub fn chunk(&mut self, stream_id: &str, delta: &str) -> Option<&str> {
        if !self.is_open(stream_id) {
            debug!(stream_id, "chunk for unknown text stream ignored");
            return None;
        }
        self.text.push_str(delta);
        Some(&self.text)
    }

    /// Close `stream_id` and return the final text.
    ///
    /// The authoritative `full_text` wins over the accumulator when present.
    /// Returns `None` when `stream_id` is not open.
    pub fn end(&mut self, stream_id: &str, full_text: Option<String>) -> Option<String> {
        if !self.is_open(stream_id) {
            debug!(stream_id, "end for unknown text stream ignored");
            return None;
        }
        self.stream_id = None;
        let accumulated = std::mem::take(&mut self.text);
        Some(full_text.unwrap_or(accumulated))
    }

    /// Drop the open stream and its accumulated text.
    pub fn reset(&mut self) {
        self.stream_id = None;
        self.text.clear();
    }

    #[cfg(test)]
    pub(crate) fn current_stream(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    /// Text accumulated so far for the open stream.
    pub fn text(&self) -> &str {
        &self.text
    }

    fn is_open(&self, stream_id: &str) -> bool {
        self.stream_id.as_deref() == Some(stream_id)
    }
}
