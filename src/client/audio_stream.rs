//! Incremental audio playback feeding.
//!
//! Decoded chunks queue up here until the sink can take more. The end of a
//! stream is only signalled to the sink once the queue has drained and the
//! sink is idle; until then the end stays pending and the owner retries.

use bytes::Bytes;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// The playback side of an audio stream (decoder plus output device).
///
/// Implementations must not call back into the owning buffer from inside
/// these methods; completion and idleness are reported asynchronously.
pub trait AudioSink: Send {
    /// Whether the sink is still consuming the last fed chunk.
    fn is_busy(&self) -> bool;
    /// Hand one encoded chunk to the decoder.
    fn feed(&mut self, chunk: Bytes);
    /// Signal that no more chunks follow for the current stream.
    fn end_of_stream(&mut self);
    /// Stop playback immediately, dropping anything not yet played.
    fn stop(&mut self);
}

/// Outcome of an end-of-stream attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndStatus {
    /// End-of-stream reached the sink.
    Sent,
    /// Queue not drained or sink busy; try again later.
    Deferred,
    /// Nothing to end (no stream, or end already sent).
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndState {
    Open,
    Pending { attempts: u32 },
    Sent,
}

/// FIFO between decoded network chunks and an [`AudioSink`].
pub struct AudioStreamBuffer<S: AudioSink> {
    sink: S,
    stream_id: Option<String>,
    /// Response that owns the open stream.
    owner: Option<String>,
    queue: VecDeque<Bytes>,
    end: EndState,
    warn_after: u32,
    stall_warned: bool,
}

impl<S: AudioSink> AudioStreamBuffer<S> {
    /// `warn_after` is the number of deferred end attempts before a stall is logged.
    pub fn new(sink: S, warn_after: u32) -> Self {
        Self {
            sink,
            stream_id: None,
            owner: None,
            queue: VecDeque::new(),
            end: EndState::Open,
            warn_after,
            stall_warned: false,
        }
    }

    /// Open `stream_id` for `owner`, dropping anything left from a prior stream.
    pub fn begin(&mut self, stream_id: &str, owner: Option<&str>) {
        if !self.queue.is_empty() {
            debug!(
                dropped = self.queue.len(),
                stream_id, "audio stream replaced with chunks still queued"
            );
        }
        self.queue.clear();
        self.stream_id = Some(stream_id.to_owned());
        self.owner = owner.map(str::to_owned);
        self.end = EndState::Open;
        self.stall_warned = false;
    }

    /// Queue one decoded chunk and feed the sink if it is idle.
    ///
    /// Returns false when `stream_id` is not the open stream or its end was already signalled.
    pub fn push(&mut self, stream_id: &str, chunk: Bytes) -> bool {
        if !self.is_open(stream_id) || self.end != EndState::Open {
            debug!(stream_id, "audio chunk for inactive stream dropped");
            return false;
        }
        self.queue.push_back(chunk);
        self.drain();
        true
    }

    /// Feed queued chunks while the sink is idle; finish a pending end afterwards.
    ///
    /// Returns the number of chunks fed.
    pub fn drain(&mut self) -> usize {
        let mut fed = 0;
        while !self.sink.is_busy() {
            let Some(chunk) = self.queue.pop_front() else {
                break;
            };
            self.sink.feed(chunk);
            fed += 1;
        }
        if matches!(self.end, EndState::Pending { .. }) {
            self.try_finish();
        }
        fed
    }

    /// The sink finished consuming a chunk.
    pub fn on_sink_idle(&mut self) -> usize {
        self.drain()
    }

    /// Request end-of-stream for `stream_id`.
    pub fn end_stream(&mut self, stream_id: &str) -> EndStatus {
        if !self.is_open(stream_id) {
            debug!(stream_id, "audio end for inactive stream ignored");
            return EndStatus::Idle;
        }
        if self.end == EndState::Open {
            self.end = EndState::Pending { attempts: 0 };
        }
        self.drain();
        self.try_finish()
    }

    /// Re-attempt a deferred end-of-stream.
    pub fn retry_end(&mut self) -> EndStatus {
        if let EndState::Pending { attempts } = &mut self.end {
            *attempts += 1;
            if *attempts >= self.warn_after && !self.stall_warned {
                warn!(
                    attempts = *attempts,
                    queued = self.queue.len(),
                    stream_id = self.stream_id.as_deref().unwrap_or(""),
                    "audio sink has not drained; end-of-stream still deferred"
                );
                self.stall_warned = true;
            }
        }
        self.drain();
        self.try_finish()
    }

    fn try_finish(&mut self) -> EndStatus {
        match self.end {
            EndState::Open | EndState::Sent => EndStatus::Idle,
            EndState::Pending { .. } => {
                if self.queue.is_empty() && !self.sink.is_busy() {
                    self.sink.end_of_stream();
                    self.end = EndState::Sent;
                    EndStatus::Sent
                } else {
                    EndStatus::Deferred
                }
            }
        }
    }

    /// Drop every queued chunk and stop the sink.
    pub fn flush(&mut self) {
        self.queue.clear();
        self.sink.stop();
        self.stream_id = None;
        self.owner = None;
        self.end = EndState::Open;
        self.stall_warned = false;
    }

    /// Whether end-of-stream has been signalled to the sink.
    pub fn end_sent(&self) -> bool {
        self.end == EndState::Sent
    }

    #[cfg(test)]
    pub(crate) fn end_pending(&self) -> bool {
        matches!(self.end, EndState::Pending { .. })
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    #[cfg(test)]
    pub(crate) fn sink(&self) -> &S {
        &self.sink
    }

    #[cfg(test)]
    pub(crate) fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    fn is_open(&self, stream_id: &str) -> bool {
        self.stream_id.as_deref() == Some(stream_id)
    }
}
