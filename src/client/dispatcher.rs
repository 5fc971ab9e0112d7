//! Client-side routing of outbound messages.
//!
//! [`ResponseClient`] owns one [`ResponseController`] plus the text buffer,
//! audio buffer and timeline it arbitrates over. Every message is classified
//! by type, decoded, checked against the controller, then applied.
//!
//! Lock order is controller first, then any single component. Components
//! never take the controller lock while holding their own.

use base64::Engine as _;
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::audio_stream::{AudioSink, AudioStreamBuffer, EndStatus};
use crate::client::controller::{ResponseController, ResponseHost};
use crate::client::text_stream::TextStreamBuffer;
use crate::client::timeline::{Timeline, TimelineEntry};
use crate::config::{AudioConfig, PetConfig, TimelineConfig};
use crate::error::{PetError, Result};
use crate::protocol::envelope::{
    AudioChunkPayload, AudioEndPayload, AudioStartPayload, DialoguePayload, MessageClass,
    MessageType, OutboundMessage, StreamChunkPayload, StreamEndPayload, StreamStartPayload,
    SyncCommandPayload,
};

/// The display side of the client: text bubble, renderer, and everything else.
pub trait Presenter: Send + Sync {
    /// Show `text`; `partial` is true while a stream is still arriving.
    fn show_text(&self, text: &str, partial: bool);
    fn clear_text(&self);
    /// Run one timed renderer command.
    fn perform(&self, action: &serde_json::Value);
    /// Messages the response machinery does not interpret.
    fn forward(&self, message: &OutboundMessage);
    /// A response ended naturally.
    fn response_finished(&self, _response_id: &str) {}
}

/// What [`ResponseClient::handle`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Applied,
    Forwarded,
    Dropped,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Components<S: AudioSink> {
    audio: Mutex<AudioStreamBuffer<S>>,
    text: Mutex<TextStreamBuffer>,
    timeline: Mutex<Timeline>,
    end_retry: Mutex<Option<CancellationToken>>,
    /// Display time last armed for the current text-only response.
    display_ms: Mutex<Option<u64>>,
    presenter: Arc<dyn Presenter>,
}

/// [`ResponseHost`] over the client's components.
pub struct ClientHost<S: AudioSink> {
    parts: Arc<Components<S>>,
}

impl<S: AudioSink> ResponseHost for ClientHost<S> {
    fn stop(&mut self) {
        lock(&self.parts.audio).flush();
        lock(&self.parts.timeline).clear();
        if let Some(retry) = lock(&self.parts.end_retry).take() {
            retry.cancel();
        }
    }

    fn clear(&mut self) {
        lock(&self.parts.text).reset();
        *lock(&self.parts.display_ms) = None;
        self.parts.presenter.clear_text();
    }
}

/// A message payload decoded ahead of arbitration.
enum Decoded {
    Dialogue(DialoguePayload),
    StreamStart(StreamStartPayload),
    StreamChunk(StreamChunkPayload),
    StreamEnd(StreamEndPayload),
    AudioStart(AudioStartPayload),
    AudioChunk { stream_id: String, bytes: Bytes },
    AudioEnd(AudioEndPayload),
    Sync(SyncCommandPayload),
    /// Handed to the presenter untouched.
    Forward,
}

impl Decoded {
    fn from_message(message: &OutboundMessage) -> Result<Self> {
        Ok(match message.kind {
            MessageType::Dialogue => Self::Dialogue(message.payload()?),
            MessageType::DialogueStreamStart => Self::StreamStart(message.payload()?),
            MessageType::DialogueStreamChunk => Self::StreamChunk(message.payload()?),
            MessageType::DialogueStreamEnd => Self::StreamEnd(message.payload()?),
            MessageType::AudioStreamStart => Self::AudioStart(message.payload()?),
            MessageType::AudioChunk => {
                let payload: AudioChunkPayload = message.payload()?;
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(payload.chunk.as_bytes())
                    .map_err(|e| PetError::Audio(format!("invalid audio chunk encoding: {e}")))?;
                Self::AudioChunk {
                    stream_id: payload.stream_id,
                    bytes: Bytes::from(decoded),
                }
            }
            MessageType::AudioStreamEnd => Self::AudioEnd(message.payload()?),
            MessageType::SyncCommand => Self::Sync(message.payload()?),
            MessageType::ToolConfirm
            | MessageType::CommandResponse
            | MessageType::System
            | MessageType::PluginInvoke
            | MessageType::PluginResponse
            | MessageType::ModelInfo
            | MessageType::CommandRegister => Self::Forward,
        })
    }
}

struct ClientShared<S: AudioSink> {
    controller: Mutex<ResponseController<ClientHost<S>>>,
    parts: Arc<Components<S>>,
    timing: TimelineConfig,
    audio: AudioConfig,
}

/// One client connection's response arbitration and playback.
///
/// Cheap to clone; clones share state. Handling messages arms timers, so it
/// must happen inside a Tokio runtime.
pub struct ResponseClient<S: AudioSink + 'static> {
    shared: Arc<ClientShared<S>>,
}

impl<S: AudioSink + 'static> Clone for ResponseClient<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: AudioSink + 'static> ResponseClient<S> {
    pub fn new(sink: S, presenter: Arc<dyn Presenter>, config: &PetConfig) -> Self {
        let parts = Arc::new(Components {
            audio: Mutex::new(AudioStreamBuffer::new(
                sink,
                config.audio.end_retry_warn_after,
            )),
            text: Mutex::new(TextStreamBuffer::new()),
            timeline: Mutex::new(Timeline::new()),
            end_retry: Mutex::new(None),
            display_ms: Mutex::new(None),
            presenter,
        });
        let host = ClientHost {
            parts: Arc::clone(&parts),
        };
        Self {
            shared: Arc::new(ClientShared {
                controller: Mutex::new(ResponseController::new(
                    host,
                    config.response.discarded_capacity,
                )),
                parts,
                timing: config.timeline.clone(),
                audio: config.audio.clone(),
            }),
        }
    }

    /// Parse one JSON message and handle it.
    pub fn handle_json(&self, raw: &str) -> Result<Dispatch> {
        let message = OutboundMessage::parse(raw)?;
        Ok(self.handle(&message))
    }

    /// Route one outbound message.
    ///
    /// The payload is decoded before arbitration, so a malformed message
    /// never preempts or otherwise disturbs the current response.
    pub fn handle(&self, message: &OutboundMessage) -> Dispatch {
        let class = message.kind.class();
        if class == MessageClass::Unscoped {
            self.shared.parts.presenter.forward(message);
            return Dispatch::Forwarded;
        }

        let decoded = match Decoded::from_message(message) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(kind = message.kind.as_str(), error = %e, "message dropped");
                return Dispatch::Dropped;
            }
        };

        let mut controller = lock(&self.shared.controller);
        match message.response_id.as_deref() {
            // Legacy messages without an id only apply while nothing is current.
            None => {
                if let Some(current) = controller.current() {
                    debug!(
                        current = %current.id,
                        kind = message.kind.as_str(),
                        "message without response id dropped"
                    );
                    return Dispatch::Dropped;
                }
            }
            Some(id) if class == MessageClass::Interruptable => {
                if !controller.should_accept(id, message.priority) {
                    return Dispatch::Dropped;
                }
            }
            Some(id) => {
                if !controller.is_active(id) {
                    debug!(
                        response_id = id,
                        kind = message.kind.as_str(),
                        "fragment of inactive response dropped"
                    );
                    return Dispatch::Dropped;
                }
            }
        }

        self.apply(&mut controller, message, decoded)
    }

    fn apply(
        &self,
        controller: &mut ResponseController<ClientHost<S>>,
        message: &OutboundMessage,
        decoded: Decoded,
    ) -> Dispatch {
        let parts = &self.shared.parts;
        let response_id = message.response_id.as_deref();

        match decoded {
            Decoded::Dialogue(payload) => {
                lock(&parts.text).reset();
                parts.presenter.show_text(&payload.text, false);
                if let Some(id) = response_id {
                    if !controller.audio_active() {
                        let ms = payload
                            .duration
                            .unwrap_or_else(|| self.shared.timing.display_duration_ms(&payload.text));
                        self.arm_display(id, ms);
                    }
                }
            }
            Decoded::StreamStart(payload) => {
                lock(&parts.text).start(&payload.stream_id);
                parts.presenter.clear_text();
            }
            Decoded::StreamChunk(payload) => {
                let shown = lock(&parts.text)
                    .chunk(&payload.stream_id, &payload.delta)
                    .map(str::to_owned);
                if let Some(text) = shown {
                    parts.presenter.show_text(&text, true);
                }
            }
            Decoded::StreamEnd(payload) => {
                let finished = lock(&parts.text).end(&payload.stream_id, payload.full_text);
                if let Some(text) = finished {
                    parts.presenter.show_text(&text, false);
                    if let Some(id) = response_id {
                        if !controller.audio_active() {
                            let ms = self.shared.timing.display_duration_ms(&text);
                            self.arm_display(id, ms);
                        }
                    }
                }
            }
            Decoded::AudioStart(payload) => {
                if response_id.is_some() {
                    controller.mark_audio_active();
                }
                debug!(stream_id = %payload.stream_id, format = %payload.format, "audio stream opened");
                lock(&parts.audio).begin(&payload.stream_id, response_id);
            }
            Decoded::AudioChunk { stream_id, bytes } => {
                lock(&parts.audio).push(&stream_id, bytes);
            }
            Decoded::AudioEnd(payload) => {
                let status = lock(&parts.audio).end_stream(&payload.stream_id);
                if status == EndStatus::Deferred {
                    self.spawn_end_retry();
                }
            }
            Decoded::Sync(payload) => {
                let entries = payload
                    .actions
                    .into_iter()
                    .map(|timed| {
                        let presenter = Arc::clone(&parts.presenter);
                        TimelineEntry::new(timed.timing, move || presenter.perform(&timed.action))
                    })
                    .collect();

                // Replacing the timeline drops any display timer. The response
                // then ends with its timeline, or after its display time when
                // the timeline has no length.
                let completion_ms = match payload.total_duration {
                    Some(total) if total > 0 => total,
                    _ => lock(&parts.display_ms).unwrap_or(self.shared.timing.default_display_ms),
                };
                let mut timeline = lock(&parts.timeline);
                timeline.set_timeline(entries, payload.total_duration);
                if let Some(id) = response_id {
                    if !controller.audio_active() {
                        timeline.schedule_after(
                            Duration::from_millis(completion_ms),
                            self.completion(id),
                        );
                    }
                }
                timeline.start();
            }
            Decoded::Forward => {
                parts.presenter.forward(message);
                return Dispatch::Forwarded;
            }
        }
        Dispatch::Applied
    }

    /// Arm the natural completion of a text-only response `ms` from now.
    fn arm_display(&self, response_id: &str, ms: u64) {
        let parts = &self.shared.parts;
        *lock(&parts.display_ms) = Some(ms);
        lock(&parts.timeline).schedule_after(Duration::from_millis(ms), self.completion(response_id));
    }

    fn completion(&self, response_id: &str) -> impl FnOnce() + Send + 'static {
        let shared: Weak<ClientShared<S>> = Arc::downgrade(&self.shared);
        let response_id = response_id.to_owned();
        move || {
            if let Some(shared) = shared.upgrade() {
                ResponseClient { shared }.complete(&response_id);
            }
        }
    }

    fn spawn_end_retry(&self) {
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.shared.parts.end_retry).replace(token.clone()) {
            previous.cancel();
        }
        let shared = Arc::downgrade(&self.shared);
        let interval = Duration::from_millis(self.shared.audio.end_retry_interval_ms.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {
                        let Some(shared) = shared.upgrade() else {
                            break;
                        };
                        let status = lock(&shared.parts.audio).retry_end();
                        if status != EndStatus::Deferred {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Natural completion of `response_id`. Stale ids are ignored.
    ///
    /// Returns whether the current response ended.
    pub fn complete(&self, response_id: &str) -> bool {
        let mut controller = lock(&self.shared.controller);
        if !controller.notify_complete(Some(response_id)) {
            debug!(response_id, "stale completion ignored");
            return false;
        }
        let parts = &self.shared.parts;
        lock(&parts.timeline).clear();
        lock(&parts.text).reset();
        *lock(&parts.display_ms) = None;
        parts.presenter.clear_text();
        parts.presenter.response_finished(response_id);
        true
    }

    /// The audio sink finished consuming a chunk.
    pub fn on_sink_idle(&self) {
        lock(&self.shared.parts.audio).on_sink_idle();
    }

    /// The audio sink finished playing everything it was given.
    ///
    /// Completes the owning response once its end-of-stream has been signalled.
    pub fn on_playback_finished(&self) -> bool {
        let owner = {
            let audio = lock(&self.shared.parts.audio);
            if !audio.end_sent() {
                debug!("playback drained before end-of-stream; response still open");
                return false;
            }
            audio.owner().map(str::to_owned)
        };
        match owner {
            Some(id) => self.complete(&id),
            None => false,
        }
    }

    /// Interrupt whatever response is current (user pressed stop).
    pub fn interrupt(&self) -> Option<String> {
        lock(&self.shared.controller).interrupt_current()
    }

    /// Id of the response that currently owns display and audio.
    pub fn current_response(&self) -> Option<String> {
        lock(&self.shared.controller)
            .current()
            .map(|session| session.id.clone())
    }

    pub fn is_discarded(&self, response_id: &str) -> bool {
        lock(&self.shared.controller).is_discarded(response_id)
    }

    /// Timers still waiting to fire.
    pub fn armed_timers(&self) -> usize {
        lock(&self.shared.parts.timeline).armed_len()
    }

    /// Audio chunks waiting for the sink.
    pub fn queued_audio(&self) -> usize {
        lock(&self.shared.parts.audio).queued()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::protocol::envelope::priority;
    use serde_json::json;

    #[derive(Default)]
    struct Screen {
        text: Mutex<Option<(String, bool)>>,
        actions: Mutex<Vec<serde_json::Value>>,
        forwarded: Mutex<Vec<MessageType>>,
        finished: Mutex<Vec<String>>,
    }

    impl Presenter for Screen {
        fn show_text(&self, text: &str, partial: bool) {
            *self.text.lock().unwrap() = Some((text.to_owned(), partial));
        }

        fn clear_text(&self) {
            *self.text.lock().unwrap() = None;
        }

        fn perform(&self, action: &serde_json::Value) {
            self.actions.lock().unwrap().push(action.clone());
        }

        fn forward(&self, message: &OutboundMessage) {
            self.forwarded.lock().unwrap().push(message.kind);
        }

        fn response_finished(&self, response_id: &str) {
            self.finished.lock().unwrap().push(response_id.to_owned());
        }
    }

    impl Screen {
        fn shown(&self) -> Option<String> {
            self.text.lock().unwrap().as_ref().map(|(t, _)| t.clone())
        }
    }

    #[derive(Default)]
    struct SinkState {
        busy: bool,
        fed: usize,
        ended: usize,
        stopped: usize,
    }

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<SinkState>>);

    impl AudioSink for SharedSink {
        fn is_busy(&self) -> bool {
            self.0.lock().unwrap().busy
        }

        fn feed(&mut self, _chunk: Bytes) {
            let mut s = self.0.lock().unwrap();
            s.fed += 1;
            s.busy = true;
        }

        fn end_of_stream(&mut self) {
            self.0.lock().unwrap().ended += 1;
        }

        fn stop(&mut self) {
            let mut s = self.0.lock().unwrap();
            s.stopped += 1;
            s.busy = false;
        }
    }

    fn client() -> (ResponseClient<SharedSink>, Arc<Screen>, SharedSink) {
        let screen = Arc::new(Screen::default());
        let sink = SharedSink::default();
        let client = ResponseClient::new(
            sink.clone(),
            Arc::clone(&screen) as Arc<dyn Presenter>,
            &PetConfig::default(),
        );
        (client, screen, sink)
    }

    fn msg(kind: MessageType, id: &str, priority: i32, data: serde_json::Value) -> OutboundMessage {
        OutboundMessage::scoped(kind, id, priority, data)
    }

    fn b64(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    #[tokio::test(start_paused = true)]
    async fn text_dialogue_completes_after_display_time() {
        let (client, screen, _) = client();
        let d = msg(
            MessageType::Dialogue,
            "r1",
            priority::USER_INPUT,
            json!({"text": "hi", "duration": 1000}),
        );
        assert_eq!(client.handle(&d), Dispatch::Applied);
        assert_eq!(screen.shown().as_deref(), Some("hi"));
        assert_eq!(client.current_response().as_deref(), Some("r1"));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(client.current_response().is_none());
        assert!(screen.shown().is_none());
        assert_eq!(*screen.finished.lock().unwrap(), vec!["r1".to_owned()]);
    }

    #[tokio::test(start_paused = true)]
    async fn interruption_cancels_old_completion_timer() {
        let (client, screen, _) = client();
        client.handle(&msg(
            MessageType::Dialogue,
            "r1",
            5,
            json!({"text": "first", "duration": 1000}),
        ));
        client.handle(&msg(
            MessageType::Dialogue,
            "r2",
            10,
            json!({"text": "second", "duration": 5000}),
        ));
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(client.current_response().as_deref(), Some("r2"));
        assert_eq!(screen.shown().as_deref(), Some("second"));
        assert!(client.is_discarded("r1"));
    }

    #[tokio::test(start_paused = true)]
    async fn lower_priority_dialogue_is_dropped() {
        let (client, screen, _) = client();
        client.handle(&msg(MessageType::Dialogue, "r1", 10, json!({"text": "keep"})));
        let low = msg(MessageType::Dialogue, "r2", 3, json!({"text": "notice"}));
        assert_eq!(client.handle(&low), Dispatch::Dropped);
        assert_eq!(screen.shown().as_deref(), Some("keep"));
    }

    #[tokio::test(start_paused = true)]
    async fn stream_fragments_of_discarded_response_are_dropped() {
        let (client, screen, _) = client();
        client.handle(&msg(
            MessageType::DialogueStreamStart,
            "r1",
            5,
            json!({"streamId": "s1"}),
        ));
        client.handle(&msg(
            MessageType::DialogueStreamChunk,
            "r1",
            5,
            json!({"streamId": "s1", "delta": "old "}),
        ));
        client.handle(&msg(
            MessageType::DialogueStreamStart,
            "r2",
            10,
            json!({"streamId": "s2"}),
        ));
        let late = msg(
            MessageType::DialogueStreamChunk,
            "r1",
            5,
            json!({"streamId": "s1", "delta": "late"}),
        );
        assert_eq!(client.handle(&late), Dispatch::Dropped);
        client.handle(&msg(
            MessageType::DialogueStreamChunk,
            "r2",
            10,
            json!({"streamId": "s2", "delta": "new"}),
        ));
        assert_eq!(screen.shown().as_deref(), Some("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn audio_response_completes_on_playback_finished() {
        let (client, screen, sink) = client();
        let id = "r1";
        client.handle(&msg(
            MessageType::AudioStreamStart,
            id,
            10,
            json!({"streamId": "a1", "format": "mp3"}),
        ));
        client.handle(&msg(MessageType::Dialogue, id, 10, json!({"text": "hello"})));
        for n in 0..3u8 {
            client.handle(&msg(
                MessageType::AudioChunk,
                id,
                10,
                json!({"streamId": "a1", "chunk": b64(&[n; 4])}),
            ));
        }
        assert_eq!(client.queued_audio(), 2);
        client.handle(&msg(MessageType::AudioStreamEnd, id, 10, json!({"streamId": "a1"})));
        assert_eq!(sink.0.lock().unwrap().ended, 0);

        // No display timer for an audio response.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(client.current_response().as_deref(), Some(id));

        for _ in 0..3 {
            sink.0.lock().unwrap().busy = false;
            client.on_sink_idle();
        }
        assert_eq!(sink.0.lock().unwrap().fed, 3);
        assert_eq!(sink.0.lock().unwrap().ended, 1);

        assert!(client.on_playback_finished());
        assert!(client.current_response().is_none());
        assert!(screen.shown().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_end_retries_until_sink_settles() {
        let (client, _, sink) = client();
        client.handle(&msg(
            MessageType::AudioStreamStart,
            "r1",
            10,
            json!({"streamId": "a1", "format": "mp3"}),
        ));
        client.handle(&msg(
            MessageType::AudioChunk,
            "r1",
            10,
            json!({"streamId": "a1", "chunk": b64(b"abc")}),
        ));
        client.handle(&msg(MessageType::AudioStreamEnd, "r1", 10, json!({"streamId": "a1"})));
        assert!(!client.on_playback_finished());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.0.lock().unwrap().ended, 0);

        // The sink goes idle without reporting it; the retry loop notices.
        sink.0.lock().unwrap().busy = false;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.0.lock().unwrap().ended, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn interruption_stops_audio_and_pending_end() {
        let (client, _, sink) = client();
        client.handle(&msg(
            MessageType::AudioStreamStart,
            "r1",
            5,
            json!({"streamId": "a1", "format": "mp3"}),
        ));
        for _ in 0..3 {
            client.handle(&msg(
                MessageType::AudioChunk,
                "r1",
                5,
                json!({"streamId": "a1", "chunk": b64(b"x")}),
            ));
        }
        client.handle(&msg(MessageType::AudioStreamEnd, "r1", 5, json!({"streamId": "a1"})));
        client.handle(&msg(MessageType::Dialogue, "r2", 10, json!({"text": "stop!"})));

        assert_eq!(sink.0.lock().unwrap().stopped, 1);
        assert_eq!(client.queued_audio(), 0);
        let late = msg(
            MessageType::AudioChunk,
            "r1",
            5,
            json!({"streamId": "a1", "chunk": b64(b"y")}),
        );
        assert_eq!(client.handle(&late), Dispatch::Dropped);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sink.0.lock().unwrap().ended, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_command_runs_actions_and_completes() {
        let (client, screen, _) = client();
        client.handle(&msg(MessageType::Dialogue, "r1", 8, json!({"text": "tickles"})));
        client.handle(&msg(
            MessageType::SyncCommand,
            "r1",
            8,
            json!({
                "actions": [
                    {"timing": "start", "action": {"name": "surprised"}},
                    {"timing": 50, "action": {"name": "wave"}}
                ],
                "totalDuration": 2000
            }),
        ));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(screen.actions.lock().unwrap().len(), 1);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(screen.actions.lock().unwrap().len(), 2);
        assert_eq!(client.current_response().as_deref(), Some("r1"));
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(client.current_response().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn interruption_cancels_pending_actions() {
        let (client, screen, _) = client();
        client.handle(&msg(
            MessageType::SyncCommand,
            "r1",
            5,
            json!({
                "actions": [
                    {"timing": "start", "action": {"n": 1}},
                    {"timing": "late", "action": {"n": 2}}
                ],
                "totalDuration": 2000
            }),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.handle(&msg(MessageType::Dialogue, "r2", 10, json!({"text": "hey"})));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(*screen.actions.lock().unwrap(), vec![json!({"n": 1})]);
    }

    #[tokio::test(start_paused = true)]
    async fn unscoped_messages_bypass_arbitration() {
        let (client, screen, _) = client();
        client.handle(&msg(MessageType::Dialogue, "r1", 10, json!({"text": "busy"})));
        let system = OutboundMessage::unscoped(MessageType::System, json!({"event": "pong"}));
        assert_eq!(client.handle(&system), Dispatch::Forwarded);
        assert_eq!(*screen.forwarded.lock().unwrap(), vec![MessageType::System]);
        assert_eq!(client.current_response().as_deref(), Some("r1"));
    }

    #[tokio::test(start_paused = true)]
    async fn legacy_dialogue_without_id_is_shown() {
        let (client, screen, _) = client();
        let legacy = OutboundMessage::unscoped(MessageType::Dialogue, json!({"text": "old"}));
        assert_eq!(client.handle(&legacy), Dispatch::Applied);
        assert_eq!(screen.shown().as_deref(), Some("old"));
        assert!(client.current_response().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn legacy_dialogue_dropped_while_response_current() {
        let (client, screen, _) = client();
        client.handle(&msg(MessageType::Dialogue, "r1", 10, json!({"text": "answer"})));
        let legacy = OutboundMessage::unscoped(MessageType::Dialogue, json!({"text": "legacy"}));
        assert_eq!(client.handle(&legacy), Dispatch::Dropped);
        let legacy_chunk = OutboundMessage::unscoped(
            MessageType::DialogueStreamChunk,
            json!({"streamId": "s9", "delta": "x"}),
        );
        assert_eq!(client.handle(&legacy_chunk), Dispatch::Dropped);
        assert_eq!(screen.shown().as_deref(), Some("answer"));
        assert_eq!(client.current_response().as_deref(), Some("r1"));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_higher_priority_message_does_not_preempt() {
        let (client, screen, _) = client();
        client.handle(&msg(
            MessageType::Dialogue,
            "r1",
            5,
            json!({"text": "still here", "duration": 60_000}),
        ));
        let bad = msg(MessageType::Dialogue, "r2", 10, json!({"bogus": 1}));
        assert_eq!(client.handle(&bad), Dispatch::Dropped);
        assert_eq!(client.current_response().as_deref(), Some("r1"));
        assert_eq!(screen.shown().as_deref(), Some("still here"));
        assert!(!client.is_discarded("r1"));
        assert!(!client.is_discarded("r2"));

        // The original display timer still ends r1.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(client.current_response().is_none());
        let next = msg(MessageType::Dialogue, "r3", 8, json!({"text": "next"}));
        assert_eq!(client.handle(&next), Dispatch::Applied);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_command_without_duration_keeps_display_completion() {
        let (client, _, _) = client();
        client.handle(&msg(
            MessageType::Dialogue,
            "r1",
            10,
            json!({"text": "hi", "duration": 1000}),
        ));
        client.handle(&msg(
            MessageType::SyncCommand,
            "r1",
            10,
            json!({"actions": [{"timing": "start", "action": {"n": 1}}]}),
        ));
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(client.current_response().is_none());
        let next = msg(MessageType::Dialogue, "r2", 8, json!({"text": "next"}));
        assert_eq!(client.handle(&next), Dispatch::Applied);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_command_with_zero_duration_falls_back_to_default_display() {
        let (client, _, _) = client();
        client.handle(&msg(
            MessageType::SyncCommand,
            "r1",
            8,
            json!({"actions": [], "totalDuration": 0}),
        ));
        assert_eq!(client.current_response().as_deref(), Some("r1"));
        let default_ms = PetConfig::default().timeline.default_display_ms;
        tokio::time::sleep(Duration::from_millis(default_ms + 100)).await;
        assert!(client.current_response().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_payload_is_dropped() {
        let (client, _, _) = client();
        let bad = msg(MessageType::Dialogue, "r1", 10, json!({"nope": true}));
        assert_eq!(client.handle(&bad), Dispatch::Dropped);
        let bad_audio = msg(
            MessageType::AudioChunk,
            "r1",
            10,
            json!({"streamId": "a1", "chunk": "***"}),
        );
        assert_eq!(client.handle(&bad_audio), Dispatch::Dropped);
    }

    #[tokio::test(start_paused = true)]
    async fn handle_json_parses_wire_text() {
        let (client, screen, _) = client();
        let raw = r#"{"v":1,"type":"dialogue","responseId":"r1","priority":10,"data":{"text":"wire"}}"#;
        assert_eq!(client.handle_json(raw).expect("parse"), Dispatch::Applied);
        assert_eq!(screen.shown().as_deref(), Some("wire"));
        assert!(client.handle_json("{not json").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_interrupt_clears_everything() {
        let (client, screen, _) = client();
        client.handle(&msg(MessageType::Dialogue, "r1", 10, json!({"text": "talking"})));
        assert_eq!(client.interrupt().as_deref(), Some("r1"));
        assert!(screen.shown().is_none());
        assert_eq!(client.armed_timers(), 0);
        assert!(client.is_discarded("r1"));
    }
}
