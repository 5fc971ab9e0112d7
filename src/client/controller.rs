//! Arbitration of which response owns the screen and speaker.
//!
//! Exactly one [`ResponseSession`] is current at a time. A newcomer with
//! priority greater than or equal to the current one interrupts it (equal
//! priority preempts, which gives same-class barge-in); a lower-priority
//! newcomer is discarded. Interrupted and rejected ids go into a bounded
//! FIFO set so their straggling fragments are dropped silently.

use std::collections::{HashSet, VecDeque};
use std::time::Instant;
use tracing::{debug, info};

/// Capabilities the controller needs from the playback/display side.
///
/// Called synchronously during an interruption, before the challenger is admitted.
pub trait ResponseHost {
    /// Stop audio playback and cancel every pending timeline entry.
    fn stop(&mut self);
    /// Clear any displayed text.
    fn clear(&mut self);
}

/// The response currently allowed to drive display and audio.
#[derive(Debug, Clone)]
pub struct ResponseSession {
    pub id: String,
    pub priority: i32,
    pub created_at: Instant,
    /// An audio sub-stream belongs to this response.
    pub audio_active: bool,
}

/// Bounded set of discarded response ids; the oldest id is evicted first.
#[derive(Debug)]
pub struct DiscardedIds {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl DiscardedIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `id`, evicting the oldest entry when full.
    pub fn insert(&mut self, id: &str) {
        if self.capacity == 0 || self.members.contains(id) {
            return;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.order.push_back(id.to_owned());
        self.members.insert(id.to_owned());
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Client-side response arbiter. One per client connection.
pub struct ResponseController<H: ResponseHost> {
    current: Option<ResponseSession>,
    discarded: DiscardedIds,
    host: H,
}

impl<H: ResponseHost> ResponseController<H> {
    pub fn new(host: H, discarded_capacity: usize) -> Self {
        Self {
            current: None,
            discarded: DiscardedIds::new(discarded_capacity),
            host,
        }
    }

    /// Decide whether a message opening (or continuing) `response_id` may proceed.
    pub fn should_accept(&mut self, response_id: &str, priority: i32) -> bool {
        if let Some(current) = &self.current {
            if current.id == response_id {
                return true;
            }
        }
        if self.discarded.contains(response_id) {
            debug!(response_id, "fragment of discarded response dropped");
            return false;
        }

        let Some(current) = &self.current else {
            self.admit(response_id, priority);
            return true;
        };

        if priority >= current.priority {
            info!(
                interrupted = %current.id,
                interrupted_priority = current.priority,
                challenger = response_id,
                challenger_priority = priority,
                "response preempted"
            );
            self.interrupt_current();
            self.admit(response_id, priority);
            true
        } else {
            info!(
                current = %current.id,
                current_priority = current.priority,
                rejected = response_id,
                rejected_priority = priority,
                "lower-priority response discarded"
            );
            self.discarded.insert(response_id);
            false
        }
    }

    /// Whether a trailing fragment for `response_id` may be applied.
    ///
    /// With no current response, unknown ids pass so unscoped legacy traffic still flows.
    pub fn is_active(&self, response_id: &str) -> bool {
        if self.discarded.contains(response_id) {
            return false;
        }
        match &self.current {
            Some(current) => current.id == response_id,
            None => true,
        }
    }

    /// Record that the current response carries an audio sub-stream.
    pub fn mark_audio_active(&mut self) {
        if let Some(current) = self.current.as_mut() {
            current.audio_active = true;
        }
    }

    /// Natural end of a response.
    ///
    /// Clears the current response only when `response_id` matches it (or is
    /// `None`); a stale completion for a superseded response is a no-op.
    /// Returns whether the current response was cleared.
    pub fn notify_complete(&mut self, response_id: Option<&str>) -> bool {
        let matches = match (&self.current, response_id) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(current), Some(id)) => current.id == id,
        };
        if matches {
            if let Some(done) = self.current.take() {
                debug!(response_id = %done.id, "response completed");
            }
        }
        matches
    }

    /// Interrupt the current response without admitting a new one.
    ///
    /// Returns the interrupted id, if there was one.
    pub fn interrupt_current(&mut self) -> Option<String> {
        let interrupted = self.current.take()?;
        self.host.stop();
        self.host.clear();
        self.discarded.insert(&interrupted.id);
        Some(interrupted.id)
    }

    fn admit(&mut self, response_id: &str, priority: i32) {
        self.current = Some(ResponseSession {
            id: response_id.to_owned(),
            priority,
            created_at: Instant::now(),
            audio_active: false,
        });
    }

    pub fn current(&self) -> Option<&ResponseSession> {
        self.current.as_ref()
    }

    /// Whether the current response has an audio sub-stream.
    pub fn audio_active(&self) -> bool {
        self.current.as_ref().is_some_and(|c| c.audio_active)
    }

    pub fn is_discarded(&self, response_id: &str) -> bool {
        self.discarded.contains(response_id)
    }

    pub fn discarded_len(&self) -> usize {
        self.discarded.len()
    }

    #[cfg(test)]
    pub(crate) fn host(&self) -> &H {
        &self.host
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[derive(Default)]
    struct CountingHost {
        stops: usize,
        clears: usize,
    }

    impl ResponseHost for CountingHost {
        fn stop(&mut self) {
            self.stops += 1;
        }

        fn clear(&mut self) {
            self.clears += 1;
        }
    }

    fn controller(capacity: usize) -> ResponseController<CountingHost> {
        ResponseController::new(CountingHost::default(), capacity)
    }

    fn current_id(c: &ResponseController<CountingHost>) -> Option<&str> {
        c.current().map(|s| s.id.as_str())
    }

    #[test]
    fn first_response_becomes_current() {
        let mut c = controller(10);
        assert!(c.should_accept("r1", 10));
        assert_eq!(current_id(&c), Some("r1"));
        assert_eq!(c.host().stops, 0);
    }

    #[test]
    fn continuation_always_accepted() {
        let mut c = controller(10);
        assert!(c.should_accept("r1", 3));
        assert!(c.should_accept("r1", 0));
        assert_eq!(c.current().unwrap().priority, 3);
    }

    #[test]
    fn lower_priority_is_discarded() {
        let mut c = controller(10);
        assert!(c.should_accept("r1", 10));
        assert!(!c.should_accept("r2", 5));
        assert_eq!(current_id(&c), Some("r1"));
        assert!(c.is_discarded("r2"));
        assert_eq!(c.host().stops, 0);
    }

    #[test]
    fn equal_priority_preempts() {
        let mut c = controller(10);
        assert!(c.should_accept("r1", 8));
        assert!(c.should_accept("r2", 8));
        assert_eq!(current_id(&c), Some("r2"));
        assert!(c.is_discarded("r1"));
        assert_eq!(c.host().stops, 1);
        assert_eq!(c.host().clears, 1);
    }

    #[test]
    fn scenario_priority_sequence() {
        let mut c = controller(10);
        assert!(c.should_accept("r1", 10));
        assert!(!c.should_accept("r2", 5));
        assert_eq!(current_id(&c), Some("r1"));
        assert!(c.should_accept("r3", 10));
        assert_eq!(current_id(&c), Some("r3"));
        assert_eq!(c.current().unwrap().priority, 10);
        assert!(c.is_discarded("r1"));
        assert!(c.is_discarded("r2"));
    }

    #[test]
    fn discarded_id_never_returns_before_eviction() {
        let mut c = controller(10);
        c.should_accept("r1", 5);
        c.should_accept("r2", 5);
        assert!(!c.should_accept("r1", 100));
        assert!(!c.is_active("r1"));

        // Even with nothing current, a discarded id stays out.
        assert!(c.notify_complete(Some("r2")));
        assert!(c.current().is_none());
        assert!(!c.should_accept("r1", 100));
        assert!(!c.is_active("r1"));
    }

    #[test]
    fn is_active_rules() {
        let mut c = controller(10);
        assert!(c.is_active("anything"), "no current session permits legacy traffic");
        c.should_accept("r1", 5);
        assert!(c.is_active("r1"));
        assert!(!c.is_active("r9"));
    }

    #[test]
    fn stale_completion_is_noop() {
        let mut c = controller(10);
        c.should_accept("r1", 5);
        c.should_accept("r2", 5);
        assert!(!c.notify_complete(Some("r1")));
        assert_eq!(current_id(&c), Some("r2"));
        assert!(c.notify_complete(Some("r2")));
        assert!(c.current().is_none());
    }

    #[test]
    fn completion_without_id_clears_current() {
        let mut c = controller(10);
        assert!(!c.notify_complete(None));
        c.should_accept("r1", 5);
        assert!(c.notify_complete(None));
        assert!(c.current().is_none());
        // Naturally completed ids are not discarded.
        assert!(!c.is_discarded("r1"));
    }

    #[test]
    fn audio_flag_tracks_current() {
        let mut c = controller(10);
        c.mark_audio_active();
        assert!(!c.audio_active());
        c.should_accept("r1", 5);
        c.mark_audio_active();
        assert!(c.audio_active());
        c.should_accept("r2", 5);
        assert!(!c.audio_active());
    }

    #[test]
    fn explicit_interrupt() {
        let mut c = controller(10);
        assert_eq!(c.interrupt_current(), None);
        c.should_accept("r1", 5);
        assert_eq!(c.interrupt_current().as_deref(), Some("r1"));
        assert!(c.current().is_none());
        assert!(!c.is_active("r1"));
        assert_eq!(c.host().stops, 1);
    }

    #[test]
    fn at_most_one_current_across_sequences() {
        let mut c = controller(4);
        let priorities = [3, 10, 5, 10, 8, 0, 10, 3, 8, 8];
        for (i, p) in priorities.iter().enumerate() {
            let id = format!("r{i}");
            let accepted = c.should_accept(&id, *p);
            if accepted {
                assert_eq!(current_id(&c), Some(id.as_str()));
            }
            assert!(c.current().is_some());
            if i % 4 == 3 {
                let cur = c.current().unwrap().id.clone();
                c.notify_complete(Some(&cur));
            }
        }
    }

    #[test]
    fn discarded_set_evicts_oldest() {
        let mut set = DiscardedIds::new(2);
        set.insert("a");
        set.insert("b");
        set.insert("a");
        assert_eq!(set.len(), 2);
        set.insert("c");
        assert!(!set.contains("a"));
        assert!(set.contains("b"));
        assert!(set.contains("c"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn evicted_id_can_be_readmitted() {
        let mut c = controller(1);
        c.should_accept("r1", 10);
        c.should_accept("r2", 5);
        c.should_accept("r3", 5);
        assert!(!c.is_discarded("r2"));
        assert!(c.is_discarded("r3"));
    }

    #[test]
    fn zero_capacity_set_records_nothing() {
        let mut set = DiscardedIds::new(0);
        set.insert("a");
        assert!(set.is_empty());
    }
}
