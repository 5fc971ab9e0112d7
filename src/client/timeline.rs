//! Timed renderer actions against a response's duration.
//!
//! Every armed entry owns a [`CancellationToken`]. [`Timeline::clear`]
//! cancels all of them, and a timer whose token was cancelled never runs
//! its callback, even if the sleep had already elapsed.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::envelope::Timing;

/// Work run when a timeline entry fires.
pub type TimelineCallback = Box<dyn FnOnce() + Send + 'static>;

/// An entry as handed to [`Timeline::set_timeline`].
pub struct TimelineEntry {
    pub timing: Timing,
    pub callback: TimelineCallback,
}

impl TimelineEntry {
    pub fn new(timing: Timing, callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            timing,
            callback: Box::new(callback),
        }
    }
}

impl std::fmt::Debug for TimelineEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineEntry")
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}

struct Scheduled {
    delay: Duration,
    callback: TimelineCallback,
}

struct Armed {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Resolves and arms timed callbacks. Must be driven from inside a Tokio runtime.
#[derive(Default)]
pub struct Timeline {
    pending: Vec<Scheduled>,
    armed: Vec<Armed>,
}

/// Offset of `timing` into a response lasting `total`.
///
/// Percentages are clamped to 0-100. Returns `None` for non-finite percentages.
pub fn resolve_offset(timing: Timing, total: Duration) -> Option<Duration> {
    let fraction = match timing {
        Timing::Anchor(anchor) => anchor.fraction(),
        Timing::Percent(percent) if percent.is_finite() => percent.clamp(0.0, 100.0) / 100.0,
        Timing::Percent(_) => return None,
    };
    let millis = (total.as_millis() as f64 * fraction).round() as u64;
    Some(Duration::from_millis(millis))
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the timeline with `entries` resolved against `total_duration_ms`.
    ///
    /// Cancels everything previously armed or pending. Entries are only staged;
    /// call [`Timeline::start`] to arm them. Without a positive duration every
    /// entry is dropped, since none of them could fire at a meaningful time.
    /// Returns the number of entries staged.
    pub fn set_timeline(
        &mut self,
        entries: Vec<TimelineEntry>,
        total_duration_ms: Option<u64>,
    ) -> usize {
        self.clear();

        let total = match total_duration_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms),
            _ => {
                if !entries.is_empty() {
                    warn!(
                        dropped = entries.len(),
                        "timeline has no duration; entries dropped"
                    );
                }
                return 0;
            }
        };

        for entry in entries {
            match resolve_offset(entry.timing, total) {
                Some(delay) => self.pending.push(Scheduled {
                    delay,
                    callback: entry.callback,
                }),
                None => warn!(timing = ?entry.timing, "unresolvable timeline entry dropped"),
            }
        }
        self.pending.len()
    }

    /// Arm every staged entry relative to now.
    pub fn start(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        debug!(entries = pending.len(), "timeline started");
        for scheduled in pending {
            self.arm(scheduled.delay, scheduled.callback);
        }
    }

    /// Arm a single callback `delay` from now, alongside the current timeline.
    ///
    /// It is cancelled by [`Timeline::clear`] like any other entry.
    pub fn schedule_after(&mut self, delay: Duration, callback: impl FnOnce() + Send + 'static) {
        self.arm(delay, Box::new(callback));
    }

    fn arm(&mut self, delay: Duration, callback: TimelineCallback) {
        self.armed.retain(|armed| !armed.task.is_finished());
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                () = cancelled.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if !cancelled.is_cancelled() {
                        callback();
                    }
                }
            }
        });
        self.armed.push(Armed { token, task });
    }

    /// Cancel every armed and staged entry.
    pub fn clear(&mut self) {
        for armed in self.armed.drain(..) {
            armed.token.cancel();
        }
        self.pending.clear();
    }

    /// Entries staged by [`Timeline::set_timeline`] and not yet started.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Armed timers that have neither fired nor been cancelled.
    pub fn armed_len(&self) -> usize {
        self.armed
            .iter()
            .filter(|armed| !armed.task.is_finished())
            .count()
    }
}

impl Drop for Timeline {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::protocol::envelope::Anchor;
    use std::sync::{Arc, Mutex};

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn entry(
        timing: Timing,
        log: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
    ) -> TimelineEntry {
        let log = Arc::clone(log);
        TimelineEntry::new(timing, move || log.lock().expect("log lock").push(name))
    }

    fn fired(log: &Arc<Mutex<Vec<&'static str>>>) -> Vec<&'static str> {
        log.lock().expect("log lock").clone()
    }

    #[test]
    fn anchors_resolve_to_fractions() {
        let total = Duration::from_millis(1000);
        let at = |t| resolve_offset(t, total).unwrap().as_millis();
        assert_eq!(at(Timing::Anchor(Anchor::Start)), 0);
        assert_eq!(at(Timing::Anchor(Anchor::Early)), 150);
        assert_eq!(at(Timing::Anchor(Anchor::Middle)), 500);
        assert_eq!(at(Timing::Anchor(Anchor::Late)), 850);
        assert_eq!(at(Timing::Anchor(Anchor::End)), 980);
    }

    #[test]
    fn percentages_are_clamped() {
        let total = Duration::from_millis(1000);
        assert_eq!(
            resolve_offset(Timing::Percent(25.0), total).unwrap(),
            Duration::from_millis(250)
        );
        assert_eq!(
            resolve_offset(Timing::Percent(150.0), total).unwrap(),
            total
        );
        assert_eq!(
            resolve_offset(Timing::Percent(-5.0), total).unwrap(),
            Duration::ZERO
        );
        assert!(resolve_offset(Timing::Percent(f64::NAN), total).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_fire_in_time_order() {
        let log = recorder();
        let mut timeline = Timeline::new();
        let staged = timeline.set_timeline(
            vec![
                entry(Timing::Anchor(Anchor::End), &log, "end"),
                entry(Timing::Anchor(Anchor::Start), &log, "start"),
                entry(Timing::Percent(50.0), &log, "half"),
            ],
            Some(1000),
        );
        assert_eq!(staged, 3);
        timeline.start();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired(&log), vec!["start"]);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(fired(&log), vec!["start", "half", "end"]);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cancels_outstanding_entries() {
        let log = recorder();
        let mut timeline = Timeline::new();
        timeline.set_timeline(
            vec![
                entry(Timing::Anchor(Anchor::Start), &log, "f1"),
                entry(Timing::Anchor(Anchor::Late), &log, "f2"),
            ],
            Some(2000),
        );
        timeline.start();

        tokio::time::sleep(Duration::from_millis(500)).await;
        timeline.clear();
        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(fired(&log), vec!["f1"]);
        assert_eq!(timeline.armed_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_twice_then_empty_start_schedules_nothing() {
        let log = recorder();
        let mut timeline = Timeline::new();
        timeline.set_timeline(vec![entry(Timing::Anchor(Anchor::End), &log, "f")], Some(100));
        timeline.start();
        timeline.clear();
        timeline.clear();
        timeline.start();
        assert_eq!(timeline.pending_len(), 0);
        assert_eq!(timeline.armed_len(), 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(fired(&log).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn set_timeline_replaces_previous() {
        let log = recorder();
        let mut timeline = Timeline::new();
        timeline.set_timeline(vec![entry(Timing::Percent(50.0), &log, "old")], Some(1000));
        timeline.start();
        timeline.set_timeline(vec![entry(Timing::Percent(50.0), &log, "new")], Some(1000));
        timeline.start();

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(fired(&log), vec!["new"]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_duration_drops_entries() {
        let log = recorder();
        let mut timeline = Timeline::new();
        assert_eq!(
            timeline.set_timeline(vec![entry(Timing::Anchor(Anchor::Start), &log, "x")], None),
            0
        );
        assert_eq!(
            timeline.set_timeline(vec![entry(Timing::Anchor(Anchor::Start), &log, "y")], Some(0)),
            0
        );
        timeline.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fired(&log).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn nan_percentage_dropped_rest_kept() {
        let log = recorder();
        let mut timeline = Timeline::new();
        let staged = timeline.set_timeline(
            vec![
                entry(Timing::Percent(f64::NAN), &log, "bad"),
                entry(Timing::Percent(10.0), &log, "good"),
            ],
            Some(1000),
        );
        assert_eq!(staged, 1);
        timeline.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired(&log), vec!["good"]);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_after_is_cleared_with_timeline() {
        let log = recorder();
        let mut timeline = Timeline::new();
        let l = Arc::clone(&log);
        timeline.schedule_after(Duration::from_millis(100), move || {
            l.lock().expect("log lock").push("done");
        });
        assert_eq!(timeline.armed_len(), 1);
        timeline.clear();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fired(&log).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fired_timers_are_pruned() {
        let log = recorder();
        let mut timeline = Timeline::new();
        let l = Arc::clone(&log);
        timeline.schedule_after(Duration::from_millis(10), move || {
            l.lock().expect("log lock").push("a");
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired(&log), vec!["a"]);
        assert_eq!(timeline.armed_len(), 0);
    }
}
