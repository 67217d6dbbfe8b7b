use std::time::{Duration, Instant};

/// Per-connection packet counter with a bucketed window.
///
/// The first arrival after the window has elapsed starts a new window and
/// resets the count. The counter is signed so a kick can push it below zero
/// ([`RateTracker::penalize`]) and keep the connection from tripping again
/// while its close is still in flight.
#[derive(Debug, Default)]
pub struct RateTracker {
    occurrences: i64,
    window_start: Option<Instant>,
}

impl RateTracker {
    /// Creates a tracker with no recorded arrivals.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an arrival now and report whether it is within budget.
    pub fn allow(&mut self, window: Duration, max_count: u32) -> bool {
        self.allow_at(Instant::now(), window, max_count)
    }

    /// Record an arrival at `now` and report whether fewer than `max_count`
    /// arrivals preceded it in the current window.
    pub fn allow_at(&mut self, now: Instant, window: Duration, max_count: u32) -> bool {
        let expired = self
            .window_start
            .map_or(true, |start| now.saturating_duration_since(start) > window);
        if expired {
            self.occurrences = 0;
            self.window_start = Some(now);
        }
        self.occurrences = self.occurrences.saturating_add(1);
        self.occurrences <= i64::from(max_count)
    }

    /// Force the counter to `-max_count` after a violation.
    pub fn penalize(&mut self, max_count: u32) {
        self.occurrences = -i64::from(max_count);
    }

    /// Arrivals counted in the current window.
    #[must_use]
    pub fn occurrences(&self) -> i64 {
        self.occurrences
    }
}
