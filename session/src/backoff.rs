use std::time::{Duration, Instant};

/// Interval gate shared by every periodic duty of the coordinator
///
/// Holds only the interval and the instant it last fired. An unfired timer
/// is always due.
#[derive(Debug, Clone)]
pub struct BackoffTimer {
    interval: Duration,
    last_fired: Option<Instant>,
}

impl BackoffTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_fired: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn last_fired(&self) -> Option<Instant> {
        self.last_fired
    }

    pub fn is_armed(&self) -> bool {
        self.last_fired.is_some()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_fired {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.interval,
        }
    }

    pub fn fire(&mut self, now: Instant) {
        self.last_fired = Some(now);
    }

    /// Fires and returns true if the interval has elapsed
    pub fn try_fire(&mut self, now: Instant) -> bool {
        if self.is_due(now) {
            self.fire(now);
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.last_fired = None;
    }
}
