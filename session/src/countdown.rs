//! Lobby countdown
//!
//! The host counts down in whole seconds and announces the remaining time
//! at a granularity that grows finer towards zero. Expiry does not start
//! the session by itself: the start is taken with `take_start`, and an
//! abort at any point before that prevents it.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownState {
    Running,
    Expired,
    Started,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct Countdown {
    total: u32,
    remaining: u32,
    started_at: Instant,
    almost_start: u32,
    state: CountdownState,
}

impl Countdown {
    pub fn new(seconds: u32, almost_start: u32, now: Instant) -> Self {
        Self {
            total: seconds,
            remaining: seconds,
            started_at: now,
            almost_start,
            state: if seconds == 0 {
                CountdownState::Expired
            } else {
                CountdownState::Running
            },
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn state(&self) -> CountdownState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, CountdownState::Running | CountdownState::Expired)
    }

    /// Every second near the end, every ten below ten minutes, otherwise
    /// once a minute
    pub fn should_announce(&self, seconds: u32) -> bool {
        seconds <= self.almost_start || (seconds <= 600 && seconds % 10 == 0) || seconds % 60 == 0
    }

    /// Advances to the current time; returns the value to broadcast, if any
    pub fn tick(&mut self, now: Instant) -> Option<u32> {
        if self.state != CountdownState::Running {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.started_at).as_secs();
        let remaining = u64::from(self.total).saturating_sub(elapsed) as u32;
        if remaining == self.remaining {
            return None;
        }

        let announce = (remaining..self.remaining).any(|s| self.should_announce(s));
        self.remaining = remaining;
        if remaining == 0 {
            self.state = CountdownState::Expired;
        }
        announce.then_some(remaining)
    }

    /// Consumes the expiry; true exactly once, and never after an abort
    pub fn take_start(&mut self) -> bool {
        if self.state == CountdownState::Expired {
            self.state = CountdownState::Started;
            true
        } else {
            false
        }
    }

    /// Returns true if this call aborted a live countdown
    pub fn abort(&mut self) -> bool {
        if self.is_active() {
            self.state = CountdownState::Aborted;
            true
        } else {
            false
        }
    }

    /// Time until the next whole second elapses
    pub fn until_next(&self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.started_at);
        Duration::from_secs(elapsed.as_secs() + 1).saturating_sub(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announcement_granularity() {
        let countdown = Countdown::new(900, 20, Instant::now());

        assert!(countdown.should_announce(900));
        assert!(countdown.should_announce(840));
        assert!(!countdown.should_announce(850));
        assert!(countdown.should_announce(590));
        assert!(!countdown.should_announce(595));
        assert!(countdown.should_announce(19));
        assert!(countdown.should_announce(1));
    }

    #[test]
    fn test_tick_announces_and_expires() {
        let start = Instant::now();
        let mut countdown = Countdown::new(25, 20, start);

        assert_eq!(countdown.tick(start + Duration::from_millis(500)), None);
        // 24 is not announced
        assert_eq!(countdown.tick(start + Duration::from_secs(1)), None);
        assert_eq!(countdown.tick(start + Duration::from_secs(5)), Some(20));
        assert_eq!(countdown.tick(start + Duration::from_secs(6)), Some(19));
        assert!(!countdown.take_start());

        assert_eq!(countdown.tick(start + Duration::from_secs(30)), Some(0));
        assert_eq!(countdown.state(), CountdownState::Expired);
        assert!(countdown.take_start());
        assert!(!countdown.take_start());
    }

    #[test]
    fn test_skipped_seconds_still_announce() {
        let start = Instant::now();
        let mut countdown = Countdown::new(75, 20, start);

        // Jumped from 75 to 58; 70 and 60 were passed on the way
        assert_eq!(countdown.tick(start + Duration::from_secs(17)), Some(58));
    }

    #[test]
    fn test_abort_after_expiry_prevents_start() {
        let start = Instant::now();
        let mut countdown = Countdown::new(3, 20, start);
        assert_eq!(countdown.tick(start + Duration::from_secs(3)), Some(0));

        assert!(countdown.abort());
        assert!(!countdown.abort());
        assert!(!countdown.take_start());
        assert_eq!(countdown.tick(start + Duration::from_secs(4)), None);
    }

    #[test]
    fn test_abort_after_start_is_noop() {
        let start = Instant::now();
        let mut countdown = Countdown::new(0, 20, start);

        assert!(countdown.take_start());
        assert!(!countdown.abort());
        assert_eq!(countdown.state(), CountdownState::Started);
    }
}
