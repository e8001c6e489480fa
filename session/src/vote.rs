//! Pending governance votes
//!
//! Votes are sequenced by the host, so every peer sees the same entries in
//! the same order. A voter holds at most one entry per `(kind, target)`;
//! voting again overwrites it.

use crate::backoff::BackoffTimer;
use log::debug;
use shared::{ClientId, VoteKind};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteEntry {
    pub kind: VoteKind,
    /// Kicked client id, or 1/0 for pause/unpause
    pub target: u32,
    pub from: ClientId,
    pub approve: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    Pending,
    Approved,
    Denied,
}

#[derive(Debug)]
pub struct VoteLedger {
    entries: Vec<VoteEntry>,
    started_at: Option<Instant>,
    timeout: Duration,
    own_vote: BackoffTimer,
}

impl VoteLedger {
    pub fn new(timeout: Duration, min_own_interval: Duration) -> Self {
        Self {
            entries: Vec::new(),
            started_at: None,
            timeout,
            own_vote: BackoffTimer::new(min_own_interval),
        }
    }

    /// Records a vote; returns false if it only replaced an earlier one
    pub fn cast(&mut self, entry: VoteEntry, now: Instant) -> bool {
        if self.entries.is_empty() {
            self.started_at = Some(now);
        }
        if let Some(existing) = self.entries.iter_mut().find(|e| {
            e.kind == entry.kind && e.target == entry.target && e.from == entry.from
        }) {
            existing.approve = entry.approve;
            return false;
        }
        debug!(
            "Vote {} {} by client {}: {}",
            entry.kind, entry.target, entry.from, entry.approve
        );
        self.entries.push(entry);
        true
    }

    pub fn find(&self, kind: VoteKind, target: u32, from: ClientId) -> Option<&VoteEntry> {
        self.entries
            .iter()
            .find(|e| e.kind == kind && e.target == target && e.from == from)
    }

    pub fn is_pending(&self, kind: VoteKind, target: u32) -> bool {
        self.entries
            .iter()
            .any(|e| e.kind == kind && e.target == target)
    }

    /// Client that opened the vote on `(kind, target)`
    pub fn origin(&self, kind: VoteKind, target: u32) -> Option<ClientId> {
        self.entries
            .iter()
            .find(|e| e.kind == kind && e.target == target)
            .map(|e| e.from)
    }

    /// Oldest pending vote
    pub fn first(&self) -> Option<&VoteEntry> {
        self.entries.first()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Counts the votes of `eligible` clients on `(kind, target)`
    ///
    /// A strict majority of approvals passes the vote. Half of the
    /// electorate disapproving fails it.
    pub fn tally(&self, kind: VoteKind, target: u32, eligible: &[ClientId]) -> VoteOutcome {
        let mut positive = 0usize;
        let mut negative = 0usize;
        for entry in &self.entries {
            if entry.kind != kind || entry.target != target || !eligible.contains(&entry.from) {
                continue;
            }
            if entry.approve {
                positive += 1;
            } else {
                negative += 1;
            }
        }

        let votes = eligible.len();
        if positive * 2 > votes {
            VoteOutcome::Approved
        } else if negative * 2 >= votes {
            VoteOutcome::Denied
        } else {
            VoteOutcome::Pending
        }
    }

    /// Purges every entry on `(kind, target)` and restarts the clock for
    /// whatever remains
    pub fn end_vote(&mut self, kind: VoteKind, target: u32, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.kind == kind && e.target == target));
        self.started_at = if self.entries.is_empty() {
            None
        } else {
            Some(now)
        };
        before - self.entries.len()
    }

    /// The oldest vote once it has been pending for too long
    pub fn expired(&self, now: Instant) -> Option<(VoteKind, u32)> {
        let started = self.started_at?;
        if now.saturating_duration_since(started) <= self.timeout {
            return None;
        }
        self.first().map(|e| (e.kind, e.target))
    }

    /// Whether the local peer may start another vote of its own
    pub fn may_start_own(&self, now: Instant) -> bool {
        self.own_vote.is_due(now)
    }

    pub fn note_own_vote(&mut self, now: Instant) {
        self.own_vote.fire(now);
    }

    pub fn reset_own_limit(&mut self) {
        self.own_vote.reset();
    }

    /// Cancels everything; returns how many entries were dropped
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        self.started_at = None;
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kick(target: u32, from: ClientId, approve: bool) -> VoteEntry {
        VoteEntry {
            kind: VoteKind::Kick,
            target,
            from,
            approve,
        }
    }

    fn ledger() -> VoteLedger {
        VoteLedger::new(Duration::from_secs(10), Duration::from_secs(120))
    }

    #[test]
    fn test_duplicate_vote_is_idempotent() {
        let now = Instant::now();
        let mut votes = ledger();

        assert!(votes.cast(kick(2, 1, true), now));
        assert!(!votes.cast(kick(2, 1, true), now));
        assert_eq!(votes.len(), 1);

        // Last write wins
        assert!(!votes.cast(kick(2, 1, false), now));
        assert_eq!(votes.len(), 1);
        assert!(!votes.find(VoteKind::Kick, 2, 1).unwrap().approve);
    }

    #[test]
    fn test_kick_needs_both_other_voters() {
        let now = Instant::now();
        let mut votes = ledger();
        // Client 2 is the kick target and therefore not eligible
        let eligible = [0, 1];

        votes.cast(kick(2, 1, true), now);
        votes.cast(kick(2, 1, true), now);
        votes.cast(kick(2, 2, false), now);
        assert_eq!(votes.tally(VoteKind::Kick, 2, &eligible), VoteOutcome::Pending);

        votes.cast(kick(2, 0, true), now);
        assert_eq!(votes.tally(VoteKind::Kick, 2, &eligible), VoteOutcome::Approved);
    }

    #[test]
    fn test_half_disapproval_denies() {
        let now = Instant::now();
        let mut votes = ledger();
        let eligible = [0, 1, 3, 4];

        votes.cast(kick(2, 0, true), now);
        votes.cast(kick(2, 1, false), now);
        assert_eq!(votes.tally(VoteKind::Kick, 2, &eligible), VoteOutcome::Pending);

        votes.cast(kick(2, 3, false), now);
        assert_eq!(votes.tally(VoteKind::Kick, 2, &eligible), VoteOutcome::Denied);
    }

    #[test]
    fn test_end_vote_purges_matching_entries() {
        let now = Instant::now();
        let mut votes = ledger();
        votes.cast(kick(2, 0, true), now);
        votes.cast(kick(2, 1, true), now);
        votes.cast(
            VoteEntry {
                kind: VoteKind::Pause,
                target: 1,
                from: 1,
                approve: true,
            },
            now,
        );

        assert_eq!(votes.origin(VoteKind::Kick, 2), Some(0));
        assert_eq!(votes.end_vote(VoteKind::Kick, 2, now), 2);
        assert_eq!(votes.origin(VoteKind::Kick, 2), None);
        assert_eq!(votes.len(), 1);
        assert!(votes.is_pending(VoteKind::Pause, 1));
        assert!(!votes.is_pending(VoteKind::Kick, 2));
    }

    #[test]
    fn test_vote_timeout() {
        let start = Instant::now();
        let mut votes = ledger();
        assert_eq!(votes.expired(start), None);

        votes.cast(kick(2, 0, true), start);
        assert_eq!(votes.expired(start + Duration::from_secs(10)), None);
        assert_eq!(
            votes.expired(start + Duration::from_secs(11)),
            Some((VoteKind::Kick, 2))
        );

        votes.end_vote(VoteKind::Kick, 2, start + Duration::from_secs(11));
        assert_eq!(votes.expired(start + Duration::from_secs(60)), None);
    }

    #[test]
    fn test_own_vote_rate_limit() {
        let start = Instant::now();
        let mut votes = ledger();

        assert!(votes.may_start_own(start));
        votes.note_own_vote(start);
        assert!(!votes.may_start_own(start + Duration::from_secs(60)));
        assert!(votes.may_start_own(start + Duration::from_secs(120)));

        votes.note_own_vote(start);
        votes.reset_own_limit();
        assert!(votes.may_start_own(start));
    }

    #[test]
    fn test_clear_drops_everything_once() {
        let now = Instant::now();
        let mut votes = ledger();
        votes.cast(kick(2, 0, true), now);

        assert_eq!(votes.clear(), 1);
        assert_eq!(votes.clear(), 0);
        assert!(votes.is_empty());
    }
}
