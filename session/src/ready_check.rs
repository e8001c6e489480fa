use crate::backoff::BackoffTimer;
use shared::ClientId;
use std::time::{Duration, Instant};

/// What a peer does with an incoming ready-check request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyCheckStep {
    /// A prompt is already open; the request is dropped
    Ignored,
    /// Answer straight away without asking the user
    Answer(bool),
    /// Ask the user; the answer arrives through `answer` or the timeout
    Prompt,
}

#[derive(Debug, Clone, Copy)]
struct PendingPrompt {
    requested_by: ClientId,
    since: Instant,
}

/// Lobby-only "is everyone ready" poll
///
/// Tracks the local confirmation prompt and the host's request cooldown.
/// An unanswered prompt resolves to not ready.
#[derive(Debug)]
pub struct ReadyCheckCoordinator {
    prompt: Option<PendingPrompt>,
    timeout: Duration,
    cooldown: BackoffTimer,
}

impl ReadyCheckCoordinator {
    pub fn new(timeout: Duration, cooldown: Duration) -> Self {
        Self {
            prompt: None,
            timeout,
            cooldown: BackoffTimer::new(cooldown),
        }
    }

    pub fn is_prompting(&self) -> bool {
        self.prompt.is_some()
    }

    pub fn requested_by(&self) -> Option<ClientId> {
        self.prompt.map(|p| p.requested_by)
    }

    /// Host side: whether a new request may go out now
    pub fn try_request(&mut self, now: Instant) -> bool {
        !self.is_prompting() && self.cooldown.try_fire(now)
    }

    pub fn on_request(&mut self, requested_by: ClientId, can_be_ready: bool, now: Instant) -> ReadyCheckStep {
        if self.is_prompting() {
            return ReadyCheckStep::Ignored;
        }
        if !can_be_ready {
            return ReadyCheckStep::Answer(false);
        }
        self.prompt = Some(PendingPrompt {
            requested_by,
            since: now,
        });
        ReadyCheckStep::Prompt
    }

    /// Closes the prompt with the user's answer
    pub fn answer(&mut self, ready: bool) -> Option<bool> {
        self.prompt.take().map(|_| ready)
    }

    /// Resolves an expired prompt as not ready
    pub fn poll_timeout(&mut self, now: Instant) -> Option<bool> {
        let prompt = self.prompt?;
        if now.saturating_duration_since(prompt.since) >= self.timeout {
            self.prompt = None;
            return Some(false);
        }
        None
    }

    /// Drops an open prompt; true only if one was open
    pub fn cancel(&mut self) -> bool {
        self.prompt.take().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> ReadyCheckCoordinator {
        ReadyCheckCoordinator::new(Duration::from_secs(15), Duration::from_secs(30))
    }

    #[test]
    fn test_prompt_blocks_second_request() {
        let now = Instant::now();
        let mut check = coordinator();

        assert_eq!(check.on_request(0, true, now), ReadyCheckStep::Prompt);
        assert_eq!(check.on_request(0, true, now), ReadyCheckStep::Ignored);
        assert_eq!(check.requested_by(), Some(0));

        assert_eq!(check.answer(true), Some(true));
        assert_eq!(check.answer(true), None);
        assert_eq!(check.on_request(0, true, now), ReadyCheckStep::Prompt);
    }

    #[test]
    fn test_auto_decline_when_not_able() {
        let mut check = coordinator();
        assert_eq!(
            check.on_request(0, false, Instant::now()),
            ReadyCheckStep::Answer(false)
        );
        assert!(!check.is_prompting());
    }

    #[test]
    fn test_timeout_defaults_to_not_ready() {
        let start = Instant::now();
        let mut check = coordinator();
        check.on_request(0, true, start);

        assert_eq!(check.poll_timeout(start + Duration::from_secs(14)), None);
        assert_eq!(
            check.poll_timeout(start + Duration::from_secs(15)),
            Some(false)
        );
        assert_eq!(check.poll_timeout(start + Duration::from_secs(16)), None);
    }

    #[test]
    fn test_request_cooldown() {
        let start = Instant::now();
        let mut check = coordinator();

        assert!(check.try_request(start));
        assert!(!check.try_request(start + Duration::from_secs(10)));
        assert!(check.try_request(start + Duration::from_secs(30)));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut check = coordinator();
        check.on_request(0, true, Instant::now());

        assert!(check.cancel());
        assert!(!check.cancel());
    }
}
