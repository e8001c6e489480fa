//! Session tuning knobs and protocol intervals

use crate::streaming::StreamLimits;
use shared::{ResourceKind, RES_CHUNK_SIZE};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration shared by host and client roles
///
/// Every interval the coordinator waits on lives here so tests can shrink
/// them. `Default` carries the values used on real networks.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Session title advertised to joiners and the master server
    pub title: String,
    /// Join password; `None` means an open session
    pub password: Option<String>,
    /// Whether clients may join once the session is hosted
    pub allow_join: bool,
    /// Ranked sessions require hashed resources and a league
    pub ranked: bool,
    pub league_address: Option<String>,
    /// Keep hosting when the league refuses the session
    pub continue_without_league: bool,
    /// Clamp ticks proposed by status acks to the engine's known maximum
    pub clamp_ack_ticks: bool,
    /// Treat the lobby as running as soon as the phase is entered
    pub auto_open_lobby: bool,
    /// Directory received and generated resources are written to
    pub work_dir: PathBuf,
    /// Files the host publishes when the session is created
    pub resources: Vec<(PathBuf, ResourceKind)>,
    pub chunk_size: usize,
    pub frames_per_second: u32,

    pub res_retrieve_timeout: Duration,
    pub chunk_request_interval: Duration,
    pub activation_request_interval: Duration,
    /// Frames a client may lag behind when asking for activation
    pub max_behind_for_activation: u32,
    /// Frames without activity before an activated client is deactivated
    pub deactivation_delay: u32,
    pub chase_target_interval: Duration,
    pub barrier_resend_interval: Duration,
    pub reference_update_interval: Duration,
    pub min_league_update_interval: Duration,
    pub league_update_interval: Duration,
    pub league_end_retries: u32,
    /// Record streaming limits, used when the league hands out a stream address
    pub stream_limits: StreamLimits,
    pub vote_timeout: Duration,
    pub min_vote_interval: Duration,
    pub ready_check_timeout: Duration,
    /// Minimum spacing between two ready checks requested by the host
    pub ready_check_cooldown: Duration,
    /// Below this many seconds the countdown is announced every second
    pub countdown_almost_start: u32,
    pub connect_attempts: u32,
    pub connect_interval: Duration,
    pub join_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            title: "Session".to_string(),
            password: None,
            allow_join: true,
            ranked: false,
            league_address: None,
            continue_without_league: false,
            clamp_ack_ticks: true,
            auto_open_lobby: true,
            work_dir: std::env::temp_dir().join("netsync"),
            resources: Vec::new(),
            chunk_size: RES_CHUNK_SIZE,
            frames_per_second: 36,
            res_retrieve_timeout: Duration::from_millis(100_000),
            chunk_request_interval: Duration::from_secs(2),
            activation_request_interval: Duration::from_millis(5000),
            max_behind_for_activation: 20,
            deactivation_delay: 500,
            chase_target_interval: Duration::from_secs(5),
            barrier_resend_interval: Duration::from_secs(3),
            reference_update_interval: Duration::from_secs(120),
            min_league_update_interval: Duration::from_secs(10),
            league_update_interval: Duration::from_secs(60),
            league_end_retries: 10,
            stream_limits: StreamLimits::default(),
            vote_timeout: Duration::from_secs(10),
            min_vote_interval: Duration::from_secs(120),
            ready_check_timeout: Duration::from_secs(15),
            ready_check_cooldown: Duration::from_secs(30),
            countdown_almost_start: 20,
            connect_attempts: 3,
            connect_interval: Duration::from_secs(6),
            join_timeout: Duration::from_secs(30),
        }
    }
}

impl SessionConfig {
    /// Password predicate; an open session accepts anything
    pub fn password_matches(&self, given: Option<&str>) -> bool {
        match &self.password {
            None => true,
            Some(expected) => given == Some(expected.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_intervals() {
        let config = SessionConfig::default();
        assert_eq!(config.res_retrieve_timeout, Duration::from_secs(100));
        assert_eq!(config.vote_timeout, Duration::from_secs(10));
        assert_eq!(config.min_vote_interval, Duration::from_secs(120));
        assert_eq!(config.deactivation_delay, 500);
        assert_eq!(config.connect_attempts, 3);
        assert_eq!(config.stream_limits.min_block, 10 * 1024);
        assert_eq!(config.stream_limits.interval, Duration::from_secs(30));
    }

    #[test]
    fn test_password_predicate() {
        let mut config = SessionConfig::default();
        assert!(config.password_matches(None));
        assert!(config.password_matches(Some("anything")));

        config.password = Some("secret".to_string());
        assert!(config.password_matches(Some("secret")));
        assert!(!config.password_matches(Some("guess")));
        assert!(!config.password_matches(None));
    }
}
