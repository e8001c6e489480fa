//! League and master-server reporting
//!
//! All league calls are long-latency requests. They are submitted without
//! blocking and their replies are polled from `execute`.

use crate::backoff::BackoffTimer;
use crate::error::LeagueError;
use log::{info, warn};
use shared::{ClientId, GamePhase, Tick};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Public description of a hosted session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReference {
    pub title: String,
    pub phase: GamePhase,
    pub target_tick: Tick,
    pub client_count: usize,
    pub password_protected: bool,
    pub ranked: bool,
    pub joinable: bool,
    pub league_address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeagueAction {
    Start,
    Update,
    End,
    ReportDisconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Unknown,
    ConnectionFailed,
    Desync,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeagueEvaluation {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeagueReply {
    /// Carries the address to stream the record to, if the league wants one
    Started { stream_address: Option<String> },
    Updated,
    Ended(LeagueEvaluation),
    DisconnectReported,
    Failed {
        action: LeagueAction,
        error: LeagueError,
    },
}

pub trait LeagueClient {
    fn start(&mut self, reference: &SessionReference) -> Result<(), LeagueError>;
    fn update(&mut self, reference: &SessionReference) -> Result<(), LeagueError>;
    fn end(&mut self, reference: &SessionReference) -> Result<(), LeagueError>;
    fn report_disconnect(
        &mut self,
        client: ClientId,
        reason: DisconnectReason,
    ) -> Result<(), LeagueError>;
    fn is_busy(&self) -> bool;
    fn poll_reply(&mut self) -> Option<LeagueReply>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaguePhase {
    Starting,
    Active,
    Ending { attempts: u32 },
    Ended,
}

/// What the coordinator has to act on after polling the league
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeagueUpdate {
    Registered { stream_address: Option<String> },
    Rejected(LeagueError),
    Evaluated(LeagueEvaluation),
    Lost(LeagueError),
}

/// League state held by a session that signed up with a league
pub struct LeagueSession {
    client: Box<dyn LeagueClient>,
    phase: LeaguePhase,
    update_timer: BackoffTimer,
    regular_interval: Duration,
    max_end_attempts: u32,
    last_reference: Option<SessionReference>,
    queued_disconnects: VecDeque<(ClientId, DisconnectReason)>,
}

impl LeagueSession {
    /// Submits the start request
    ///
    /// A synchronous refusal is returned to the caller. The asynchronous
    /// verdict arrives later through `poll`.
    pub fn start(
        mut client: Box<dyn LeagueClient>,
        reference: &SessionReference,
        min_update_interval: Duration,
        regular_interval: Duration,
        max_end_attempts: u32,
    ) -> Result<Self, LeagueError> {
        client.start(reference)?;
        info!("League start requested for {}", reference.title);
        Ok(Self {
            client,
            phase: LeaguePhase::Starting,
            update_timer: BackoffTimer::new(min_update_interval),
            regular_interval,
            max_end_attempts,
            last_reference: Some(reference.clone()),
            queued_disconnects: VecDeque::new(),
        })
    }

    pub fn phase(&self) -> LeaguePhase {
        self.phase
    }

    /// Shortens the next update wait after the reference changed
    pub fn invalidate(&mut self, min_update_interval: Duration) {
        self.update_timer.set_interval(min_update_interval);
        self.update_timer.reset();
    }

    /// Sends an update when one is due and the client is idle
    pub fn maybe_update(&mut self, reference: &SessionReference, now: Instant) {
        if self.phase != LeaguePhase::Active || self.client.is_busy() {
            return;
        }
        if !self.update_timer.is_due(now) {
            return;
        }
        self.update_timer.fire(now);
        if let Err(e) = self.client.update(reference) {
            warn!("League update failed: {}", e);
        }
        self.last_reference = Some(reference.clone());
    }

    pub fn report_disconnect(&mut self, client: ClientId, reason: DisconnectReason) {
        if matches!(self.phase, LeaguePhase::Ended) {
            return;
        }
        self.queued_disconnects.push_back((client, reason));
        self.flush_disconnects();
    }

    fn flush_disconnects(&mut self) {
        while !self.client.is_busy() {
            let Some((client, reason)) = self.queued_disconnects.pop_front() else {
                break;
            };
            if let Err(e) = self.client.report_disconnect(client, reason) {
                warn!("League disconnect report for client {} failed: {}", client, e);
            }
        }
    }

    /// Asks the league to evaluate the round
    pub fn end(&mut self, reference: &SessionReference) {
        if matches!(self.phase, LeaguePhase::Ending { .. } | LeaguePhase::Ended) {
            return;
        }
        self.phase = LeaguePhase::Ending { attempts: 1 };
        self.last_reference = Some(reference.clone());
        if let Err(e) = self.client.end(reference) {
            warn!("League end request failed: {}", e);
        }
    }

    /// Drains league replies
    pub fn poll(&mut self) -> Vec<LeagueUpdate> {
        let mut updates = Vec::new();
        while let Some(reply) = self.client.poll_reply() {
            match reply {
                LeagueReply::Started { stream_address } => {
                    info!("League accepted the session");
                    self.phase = LeaguePhase::Active;
                    self.update_timer.set_interval(self.regular_interval);
                    updates.push(LeagueUpdate::Registered { stream_address });
                }
                LeagueReply::Updated => {
                    self.update_timer.set_interval(self.regular_interval);
                }
                LeagueReply::DisconnectReported => {}
                LeagueReply::Ended(evaluation) => {
                    info!("League evaluation received: {}", evaluation.message);
                    self.phase = LeaguePhase::Ended;
                    updates.push(LeagueUpdate::Evaluated(evaluation));
                }
                LeagueReply::Failed { action, error } => {
                    updates.extend(self.on_failure(action, error));
                }
            }
        }
        self.flush_disconnects();
        updates
    }

    fn on_failure(&mut self, action: LeagueAction, error: LeagueError) -> Option<LeagueUpdate> {
        warn!("League {:?} failed: {}", action, error);
        match (action, self.phase) {
            (LeagueAction::Start, LeaguePhase::Starting) => {
                self.phase = LeaguePhase::Ended;
                Some(LeagueUpdate::Rejected(error))
            }
            (LeagueAction::End, LeaguePhase::Ending { attempts }) => {
                if attempts >= self.max_end_attempts {
                    self.phase = LeaguePhase::Ended;
                    return Some(LeagueUpdate::Lost(error));
                }
                self.phase = LeaguePhase::Ending {
                    attempts: attempts + 1,
                };
                if let Some(reference) = self.last_reference.clone() {
                    if let Err(e) = self.client.end(&reference) {
                        warn!("League end retry failed: {}", e);
                    }
                }
                None
            }
            _ => None,
        }
    }
}
