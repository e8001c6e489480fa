//! Votes, ready checks, the lobby countdown, league reporting and record
//! streaming

use super::{SessionCoordinator, SessionEvent};
use crate::countdown::Countdown;
use crate::error::SessionError;
use crate::league::{LeagueSession, LeagueUpdate, SessionReference};
use crate::ready_check::ReadyCheckStep;
use crate::streaming::RecordStreamer;
use crate::replication::ReplicationEngine;
use crate::transport::Transport;
use crate::vote::{VoteEntry, VoteOutcome};
use log::{debug, info, warn};
use shared::{
    ClientId, GamePhase, Packet, ReadyCheckData, VoteKind, COUNTDOWN_ABORTED, HOST_CLIENT_ID,
};
use std::time::Instant;

impl<T: Transport, E: ReplicationEngine> SessionCoordinator<T, E> {
    /// Casts the local vote on `(kind, target)`
    ///
    /// Starting a new vote is rate limited. Returns false if the vote was
    /// not cast.
    pub fn vote(&mut self, kind: VoteKind, target: u32, approve: bool, now: Instant) -> bool {
        let Some(local) = self.registry.local_id() else {
            return false;
        };
        if is_host_kick(kind, target) {
            info!("The host cannot be kicked");
            return false;
        }
        if !self.votes.is_pending(kind, target) {
            if !self.votes.may_start_own(now) {
                info!("Too soon to start another vote");
                if is_surrender_vote(kind, target, local) {
                    self.emit(SessionEvent::SurrenderOffered);
                }
                return false;
            }
            self.votes.note_own_vote(now);
        }
        if self.votes.find(kind, target, local).is_some() {
            return false;
        }

        let entry = VoteEntry {
            kind,
            target,
            from: local,
            approve,
        };
        if self.is_host() {
            self.record_vote(entry, now);
        } else {
            self.send_to_host(&Packet::Vote {
                kind,
                target,
                approve,
                from: local,
            });
        }
        true
    }

    /// Stores a vote; the host relays it and counts
    pub(super) fn record_vote(&mut self, entry: VoteEntry, now: Instant) {
        let (kind, target, from, approve) = (entry.kind, entry.target, entry.from, entry.approve);
        if is_host_kick(kind, target) {
            warn!("Ignoring vote of client {} to kick the host", from);
            return;
        }
        let first = !self.votes.is_pending(kind, target);
        if !self.votes.cast(entry, now) {
            debug!("Client {} changed its {} vote", from, kind);
        }

        if self.is_host() {
            self.broadcast(&Packet::Vote {
                kind,
                target,
                approve,
                from,
            });
            self.pause_for_vote(now);
        }

        let local = self.registry.local_id();
        let voted = local.is_some_and(|id| self.votes.find(kind, target, id).is_some());
        if first && !voted {
            self.emit(SessionEvent::VoteRequested { kind, target, from });
        }

        if self.is_host() {
            self.check_vote(kind, target, now);
        }
    }

    fn pause_for_vote(&mut self, now: Instant) {
        if self.phase() == GamePhase::Running && self.pause(now) {
            self.paused_for_vote = true;
        }
    }

    /// Clients whose vote counts on `(kind, target)`
    fn eligible_voters(&self, kind: VoteKind, target: u32) -> Vec<ClientId> {
        self.registry
            .iter()
            .filter(|record| !record.is_removed() && !record.observer && record.activated)
            .filter(|record| !(kind == VoteKind::Kick && record.id == target))
            .map(|record| record.id)
            .collect()
    }

    fn check_vote(&mut self, kind: VoteKind, target: u32, now: Instant) {
        let eligible = self.eligible_voters(kind, target);
        match self.votes.tally(kind, target, &eligible) {
            VoteOutcome::Pending => {}
            VoteOutcome::Approved => self.finish_vote(kind, target, true, now),
            VoteOutcome::Denied => self.finish_vote(kind, target, false, now),
        }
    }

    /// Host: decides a pending vote regardless of the count
    pub fn decide_vote(&mut self, kind: VoteKind, target: u32, approve: bool, now: Instant) -> bool {
        if !self.is_host() || !self.votes.is_pending(kind, target) {
            return false;
        }
        self.finish_vote(kind, target, approve, now);
        true
    }

    fn finish_vote(&mut self, kind: VoteKind, target: u32, approved: bool, now: Instant) {
        self.broadcast(&Packet::VoteEnd {
            kind,
            target,
            approved,
        });
        self.end_vote(kind, target, approved, now);
    }

    /// Closes a vote on every peer
    pub(super) fn end_vote(&mut self, kind: VoteKind, target: u32, approved: bool, now: Instant) {
        let origin = self.votes.origin(kind, target);
        let purged = self.votes.end_vote(kind, target, now);
        if purged == 0 {
            return;
        }
        info!(
            "Vote {} {} {}",
            kind,
            target,
            if approved { "approved" } else { "denied" }
        );

        let local = self.registry.local_id();
        if let (Some(origin), Some(local)) = (origin, local) {
            if origin == local {
                if approved {
                    self.votes.reset_own_limit();
                } else if is_surrender_vote(kind, target, local) {
                    self.emit(SessionEvent::SurrenderOffered);
                }
            }
        }
        self.emit(SessionEvent::VoteEnded {
            kind,
            target,
            approved,
        });

        if approved {
            self.apply_vote(kind, target, now);
            if !self.is_active() {
                return;
            }
        }
        if self.votes.is_empty() && self.paused_for_vote {
            self.paused_for_vote = false;
            self.start(now);
        }
    }

    fn apply_vote(&mut self, kind: VoteKind, target: u32, now: Instant) {
        match kind {
            VoteKind::Kick => {
                if self.is_host() {
                    self.remove_client(target, "kicked by vote");
                    self.check_status_ack();
                }
            }
            VoteKind::Cancel => {
                info!("Game cancelled by vote");
                self.engine.abort_game();
            }
            VoteKind::Pause => {
                self.paused_for_vote = target == 0;
                if target != 0 {
                    self.pause(now);
                }
            }
        }
    }

    /// Host: drops the oldest vote once it ran out of time
    pub(super) fn expire_votes(&mut self, now: Instant) {
        if let Some((kind, target)) = self.votes.expired(now) {
            info!("Vote {} {} timed out", kind, target);
            self.finish_vote(kind, target, false, now);
        }
    }

    /// Leaves without a vote: drops the league and the session
    pub fn surrender(&mut self) {
        info!("Surrendering");
        self.league = None;
        self.terminate("surrendered".to_string());
    }

    /// Host: asks everyone in the lobby whether they are ready
    pub fn request_ready_check(&mut self, now: Instant) -> bool {
        if !self.is_host() || self.phase() != GamePhase::Lobby {
            return false;
        }
        if !self.ready_check.try_request(now) {
            return false;
        }
        let almost_start = self.config.countdown_almost_start;
        if self
            .countdown
            .as_ref()
            .is_some_and(|countdown| countdown.is_active() && countdown.remaining() > almost_start)
        {
            self.abort_countdown();
        }
        self.registry.clear_lobby_ready();
        let host = self.registry.local_id().unwrap_or_default();
        info!("Requesting ready check");
        self.broadcast(&Packet::ReadyCheck {
            client_id: host,
            data: ReadyCheckData::Request,
        });
        true
    }

    pub(super) fn handle_ready_check(
        &mut self,
        sender: ClientId,
        client_id: ClientId,
        data: ReadyCheckData,
        now: Instant,
    ) {
        match data {
            ReadyCheckData::Request => {
                let from_host = self.registry.find_by_id(sender).is_some_and(|r| r.host);
                if self.is_host() || !from_host || self.phase() != GamePhase::Lobby {
                    return;
                }
                self.registry.clear_lobby_ready();
                let can_be_ready = self.registry.local().is_some_and(|r| !r.observer);
                match self.ready_check.on_request(sender, can_be_ready, now) {
                    ReadyCheckStep::Ignored => debug!("Ready check already open"),
                    ReadyCheckStep::Answer(ready) => self.publish_ready(ready),
                    ReadyCheckStep::Prompt => self.emit(SessionEvent::ReadyCheckPrompt {
                        requested_by: sender,
                    }),
                }
            }
            ReadyCheckData::Ready | ReadyCheckData::NotReady => {
                let ready = data == ReadyCheckData::Ready;
                // Clients hear about each other through the host
                let subject = if self.is_host() { sender } else { client_id };
                let Some(record) = self.registry.find_by_id_mut(subject) else {
                    return;
                };
                record.lobby_ready = ready;
                if self.is_host() {
                    self.broadcast_except(
                        &Packet::ReadyCheck {
                            client_id: subject,
                            data,
                        },
                        Some(subject),
                    );
                }
                self.emit(SessionEvent::LobbyReadyChanged { id: subject, ready });
            }
        }
    }

    /// Answers the open ready-check prompt
    pub fn answer_ready_check(&mut self, ready: bool) -> bool {
        match self.ready_check.answer(ready) {
            Some(ready) => {
                self.publish_ready(ready);
                true
            }
            None => false,
        }
    }

    /// Toggles the local lobby readiness outside of a ready check
    pub fn set_lobby_ready(&mut self, ready: bool) -> bool {
        if self.phase() != GamePhase::Lobby {
            return false;
        }
        self.publish_ready(ready);
        true
    }

    pub(super) fn publish_ready(&mut self, ready: bool) {
        let Some(local) = self.registry.local_mut() else {
            return;
        };
        local.lobby_ready = ready;
        let id = local.id;
        let data = if ready {
            ReadyCheckData::Ready
        } else {
            ReadyCheckData::NotReady
        };
        self.send_to_peers(&Packet::ReadyCheck {
            client_id: id,
            data,
        });
        self.emit(SessionEvent::LobbyReadyChanged { id, ready });
    }

    /// Host: starts the lobby countdown
    pub fn start_countdown(&mut self, seconds: u32, now: Instant) -> bool {
        if !self.is_host() || self.phase() != GamePhase::Lobby {
            return false;
        }
        info!("Starting countdown of {} seconds", seconds);
        self.countdown = Some(Countdown::new(
            seconds,
            self.config.countdown_almost_start,
            now,
        ));
        self.broadcast(&Packet::LobbyCountdown {
            seconds: i32::try_from(seconds).unwrap_or(i32::MAX),
        });
        self.emit(SessionEvent::CountdownUpdate(seconds));
        true
    }

    /// Host: stops the countdown; true only for the call that stopped it
    pub fn abort_countdown(&mut self) -> bool {
        if !self.is_host() {
            return false;
        }
        let aborted = self
            .countdown
            .take()
            .is_some_and(|mut countdown| countdown.abort());
        if aborted {
            info!("Countdown aborted");
            self.broadcast(&Packet::LobbyCountdown {
                seconds: COUNTDOWN_ABORTED,
            });
            self.emit(SessionEvent::CountdownAborted);
        }
        aborted
    }

    /// Host: the start is taken one round after expiry was announced
    pub(super) fn tick_countdown(&mut self, now: Instant) {
        let Some(countdown) = self.countdown.as_mut() else {
            return;
        };
        let start = countdown.take_start();
        let announce = countdown.tick(now);

        if start {
            self.countdown = None;
            info!("Countdown expired, starting the game");
            self.start(now);
            return;
        }
        if let Some(seconds) = announce {
            self.broadcast(&Packet::LobbyCountdown {
                seconds: i32::try_from(seconds).unwrap_or(i32::MAX),
            });
            self.emit(SessionEvent::CountdownUpdate(seconds));
        }
    }

    pub(super) fn handle_countdown(&mut self, seconds: i32) {
        if seconds == COUNTDOWN_ABORTED {
            self.emit(SessionEvent::CountdownAborted);
        } else if let Ok(seconds) = u32::try_from(seconds) {
            self.emit(SessionEvent::CountdownUpdate(seconds));
        }
    }

    /// Public description of the hosted session
    pub fn reference(&self) -> SessionReference {
        SessionReference {
            title: self.config.title.clone(),
            phase: self.phase(),
            target_tick: self.status.target_tick(),
            client_count: self.registry.live_count(),
            password_protected: self.config.password.is_some(),
            ranked: self.parameters.ranked,
            joinable: self.config.allow_join,
            league_address: self.parameters.league_address.clone(),
        }
    }

    /// Forces a reference refresh and an early league update
    pub(super) fn invalidate_reference(&mut self) {
        self.reference_timer.reset();
        let min_interval = self.config.min_league_update_interval;
        if let Some(league) = self.league.as_mut() {
            league.invalidate(min_interval);
        }
    }

    pub(super) fn update_reference(&mut self, now: Instant) {
        if self.reference_timer.try_fire(now) {
            let reference = self.reference();
            self.emit(SessionEvent::ReferenceUpdated(reference));
        }
    }

    /// Host: registers the session with the league, if one is configured
    pub(super) fn start_league(&mut self) -> Result<(), SessionError> {
        if self.config.league_address.is_none() {
            return Ok(());
        }
        let Some(client) = self.league_client.take() else {
            warn!("League address set but no league client available");
            return Ok(());
        };
        let reference = self.reference();
        match LeagueSession::start(
            client,
            &reference,
            self.config.min_league_update_interval,
            self.config.league_update_interval,
            self.config.league_end_retries,
        ) {
            Ok(league) => {
                self.league = Some(league);
                Ok(())
            }
            Err(e) if self.config.continue_without_league => {
                warn!("League refused the session, continuing without: {}", e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub(super) fn update_league(&mut self, now: Instant) {
        let reference = self.reference();
        let Some(league) = self.league.as_mut() else {
            return;
        };
        league.maybe_update(&reference, now);
        for update in league.poll() {
            match update {
                LeagueUpdate::Registered { stream_address } => {
                    self.emit(SessionEvent::LeagueRegistered);
                    if let Some(address) = stream_address {
                        self.start_streaming(address, now);
                    }
                }
                LeagueUpdate::Rejected(e) => {
                    self.league = None;
                    self.emit(SessionEvent::LeagueRejected(e.clone()));
                    if !self.config.continue_without_league {
                        self.terminate(format!("league rejected the session: {}", e));
                        return;
                    }
                    warn!("League rejected the session, continuing without: {}", e);
                }
                LeagueUpdate::Evaluated(evaluation) => {
                    self.broadcast(&Packet::LeagueRoundResults {
                        success: evaluation.success,
                        message: evaluation.message.clone(),
                    });
                    self.emit(SessionEvent::LeagueEvaluated {
                        success: evaluation.success,
                        message: evaluation.message,
                    });
                }
                LeagueUpdate::Lost(e) => {
                    warn!("League evaluation lost: {}", e);
                    self.emit(SessionEvent::LeagueLost(e));
                }
            }
        }
    }

    fn start_streaming(&mut self, address: String, now: Instant) {
        if self.streamer.is_some() {
            return;
        }
        let Some(sink) = self.stream_sink.take() else {
            debug!("No stream uploader, not streaming the record to {}", address);
            return;
        };
        let limits = self.config.stream_limits;
        match RecordStreamer::start(address, sink, limits, now) {
            Ok(streamer) => self.streamer = Some(streamer),
            Err(e) => warn!("Record streaming could not start: {}", e),
        }
    }

    /// Feeds new record data to the stream and posts what is due
    pub(super) fn stream_record(&mut self, now: Instant) {
        let Some(streamer) = self.streamer.as_mut() else {
            return;
        };
        if !streamer.is_finishing() {
            let data = self.engine.take_record_data();
            if !data.is_empty() {
                if let Err(e) = streamer.stream_in(&data) {
                    warn!("Record streaming failed: {}", e);
                }
            }
        }
        streamer.stream_out(now);
        if streamer.is_done() {
            self.stop_streaming();
        }
    }

    /// Host: ends the record stream once the rest is posted
    ///
    /// The remainder goes out on the next `execute`.
    pub fn finish_streaming(&mut self) -> bool {
        let Some(streamer) = self.streamer.as_mut() else {
            return false;
        };
        if streamer.is_finishing() {
            return false;
        }
        let data = self.engine.take_record_data();
        let finished = streamer
            .stream_in(&data)
            .and_then(|()| streamer.finish());
        if let Err(e) = finished {
            warn!("Record stream could not be finished: {}", e);
            self.stop_streaming();
            return false;
        }
        true
    }

    pub(super) fn stop_streaming(&mut self) {
        if let Some(streamer) = self.streamer.take() {
            self.stream_sink = Some(streamer.stop());
        }
    }

    /// Host: asks the league to evaluate the finished round
    pub fn end_league_round(&mut self) -> bool {
        if !self.is_host() {
            return false;
        }
        self.finish_streaming();
        let reference = self.reference();
        match self.league.as_mut() {
            Some(league) => {
                league.end(&reference);
                true
            }
            None => false,
        }
    }
}

fn is_host_kick(kind: VoteKind, target: u32) -> bool {
    kind == VoteKind::Kick && target == HOST_CLIENT_ID
}

/// Failing such a vote offers a private surrender instead
fn is_surrender_vote(kind: VoteKind, target: u32, local: ClientId) -> bool {
    kind == VoteKind::Cancel || (kind == VoteKind::Kick && target == local)
}
