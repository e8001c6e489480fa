//! Session coordinator
//!
//! One `SessionCoordinator` per peer owns the client registry, the status
//! barrier, the resource ledger and the governance state. It never blocks
//! and never reads a clock: callers feed it transport events through
//! `pump`, run `execute` from a periodic driver and collect what happened
//! from `drain_events`.
//!
//! The protocol handlers are split by concern:
//! - `handshake`: hosting, joining, join data and resource streaming
//! - `barrier`: phase changes, status acks, chasing and activation
//! - `governance`: votes, ready checks, the lobby countdown and the league

mod barrier;
mod governance;
mod handshake;

pub use handshake::{JoinOutcome, JoinPoll};

use crate::backoff::BackoffTimer;
use crate::client_registry::{ClientRecord, ClientRegistry};
use crate::config::SessionConfig;
use crate::countdown::Countdown;
use crate::error::{LeagueError, SessionError};
use crate::league::{DisconnectReason, LeagueClient, LeagueSession, SessionReference};
use crate::ready_check::ReadyCheckCoordinator;
use crate::replication::ReplicationEngine;
use crate::resource::ResourceLedger;
use crate::status::{BarrierDiagnostics, SessionStatus};
use crate::streaming::{RecordStreamer, StreamSink, StreamStats};
use crate::transport::{ConnHandle, Transport, TransportEvent};
use crate::vote::{VoteEntry, VoteLedger};
use handshake::{JoinAttempt, JoinSnapshot, TrackedRetrieval};
use log::{debug, info, warn};
use shared::{
    ClientCore, ClientId, GameParameters, GamePhase, Packet, ResourceId, StatusInfo,
    Tick, VoteKind, HOST_CLIENT_ID,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Client,
}

/// Notifications for the embedding application
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StatusChanged(StatusInfo),
    StatusReached(StatusInfo),
    StatusAcknowledged(StatusInfo),
    ClientJoined { id: ClientId, name: String },
    ClientActivated { id: ClientId, activated: bool },
    ClientRemoved { id: ClientId, reason: String },
    LobbyReadyChanged { id: ClientId, ready: bool },
    ReadyCheckPrompt { requested_by: ClientId },
    CountdownUpdate(u32),
    CountdownAborted,
    VoteRequested { kind: VoteKind, target: u32, from: ClientId },
    VoteEnded { kind: VoteKind, target: u32, approved: bool },
    /// The local peer may leave privately instead of voting again
    SurrenderOffered,
    ResourceProgress { res_id: ResourceId, percent: u8 },
    ResourceStalled { res_id: ResourceId, percent: u8 },
    ResourceRetrieved { res_id: ResourceId, path: PathBuf },
    ReferenceUpdated(SessionReference),
    LeagueRegistered,
    LeagueRejected(LeagueError),
    LeagueLost(LeagueError),
    LeagueEvaluated { success: bool, message: String },
    Terminated { reason: String },
}

/// What `clear` cancelled
///
/// Each pending item is released by exactly one `clear`; a second call
/// reports nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Teardown {
    pub votes_cancelled: usize,
    pub countdown_cancelled: bool,
    pub ready_check_cancelled: bool,
}

pub struct SessionCoordinator<T: Transport, E: ReplicationEngine> {
    config: SessionConfig,
    transport: T,
    engine: E,
    local_core: ClientCore,
    role: Option<Role>,

    status: SessionStatus,
    diagnostics: BarrierDiagnostics,
    registry: ClientRegistry,
    parameters: GameParameters,

    ledger: Option<ResourceLedger>,
    retrievals: Vec<TrackedRetrieval>,
    /// End of the chunk window last requested per resource
    chunk_windows: BTreeMap<ResourceId, u32>,
    dynamic_id: Option<ResourceId>,
    dynamic_tick: Option<Tick>,
    dynamic_needed: bool,
    start_tick: Tick,

    votes: VoteLedger,
    ready_check: ReadyCheckCoordinator,
    countdown: Option<Countdown>,
    league_client: Option<Box<dyn LeagueClient>>,
    league: Option<LeagueSession>,
    stream_sink: Option<Box<dyn StreamSink>>,
    streamer: Option<RecordStreamer>,

    join: Option<JoinAttempt>,
    host_conn: Option<ConnHandle>,

    game_loaded: bool,
    lobby_running: bool,
    chasing: bool,
    delayed_activate: bool,
    paused_for_vote: bool,

    activation_timer: BackoffTimer,
    chase_timer: BackoffTimer,
    barrier_timer: BackoffTimer,
    reference_timer: BackoffTimer,
    chunk_timer: BackoffTimer,

    events: VecDeque<SessionEvent>,
}

impl<T: Transport, E: ReplicationEngine> SessionCoordinator<T, E> {
    pub fn new(config: SessionConfig, local_core: ClientCore, transport: T, engine: E) -> Self {
        Self {
            votes: VoteLedger::new(config.vote_timeout, config.min_vote_interval),
            ready_check: ReadyCheckCoordinator::new(
                config.ready_check_timeout,
                config.ready_check_cooldown,
            ),
            activation_timer: BackoffTimer::new(config.activation_request_interval),
            chase_timer: BackoffTimer::new(config.chase_target_interval),
            barrier_timer: BackoffTimer::new(config.barrier_resend_interval),
            reference_timer: BackoffTimer::new(config.reference_update_interval),
            chunk_timer: BackoffTimer::new(config.chunk_request_interval),
            config,
            transport,
            engine,
            local_core,
            role: None,
            status: SessionStatus::new(),
            diagnostics: BarrierDiagnostics::default(),
            registry: ClientRegistry::new(),
            parameters: GameParameters::default(),
            ledger: None,
            retrievals: Vec::new(),
            chunk_windows: BTreeMap::new(),
            dynamic_id: None,
            dynamic_tick: None,
            dynamic_needed: false,
            start_tick: 0,
            countdown: None,
            league_client: None,
            league: None,
            stream_sink: None,
            streamer: None,
            join: None,
            host_conn: None,
            game_loaded: false,
            lobby_running: false,
            chasing: false,
            delayed_activate: false,
            paused_for_vote: false,
            events: VecDeque::new(),
        }
    }

    /// Supplies the league client used when a hosted session has a league
    pub fn with_league(mut self, client: Box<dyn LeagueClient>) -> Self {
        self.league_client = Some(client);
        self
    }

    /// Supplies the uploader used when the league asks for a record stream
    pub fn with_stream_sink(mut self, sink: Box<dyn StreamSink>) -> Self {
        self.stream_sink = Some(sink);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn is_host(&self) -> bool {
        self.role == Some(Role::Host)
    }

    pub fn is_active(&self) -> bool {
        self.role.is_some()
    }

    pub fn local_id(&self) -> Option<ClientId> {
        self.registry.local_id()
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    pub fn diagnostics(&self) -> &BarrierDiagnostics {
        &self.diagnostics
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn parameters(&self) -> &GameParameters {
        &self.parameters
    }

    pub fn ledger(&self) -> Option<&ResourceLedger> {
        self.ledger.as_ref()
    }

    pub fn votes(&self) -> &VoteLedger {
        &self.votes
    }

    pub fn countdown(&self) -> Option<&Countdown> {
        self.countdown.as_ref()
    }

    pub fn league(&self) -> Option<&LeagueSession> {
        self.league.as_ref()
    }

    /// Progress of the running record stream
    pub fn streaming_stats(&self) -> Option<StreamStats> {
        self.streamer.as_ref().map(RecordStreamer::stats)
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Whether the simulation state is available locally
    pub fn is_game_loaded(&self) -> bool {
        self.game_loaded
    }

    pub fn is_chasing(&self) -> bool {
        self.chasing
    }

    /// Tick the current dynamic snapshot was taken at
    pub fn dynamic_tick(&self) -> Option<Tick> {
        self.dynamic_tick
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    /// Copy of all live clients for display
    pub fn registry_snapshot(&self) -> Vec<ClientCore> {
        self.registry.snapshot()
    }

    /// Lobby readiness of every live client as `(id, name, ready)`
    pub fn readiness_snapshot(&self) -> Vec<(ClientId, String, bool)> {
        self.registry
            .iter()
            .filter(|record| !record.is_removed())
            .map(|record| (record.id, record.name.clone(), record.lobby_ready))
            .collect()
    }

    pub(crate) fn emit(&mut self, event: SessionEvent) {
        debug!("Session event: {:?}", event);
        self.events.push_back(event);
    }

    /// Drains the transport and dispatches every event
    pub fn pump(&mut self, now: Instant) {
        while let Some(event) = self.transport.poll_event() {
            match event {
                TransportEvent::Received { conn, packet } => self.handle_packet(conn, packet, now),
                TransportEvent::Closed { conn } => self.on_disconnect(conn, now),
            }
        }
    }

    /// Dispatches one packet received on `conn`
    pub fn handle_packet(&mut self, conn: ConnHandle, packet: Packet, now: Instant) {
        let from = self.registry.find_by_conn(conn).map(|record| record.id);
        let from_host = !self.is_host() && self.host_conn.is_some() && self.host_conn == Some(conn);

        match packet {
            Packet::Conn {
                engine_version,
                core,
                password,
            } => {
                if self.is_host() && from.is_none() {
                    self.handle_conn(conn, engine_version, core, password, now);
                } else {
                    debug!("Ignoring connection request on {:?}", conn);
                }
            }
            Packet::ConnRe {
                ok,
                wrong_password,
                message,
            } => self.handle_conn_re(conn, ok, wrong_password, message),
            Packet::JoinData {
                client_id,
                status,
                start_tick,
                parameters,
                dynamic,
                clients,
            } => {
                let snapshot = JoinSnapshot {
                    client_id,
                    status,
                    start_tick,
                    parameters,
                    dynamic,
                    clients,
                };
                self.handle_join_data(conn, snapshot, now);
            }
            Packet::Status(info) => {
                if from_host {
                    self.handle_status(info, now);
                }
            }
            Packet::StatusAck(info) => {
                if self.is_host() {
                    match from {
                        Some(id) => self.handle_status_ack(id, conn, info, now),
                        None => self.diagnostics.acks_ignored += 1,
                    }
                } else if from_host {
                    self.handle_host_ack(info);
                }
            }
            Packet::ClientActivationRequest { tick } => {
                if let (true, Some(id)) = (self.is_host(), from) {
                    self.handle_activation_request(id, conn, tick);
                }
            }
            Packet::ClientJoin { core } => {
                if from_host {
                    self.handle_client_join(core);
                }
            }
            Packet::ClientUpdate {
                client_id,
                activated,
            } => {
                if from_host {
                    self.handle_client_update(client_id, activated);
                }
            }
            Packet::ClientRemove { client_id, reason } => {
                if from_host {
                    self.handle_client_remove(client_id, reason);
                }
            }
            Packet::ReadyCheck { client_id, data } => {
                if let Some(sender) = from {
                    self.handle_ready_check(sender, client_id, data, now);
                }
            }
            Packet::LobbyCountdown { seconds } => {
                if from_host {
                    self.handle_countdown(seconds);
                }
            }
            Packet::Vote {
                kind,
                target,
                approve,
                from: voter,
            } => {
                if self.is_host() {
                    // The voter is whoever owns the connection
                    if let Some(sender) = from {
                        let entry = VoteEntry {
                            kind,
                            target,
                            from: sender,
                            approve,
                        };
                        self.record_vote(entry, now);
                    }
                } else if from_host {
                    let entry = VoteEntry {
                        kind,
                        target,
                        from: voter,
                        approve,
                    };
                    self.record_vote(entry, now);
                }
            }
            Packet::VoteEnd {
                kind,
                target,
                approved,
            } => {
                if from_host {
                    self.end_vote(kind, target, approved, now);
                }
            }
            Packet::ResRequest { res_id, from_chunk } => {
                if from.is_some() {
                    self.handle_res_request(conn, res_id, from_chunk);
                }
            }
            Packet::ResChunk { res_id, index, data } => {
                if from_host {
                    self.handle_res_chunk(res_id, index, data, now);
                }
            }
            Packet::LeagueRoundResults { success, message } => {
                if from_host {
                    info!("League round results: {}", message);
                    self.emit(SessionEvent::LeagueEvaluated { success, message });
                }
            }
            Packet::Heartbeat => {}
            Packet::Disconnect => self.on_disconnect(conn, now),
        }
    }

    /// Periodic maintenance, typically once per second
    pub fn execute(&mut self, now: Instant) {
        self.transport.maintain(now);
        self.pump(now);
        if self.join.is_some() {
            self.connect_pending(now);
        }
        if !self.is_active() {
            return;
        }

        self.poll_retrievals(now);
        self.request_missing_chunks(now);
        self.check_status_reached(now);

        if self.is_host() {
            self.drop_stale_dynamic();
            self.update_chase_target(now);
            self.deactivate_inactive_clients();
            self.resend_barrier(now);
            self.update_reference(now);
            self.update_league(now);
            self.stream_record(now);
            if !self.is_active() {
                return;
            }
            self.expire_votes(now);
            self.tick_countdown(now);
        } else if self.activation_timer.is_armed() || self.delayed_activate {
            self.request_activate(now);
        }

        if let Some(ready) = self.ready_check.poll_timeout(now) {
            info!("Ready check not answered in time");
            self.publish_ready(ready);
        }
    }

    /// Handles a connection that went away
    pub fn on_disconnect(&mut self, conn: ConnHandle, now: Instant) {
        if self.join_conn_closed(conn) {
            return;
        }
        let Some((id, gone)) = self.registry.detach_conn(conn) else {
            debug!("Close of unknown connection {:?}", conn);
            return;
        };
        if !gone {
            return;
        }

        if self.is_host() {
            self.client_disconnected(id, now);
        } else if self.host_conn == Some(conn) {
            self.host_conn = None;
            warn!("Lost connection to the host");
            self.terminate("connection to host lost".to_string());
        }
    }

    fn client_disconnected(&mut self, id: ClientId, now: Instant) {
        info!("Client {} disconnected", id);
        let had_players = self.engine.has_players(id);
        if let Some(league) = self.league.as_mut() {
            league.report_disconnect(id, DisconnectReason::ConnectionFailed);
        }
        self.remove_client(id, "connection lost");

        if had_players && self.countdown.as_ref().is_some_and(Countdown::is_active) {
            info!("Aborting countdown, client {} had players", id);
            self.abort_countdown();
        }

        self.check_status_ack();
        let phase = self.status.phase();
        if !self.status.is_reached() && phase.is_ticked() {
            let tick = self.engine.control_tick();
            self.change_status(phase, tick, now);
        }
    }

    /// Host: soft-removes a client and tells everyone
    ///
    /// The host itself is never removed; it leaves by ending the session.
    pub(crate) fn remove_client(&mut self, id: ClientId, reason: &str) {
        if id == HOST_CLIENT_ID {
            warn!("Refusing to remove the host ({})", reason);
            return;
        }
        let conns: Vec<ConnHandle> = self
            .registry
            .find_by_id(id)
            .map(|record| record.msg_conn.into_iter().chain(record.data_conn).collect())
            .unwrap_or_default();
        if !self.registry.mark_removed(id) {
            return;
        }
        self.engine.client_removed(id);

        let packet = Packet::ClientRemove {
            client_id: id,
            reason: reason.to_string(),
        };
        self.broadcast(&packet);
        for conn in conns {
            self.send(conn, &packet);
            self.transport.close(conn);
        }
        self.invalidate_reference();
        self.emit(SessionEvent::ClientRemoved {
            id,
            reason: reason.to_string(),
        });
    }

    fn handle_client_join(&mut self, core: ClientCore) {
        let name = core.name.clone();
        if let Some(id) = self.registry.add_remote(&core) {
            info!("Client {} ({}) joined", id, name);
            self.emit(SessionEvent::ClientJoined { id, name });
        }
    }

    fn handle_client_update(&mut self, id: ClientId, activated: bool) {
        if !self.registry.set_activated(id, activated) {
            return;
        }
        self.engine.set_client_activated(id, activated);
        if activated && Some(id) == self.registry.local_id() {
            self.activation_timer.reset();
            self.delayed_activate = false;
        }
        self.emit(SessionEvent::ClientActivated { id, activated });
    }

    fn handle_client_remove(&mut self, id: ClientId, reason: String) {
        if id == HOST_CLIENT_ID {
            warn!("Ignoring removal of the host: {}", reason);
            return;
        }
        if Some(id) == self.registry.local_id() {
            warn!("Removed from the session: {}", reason);
            self.terminate(format!("removed from session: {}", reason));
            return;
        }
        if self.registry.mark_removed(id) {
            self.engine.client_removed(id);
            self.emit(SessionEvent::ClientRemoved { id, reason });
        }
    }

    pub(crate) fn send(&mut self, conn: ConnHandle, packet: &Packet) {
        if let Err(e) = self.transport.send(conn, packet) {
            warn!("Failed to send on {:?}: {}", conn, e);
        }
    }

    pub(crate) fn send_to_client(&mut self, id: ClientId, packet: &Packet) {
        if let Some(conn) = self.registry.find_by_id(id).and_then(ClientRecord::send_conn) {
            self.send(conn, packet);
        }
    }

    pub(crate) fn send_to_host(&mut self, packet: &Packet) {
        if let Some(conn) = self.host_conn {
            self.send(conn, packet);
        }
    }

    /// Host: sends to every joined remote client
    pub(crate) fn broadcast(&mut self, packet: &Packet) {
        self.broadcast_except(packet, None);
    }

    pub(crate) fn broadcast_except(&mut self, packet: &Packet, skip: Option<ClientId>) {
        if !self.is_host() {
            return;
        }
        let conns: Vec<ConnHandle> = self
            .registry
            .remotes()
            .filter(|record| record.has_join_data && Some(record.id) != skip)
            .filter_map(ClientRecord::send_conn)
            .collect();
        for conn in conns {
            self.send(conn, packet);
        }
    }

    /// Host broadcasts; clients go through the host, which relays
    pub(crate) fn send_to_peers(&mut self, packet: &Packet) {
        if self.is_host() {
            self.broadcast(packet);
        } else {
            self.send_to_host(packet);
        }
    }

    /// Ends the session with a final `Terminated` event
    pub(crate) fn terminate(&mut self, reason: String) {
        self.clear();
        info!("Session terminated: {}", reason);
        self.emit(SessionEvent::Terminated { reason });
    }

    /// Leaves the session; peers see the connections close
    pub fn leave(&mut self) -> Teardown {
        if self.is_active() {
            info!("Leaving session");
        }
        self.clear()
    }

    /// Tears the session down and returns to the inactive state
    pub fn clear(&mut self) -> Teardown {
        let teardown = Teardown {
            votes_cancelled: self.votes.clear(),
            countdown_cancelled: self
                .countdown
                .take()
                .is_some_and(|mut countdown| countdown.abort()),
            ready_check_cancelled: self.ready_check.cancel(),
        };

        let mut conns: BTreeSet<ConnHandle> = self
            .registry
            .iter()
            .filter(|record| !record.local)
            .flat_map(|record| record.msg_conn.into_iter().chain(record.data_conn))
            .collect();
        conns.extend(self.host_conn);
        if let Some(join) = self.join.as_ref() {
            conns.extend(join.open_conns());
        }
        for conn in conns {
            self.transport.close(conn);
        }

        self.role = None;
        self.status.clear();
        self.diagnostics = BarrierDiagnostics::default();
        self.registry.clear();
        self.parameters = GameParameters::default();
        self.ledger = None;
        self.retrievals.clear();
        self.chunk_windows.clear();
        self.dynamic_id = None;
        self.dynamic_tick = None;
        self.dynamic_needed = false;
        self.start_tick = 0;
        self.league = None;
        self.stop_streaming();
        self.join = None;
        self.host_conn = None;
        self.game_loaded = false;
        self.lobby_running = false;
        self.chasing = false;
        self.delayed_activate = false;
        self.paused_for_vote = false;
        self.activation_timer.reset();
        self.chase_timer.reset();
        self.barrier_timer.reset();
        self.reference_timer.reset();
        self.chunk_timer.reset();
        teardown
    }

    pub(crate) fn phase(&self) -> GamePhase {
        self.status.phase()
    }

    /// Host: builds a session start error and undoes the partial setup
    pub(crate) fn abort_host(&mut self, error: SessionError) -> SessionError {
        warn!("Could not host session: {}", error);
        self.clear();
        error
    }
}
