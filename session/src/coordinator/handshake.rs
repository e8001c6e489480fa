//! Hosting, joining and resource streaming

use super::{Role, SessionCoordinator, SessionEvent};
use crate::backoff::BackoffTimer;
use crate::client_registry::ClientStatus;
use crate::error::{JoinReject, ResourceError, SessionError};
use crate::replication::ReplicationEngine;
use crate::resource::{ResourceLedger, RetrievePoll, RetrieveTask, REQUEST_WINDOW};
use crate::transport::{ConnHandle, Transport};
use log::{debug, error, info, warn};
use shared::{
    ClientCore, ClientId, ControlMode, GameParameters, GamePhase, Packet, ResourceCore,
    ResourceId, ResourceKind, StatusInfo, Tick, ENGINE_VERSION, HOST_CLIENT_ID,
};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Result of a completed join
#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
    pub client_id: ClientId,
    pub status: StatusInfo,
    pub start_tick: Tick,
    pub parameters: GameParameters,
}

#[derive(Debug)]
pub enum JoinPoll {
    Pending,
    /// The host wants a different password; answer with `retry_join`
    PasswordRequired,
    Joined(JoinOutcome),
    Failed(SessionError),
}

/// Join data as received from the host
pub(super) struct JoinSnapshot {
    pub client_id: ClientId,
    pub status: StatusInfo,
    pub start_tick: Tick,
    pub parameters: GameParameters,
    pub dynamic: ResourceCore,
    pub clients: Vec<ClientCore>,
}

#[derive(Debug)]
struct PendingConn {
    addr: String,
    conn: Option<ConnHandle>,
    attempts: u32,
    timer: BackoffTimer,
}

#[derive(Debug)]
enum JoinState {
    Connecting,
    AwaitingJoinData(ConnHandle),
    PasswordRequired { reported: bool },
    Joined(JoinOutcome),
    Failed(SessionError),
}

/// A join in progress, from the first connect to the join data
#[derive(Debug)]
pub(super) struct JoinAttempt {
    pending: Vec<PendingConn>,
    password: Option<String>,
    password_retried: bool,
    started: Instant,
    state: JoinState,
}

impl JoinAttempt {
    fn new(addresses: &[String], password: Option<String>, interval: Duration, now: Instant) -> Self {
        Self {
            pending: addresses
                .iter()
                .map(|addr| PendingConn {
                    addr: addr.clone(),
                    conn: None,
                    attempts: 0,
                    timer: BackoffTimer::new(interval),
                })
                .collect(),
            password,
            password_retried: false,
            started: now,
            state: JoinState::Connecting,
        }
    }

    pub(super) fn open_conns(&self) -> Vec<ConnHandle> {
        let mut conns: Vec<ConnHandle> = self.pending.iter().filter_map(|p| p.conn).collect();
        if let JoinState::AwaitingJoinData(conn) = self.state {
            if !conns.contains(&conn) {
                conns.push(conn);
            }
        }
        conns
    }

    fn exhausted(&self, max_attempts: u32) -> bool {
        self.pending
            .iter()
            .all(|p| p.conn.is_none() && p.attempts >= max_attempts)
    }
}

/// A resource fetched as part of joining
#[derive(Debug)]
pub(super) struct TrackedRetrieval {
    task: RetrieveTask,
    reported: u8,
    stalled: bool,
}

impl<T: Transport, E: ReplicationEngine> SessionCoordinator<T, E> {
    /// Creates a new session with the local peer as host
    pub fn host_session(&mut self, lobby: bool, now: Instant) -> Result<(), SessionError> {
        if self.is_active() {
            return Err(SessionError::AlreadyActive);
        }
        if let Err(e) = self.setup_host() {
            return Err(self.abort_host(e));
        }

        let phase = if lobby {
            GamePhase::Lobby
        } else {
            GamePhase::Running
        };
        let tick = self.engine.control_tick();
        if !self.change_status(phase, tick, now) {
            return Err(self.abort_host(SessionError::NotHost("enter the first phase")));
        }
        info!(
            "Hosting session \"{}\" in {} at tick {}",
            self.config.title, phase, tick
        );
        Ok(())
    }

    fn setup_host(&mut self) -> Result<(), SessionError> {
        let mut ledger = ResourceLedger::open(
            &self.config.work_dir,
            self.config.chunk_size,
            self.config.ranked,
        )?;
        for (path, kind) in &self.config.resources {
            ledger.publish(path, *kind)?;
        }
        self.ledger = Some(ledger);

        let host_id = self.registry.init_host(&self.local_core);
        if !self.local_core.observer {
            self.engine.set_client_activated(host_id, true);
        }
        self.role = Some(Role::Host);
        self.game_loaded = true;
        self.status.announce(StatusInfo::new(
            GamePhase::Init,
            ControlMode::default(),
            self.engine.control_tick(),
        ));

        self.create_dynamic()?;
        let resources = match self.ledger.as_mut() {
            Some(ledger) => {
                if ledger.is_ranked() {
                    let hashed = ledger.ensure_hashes()?;
                    debug!("Hashed {} resources for a ranked session", hashed);
                }
                ledger.static_cores()
            }
            None => Vec::new(),
        };
        self.parameters = GameParameters {
            title: self.config.title.clone(),
            resources,
            ranked: self.config.ranked,
            league_address: self.config.league_address.clone(),
        };

        self.transport.listen()?;
        self.start_league()?;
        Ok(())
    }

    /// Starts joining the host reachable under any of `addresses`
    ///
    /// Progress is reported by `poll_join`.
    pub fn join_session(
        &mut self,
        addresses: &[String],
        password: Option<String>,
        now: Instant,
    ) -> Result<(), SessionError> {
        if self.is_active() {
            return Err(SessionError::AlreadyActive);
        }
        if addresses.is_empty() {
            return Err(SessionError::NoAddress);
        }
        let ledger = ResourceLedger::open(&self.config.work_dir, self.config.chunk_size, false)?;

        self.ledger = Some(ledger);
        self.role = Some(Role::Client);
        self.status
            .announce(StatusInfo::new(GamePhase::Init, ControlMode::default(), 0));
        self.join = Some(JoinAttempt::new(
            addresses,
            password,
            self.config.connect_interval,
            now,
        ));
        info!("Joining session at {}", addresses.join(", "));
        self.connect_pending(now);
        Ok(())
    }

    /// Drives the join; call until it returns something other than `Pending`
    pub fn poll_join(&mut self, now: Instant) -> JoinPoll {
        self.pump(now);
        self.connect_pending(now);

        let max_attempts = self.config.connect_attempts;
        let timeout = self.config.join_timeout;
        let Some(join) = self.join.as_mut() else {
            return JoinPoll::Failed(SessionError::NotActive);
        };

        if matches!(join.state, JoinState::Connecting) && join.exhausted(max_attempts) {
            join.state = JoinState::Failed(SessionError::ConnectionLost);
        }
        if matches!(
            join.state,
            JoinState::Connecting | JoinState::AwaitingJoinData(_)
        ) && now.saturating_duration_since(join.started) >= timeout
        {
            join.state = JoinState::Failed(SessionError::JoinTimeout);
        }

        match &mut join.state {
            JoinState::PasswordRequired { reported } => {
                if *reported {
                    return JoinPoll::Pending;
                }
                *reported = true;
                return JoinPoll::PasswordRequired;
            }
            JoinState::Connecting | JoinState::AwaitingJoinData(_) => return JoinPoll::Pending,
            JoinState::Joined(_) | JoinState::Failed(_) => {}
        }

        match self.join.take().map(|join| join.state) {
            Some(JoinState::Joined(outcome)) => JoinPoll::Joined(outcome),
            Some(JoinState::Failed(e)) => {
                warn!("Join failed: {}", e);
                self.clear();
                JoinPoll::Failed(e)
            }
            _ => JoinPoll::Pending,
        }
    }

    /// Reconnects with a new password after `JoinPoll::PasswordRequired`
    pub fn retry_join(&mut self, password: &str, now: Instant) -> Result<(), SessionError> {
        let Some(join) = self.join.as_mut() else {
            return Err(SessionError::NotActive);
        };
        if !matches!(join.state, JoinState::PasswordRequired { .. }) {
            return Err(SessionError::NotActive);
        }
        join.password = Some(password.to_string());
        join.password_retried = true;
        join.started = now;
        join.state = JoinState::Connecting;
        for pending in &mut join.pending {
            pending.conn = None;
            pending.attempts = 0;
            pending.timer.reset();
        }
        self.connect_pending(now);
        Ok(())
    }

    /// (Re)connects candidate addresses that are due
    pub(super) fn connect_pending(&mut self, now: Instant) {
        let max_attempts = self.config.connect_attempts;
        let Some(join) = self.join.as_mut() else {
            return;
        };
        if !matches!(join.state, JoinState::Connecting) {
            return;
        }
        let password = join.password.clone();
        for pending in join.pending.iter_mut() {
            if pending.conn.is_some()
                || pending.attempts >= max_attempts
                || !pending.timer.is_due(now)
            {
                continue;
            }
            pending.attempts += 1;
            pending.timer.fire(now);
            match self
                .transport
                .connect(&pending.addr, &self.local_core, password.as_deref())
            {
                Ok(conn) => {
                    debug!(
                        "Connecting to {} (attempt {}) on {:?}",
                        pending.addr, pending.attempts, conn
                    );
                    pending.conn = Some(conn);
                }
                Err(e) => warn!("Could not connect to {}: {}", pending.addr, e),
            }
        }
    }

    /// Returns true if `conn` belonged to the join attempt
    pub(super) fn join_conn_closed(&mut self, conn: ConnHandle) -> bool {
        let Some(join) = self.join.as_mut() else {
            return false;
        };
        match join.state {
            JoinState::Connecting => {
                if let Some(pending) = join.pending.iter_mut().find(|p| p.conn == Some(conn)) {
                    debug!("Connection to {} closed", pending.addr);
                    pending.conn = None;
                    return true;
                }
                false
            }
            JoinState::AwaitingJoinData(awaited) if awaited == conn => {
                join.state = JoinState::Failed(SessionError::ConnectionLost);
                true
            }
            _ => false,
        }
    }

    /// Host: admission of a new peer
    pub(super) fn handle_conn(
        &mut self,
        conn: ConnHandle,
        engine_version: u32,
        core: ClientCore,
        password: Option<String>,
        now: Instant,
    ) {
        let verdict = if engine_version != ENGINE_VERSION {
            Err(JoinReject::VersionMismatch(engine_version))
        } else {
            let password_ok = self.config.password_matches(password.as_deref());
            self.registry.join(&core, password_ok, self.config.allow_join)
        };

        let id = match verdict {
            Ok(id) => id,
            Err(reject) => {
                info!("Rejected join of {}: {}", core.name, reject);
                let reply = Packet::ConnRe {
                    ok: false,
                    wrong_password: reject == JoinReject::WrongPassword,
                    message: reject.to_string(),
                };
                self.send(conn, &reply);
                self.transport.close(conn);
                return;
            }
        };

        self.registry.attach_conn(id, conn);
        self.send(
            conn,
            &Packet::ConnRe {
                ok: true,
                wrong_password: false,
                message: String::new(),
            },
        );
        if let Some(core) = self.registry.find_by_id(id).map(|record| record.core()) {
            let name = core.name.clone();
            self.broadcast_except(&Packet::ClientJoin { core }, Some(id));
            self.emit(SessionEvent::ClientJoined { id, name });
        }
        self.invalidate_reference();
        self.send_join_data(id, now);
    }

    /// Joiner: the host's verdict on our connection request
    pub(super) fn handle_conn_re(
        &mut self,
        conn: ConnHandle,
        ok: bool,
        wrong_password: bool,
        message: String,
    ) {
        let Some(join) = self.join.as_mut() else {
            debug!("Connection reply without a join attempt");
            return;
        };
        if !matches!(join.state, JoinState::Connecting)
            || !join.pending.iter().any(|p| p.conn == Some(conn))
        {
            return;
        }

        let mut to_close = Vec::new();
        for pending in join.pending.iter_mut() {
            if let Some(other) = pending.conn.take() {
                if !(ok && other == conn) {
                    to_close.push(other);
                }
            }
        }

        if ok {
            info!("Host accepted the connection, waiting for join data");
            join.state = JoinState::AwaitingJoinData(conn);
        } else if wrong_password && !join.password_retried {
            info!("Host asks for a password");
            join.state = JoinState::PasswordRequired { reported: false };
        } else {
            let reject = if wrong_password {
                JoinReject::WrongPassword
            } else {
                JoinReject::Host(message)
            };
            warn!("Host rejected the connection: {}", reject);
            join.state = JoinState::Failed(SessionError::JoinRejected(reject));
        }

        for other in to_close {
            self.transport.close(other);
        }
    }

    /// Host: sends the initial state, regenerating the snapshot first if it
    /// is older than the current control tick
    pub(super) fn send_join_data(&mut self, id: ClientId, now: Instant) {
        let fresh = self.dynamic_tick.is_some_and(|tick| tick >= self.engine.control_tick());
        let dynamic = self
            .ledger
            .as_ref()
            .and_then(|ledger| ledger.dynamic().cloned());
        let (Some(dynamic), true) = (dynamic, fresh) else {
            debug!("Dynamic snapshot outdated, client {} has to wait", id);
            self.dynamic_needed = true;
            if self.is_frozen() {
                self.provide_dynamic(now);
            } else {
                self.sync(now);
            }
            return;
        };

        let packet = Packet::JoinData {
            client_id: id,
            status: self.status.info(),
            start_tick: self.dynamic_tick.unwrap_or_default(),
            parameters: self.parameters.clone(),
            dynamic,
            clients: self.registry.snapshot(),
        };
        self.send_to_client(id, &packet);

        if let Some(record) = self.registry.find_by_id_mut(id) {
            record.has_join_data = true;
        }
        self.registry.set_status(id, ClientStatus::Chasing);
        if !self.chase_timer.is_armed() {
            self.chase_timer.fire(now);
        }
        debug!("Join data sent to client {}", id);
    }

    /// Host: takes a fresh snapshot and serves everyone waiting for one
    pub(super) fn provide_dynamic(&mut self, now: Instant) {
        self.dynamic_needed = false;
        if let Err(e) = self.create_dynamic() {
            error!("Could not create dynamic snapshot: {}", e);
            return;
        }
        let waiting: Vec<ClientId> = self
            .registry
            .remotes()
            .filter(|record| record.status == ClientStatus::Joining)
            .map(|record| record.id)
            .collect();
        for id in waiting {
            self.send_join_data(id, now);
        }
    }

    fn create_dynamic(&mut self) -> Result<(), SessionError> {
        let bytes = self.engine.snapshot_state();
        let tick = self.engine.control_tick();
        let ledger = self.ledger.as_mut().ok_or(SessionError::NotActive)?;
        ledger.invalidate_dynamic();
        let core = ledger.publish_bytes("dynamic.bin", ResourceKind::Dynamic, &bytes)?;
        if ledger.is_ranked() {
            ledger.ensure_hashes()?;
        }
        info!("Dynamic snapshot {} created at tick {}", core.id, tick);
        self.dynamic_id = Some(core.id);
        self.dynamic_tick = Some(tick);
        Ok(())
    }

    /// Host: forgets the snapshot once the game moved past it and nobody
    /// is still fetching it
    pub(super) fn drop_stale_dynamic(&mut self) {
        let stale = self
            .dynamic_tick
            .is_some_and(|tick| self.engine.control_tick() > tick);
        let in_use = self
            .registry
            .remotes()
            .any(|record| matches!(record.status, ClientStatus::Joining | ClientStatus::Chasing));
        if !stale || in_use || self.dynamic_needed {
            return;
        }
        if let Some(ledger) = self.ledger.as_mut() {
            ledger.invalidate_dynamic();
        }
        self.dynamic_id = None;
        self.dynamic_tick = None;
    }

    /// Joiner: adopts the host's initial state
    pub(super) fn handle_join_data(&mut self, conn: ConnHandle, data: JoinSnapshot, now: Instant) {
        let awaiting = self.join.as_ref().is_some_and(|join| {
            matches!(join.state, JoinState::AwaitingJoinData(awaited) if awaited == conn)
        });
        if !awaiting || self.status.phase() != GamePhase::Init {
            warn!("Unexpected join data on {:?}", conn);
            return;
        }
        if !matches!(
            data.status.phase,
            GamePhase::Lobby | GamePhase::Paused | GamePhase::Running
        ) {
            let error = SessionError::BadJoinData(format!("host is in {}", data.status.phase));
            if let Some(join) = self.join.as_mut() {
                join.state = JoinState::Failed(error);
            }
            return;
        }

        let local_core = data
            .clients
            .iter()
            .find(|core| core.id == Some(data.client_id))
            .cloned()
            .unwrap_or_else(|| self.local_core.clone());
        self.registry.clear();
        self.registry.init_local(data.client_id, &local_core);
        for core in data.clients.iter().filter(|core| core.id != Some(data.client_id)) {
            self.registry.add_remote(core);
        }
        let host_id = data
            .clients
            .iter()
            .find(|core| core.host)
            .and_then(|core| core.id)
            .unwrap_or(HOST_CLIENT_ID);
        self.registry.attach_conn(host_id, conn);
        self.host_conn = Some(conn);

        self.parameters = data.parameters;
        self.start_tick = data.start_tick;
        self.chasing = true;
        self.game_loaded = false;
        self.dynamic_id = Some(data.dynamic.id);
        if let Some(ledger) = self.ledger.as_mut() {
            ledger.set_ranked(self.parameters.ranked);
        }
        self.chunk_timer.fire(now);

        let mut cores = self.parameters.resources.clone();
        cores.push(data.dynamic);
        for core in &cores {
            self.start_retrieval(core, now);
        }

        info!(
            "Joined as client {} ({}), host is in {} at tick {}",
            data.client_id, local_core.name, data.status.phase, data.status.target_tick
        );
        let outcome = JoinOutcome {
            client_id: data.client_id,
            status: data.status,
            start_tick: data.start_tick,
            parameters: self.parameters.clone(),
        };
        if let Some(join) = self.join.as_mut() {
            join.state = JoinState::Joined(outcome);
        }

        self.handle_status(data.status, now);
        self.poll_retrievals(now);
    }

    fn start_retrieval(&mut self, core: &ResourceCore, now: Instant) {
        let timeout = self.config.res_retrieve_timeout;
        let Some(ledger) = self.ledger.as_mut() else {
            return;
        };
        match ledger.retrieve(core, timeout, now) {
            Ok(task) => {
                self.retrievals.push(TrackedRetrieval {
                    task,
                    reported: 0,
                    stalled: false,
                });
                self.request_chunks(core.id, 0);
            }
            Err(e) => {
                error!("Cannot retrieve resource {}: {}", core.id, e);
                self.terminate(format!("resource {} unavailable", core.id));
            }
        }
    }

    /// Starts fetching a resource from the host; poll with `poll_retrieve`
    pub fn retrieve(&mut self, core: &ResourceCore, now: Instant) -> Result<RetrieveTask, SessionError> {
        let timeout = self.config.res_retrieve_timeout;
        let ledger = self.ledger.as_mut().ok_or(SessionError::NotActive)?;
        let task = ledger.retrieve(core, timeout, now)?;
        if ledger.missing_chunk(core.id).is_some() {
            self.request_chunks(core.id, 0);
        }
        Ok(task)
    }

    pub fn poll_retrieve(&self, task: &mut RetrieveTask, now: Instant) -> RetrievePoll {
        match self.ledger.as_ref() {
            Some(ledger) => ledger.poll_retrieve(task, now),
            None => RetrievePoll::Unknown,
        }
    }

    fn request_chunks(&mut self, res_id: ResourceId, from_chunk: u32) {
        self.chunk_windows
            .insert(res_id, from_chunk.saturating_add(REQUEST_WINDOW));
        self.send_to_host(&Packet::ResRequest { res_id, from_chunk });
    }

    /// Re-requests the first missing chunk of every fetch
    pub(super) fn request_missing_chunks(&mut self, now: Instant) {
        if self.is_host() || !self.chunk_timer.try_fire(now) {
            return;
        }
        let missing: Vec<(ResourceId, u32)> = match self.ledger.as_ref() {
            Some(ledger) => ledger
                .fetching()
                .into_iter()
                .filter_map(|id| ledger.missing_chunk(id).map(|index| (id, index)))
                .collect(),
            None => return,
        };
        for (res_id, index) in missing {
            debug!("Re-requesting resource {} from chunk {}", res_id, index);
            self.request_chunks(res_id, index);
        }
    }

    /// Serves a window of chunks to a peer
    pub(super) fn handle_res_request(&mut self, conn: ConnHandle, res_id: ResourceId, from_chunk: u32) {
        let Some(ledger) = self.ledger.as_ref() else {
            return;
        };
        let Some(core) = ledger.core(res_id) else {
            debug!("Request for unknown resource {}", res_id);
            return;
        };
        let end = from_chunk
            .saturating_add(REQUEST_WINDOW)
            .min(core.chunk_count);

        let mut chunks = Vec::new();
        for index in from_chunk..end {
            match ledger.serve_chunk(res_id, index) {
                Ok(data) => chunks.push(Packet::ResChunk { res_id, index, data }),
                Err(e) => {
                    warn!("Not serving resource {} chunk {}: {}", res_id, index, e);
                    break;
                }
            }
        }
        for packet in chunks {
            self.send(conn, &packet);
        }
    }

    pub(super) fn handle_res_chunk(&mut self, res_id: ResourceId, index: u32, data: Vec<u8>, now: Instant) {
        let Some(ledger) = self.ledger.as_mut() else {
            return;
        };
        match ledger.receive_chunk(res_id, index, data) {
            Ok(true) => {
                self.chunk_windows.remove(&res_id);
                self.poll_retrievals(now);
            }
            Ok(false) => {
                let window_end = self.chunk_windows.get(&res_id).copied().unwrap_or(0);
                if index.saturating_add(1) >= window_end {
                    if let Some(next) = ledger.missing_chunk(res_id) {
                        self.request_chunks(res_id, next);
                    }
                }
            }
            Err(ResourceError::HashMismatch(_)) => {
                warn!("Resource {} corrupted in transit, fetching again", res_id);
                self.request_chunks(res_id, 0);
            }
            Err(e) => debug!("Dropping chunk {} of resource {}: {}", index, res_id, e),
        }
    }

    /// Advances tracked retrievals and acts on finished ones
    pub(super) fn poll_retrievals(&mut self, now: Instant) {
        let Some(ledger) = self.ledger.as_ref() else {
            return;
        };
        let mut events = Vec::new();
        let mut finished: Vec<(ResourceId, Result<PathBuf, u8>)> = Vec::new();

        for tracked in self.retrievals.iter_mut() {
            let res_id = tracked.task.res_id;
            match ledger.poll_retrieve(&mut tracked.task, now) {
                RetrievePoll::Done(path) => finished.push((res_id, Ok(path))),
                RetrievePoll::TimedOut { percent } => finished.push((res_id, Err(percent))),
                RetrievePoll::Unknown => finished.push((res_id, Err(0))),
                RetrievePoll::Stalled { percent, .. } => {
                    if !tracked.stalled {
                        tracked.stalled = true;
                        events.push(SessionEvent::ResourceStalled { res_id, percent });
                    }
                }
                RetrievePoll::Progress(percent) => {
                    tracked.stalled = false;
                    if percent != tracked.reported {
                        tracked.reported = percent;
                        events.push(SessionEvent::ResourceProgress { res_id, percent });
                    }
                }
            }
        }
        self.retrievals
            .retain(|tracked| !finished.iter().any(|(id, _)| *id == tracked.task.res_id));

        for event in events {
            self.emit(event);
        }
        for (res_id, result) in finished {
            match result {
                Ok(path) => self.on_resource_present(res_id, path, now),
                Err(percent) => {
                    error!("Resource {} not retrieved ({}% present)", res_id, percent);
                    self.terminate(format!("resource {} could not be retrieved", res_id));
                    return;
                }
            }
        }
    }

    fn on_resource_present(&mut self, res_id: ResourceId, path: PathBuf, now: Instant) {
        self.emit(SessionEvent::ResourceRetrieved {
            res_id,
            path: path.clone(),
        });
        if self.dynamic_id != Some(res_id) || self.game_loaded {
            return;
        }
        match std::fs::read(&path) {
            Ok(bytes) => {
                self.engine.load_snapshot(self.start_tick, &bytes);
                self.game_loaded = true;
                info!("Dynamic snapshot loaded, starting at tick {}", self.start_tick);
                self.check_status_reached(now);
            }
            Err(e) => {
                error!("Cannot read dynamic snapshot {}: {}", path.display(), e);
                self.terminate("dynamic snapshot unreadable".to_string());
            }
        }
    }
}
