//! Status barrier, chase targets and client activation
//!
//! The host is the only writer of the session status. Every change clears
//! the ready flags of the waited-for clients; the barrier is acknowledged
//! once the host and all of them have reached the announced tick. A client
//! that reports a higher tick than the host's target moves the target
//! forward, so the acknowledged tick never goes back.

use super::{SessionCoordinator, SessionEvent};
use crate::client_registry::{ClientRecord, ClientStatus};
use crate::replication::ReplicationEngine;
use crate::transport::{ConnHandle, Transport};
use log::{debug, info, warn};
use shared::{ClientId, GamePhase, Packet, StatusInfo, Tick};
use std::time::Instant;

impl<T: Transport, E: ReplicationEngine> SessionCoordinator<T, E> {
    /// Host: announces a new phase and target tick
    ///
    /// Returns false on clients, and in a ranked session that would start
    /// running with a resource whose hash cannot be computed.
    pub fn change_status(&mut self, phase: GamePhase, tick: Tick, now: Instant) -> bool {
        if !self.is_host() {
            return false;
        }
        if phase == GamePhase::Running && !self.ranked_resources_hashed() {
            warn!("Refusing to run a ranked session with unhashed resources");
            return false;
        }

        let info = StatusInfo::new(phase, self.status.ctrl_mode(), tick);
        self.status.announce(info);
        info!("Status changed to {} (tick {})", phase, tick);
        self.invalidate_reference();
        self.registry.reset_ready();
        self.diagnostics.on_announce(now);
        self.barrier_timer.fire(now);
        self.enter_phase(phase);

        self.broadcast(&Packet::Status(info));
        self.emit(SessionEvent::StatusChanged(info));
        self.check_status_reached(now);
        true
    }

    fn ranked_resources_hashed(&mut self) -> bool {
        let Some(ledger) = self.ledger.as_mut() else {
            return true;
        };
        if !ledger.is_ranked() || ledger.all_hashed() {
            return true;
        }
        match ledger.ensure_hashes() {
            Ok(_) => ledger.all_hashed(),
            Err(e) => {
                warn!("Hashing resources failed: {}", e);
                false
            }
        }
    }

    fn enter_phase(&mut self, phase: GamePhase) {
        if phase == GamePhase::Lobby {
            self.lobby_running = self.config.auto_open_lobby;
        }
    }

    /// Host: starts or resumes the game at the current control tick
    pub fn start(&mut self, now: Instant) -> bool {
        if !self.is_host() {
            return false;
        }
        if self.phase() == GamePhase::Running {
            return true;
        }
        let tick = self.engine.control_tick();
        self.change_status(GamePhase::Running, tick, now)
    }

    /// Host: halts the game at the next control tick
    pub fn pause(&mut self, now: Instant) -> bool {
        if !self.is_host() {
            return false;
        }
        if self.phase() == GamePhase::Paused {
            return true;
        }
        let tick = self.engine.next_control_tick();
        self.change_status(GamePhase::Paused, tick, now)
    }

    /// Host: re-synchronizes all peers at the next control tick
    pub fn sync(&mut self, now: Instant) -> bool {
        if !self.is_host() {
            return false;
        }
        if self.is_frozen() || !self.status.is_reached() {
            return true;
        }
        let tick = self.engine.next_control_tick();
        self.change_status(self.phase(), tick, now)
    }

    /// Host: returns to the lobby
    pub fn enter_lobby(&mut self, now: Instant) -> bool {
        let tick = self.engine.control_tick();
        self.change_status(GamePhase::Lobby, tick, now)
    }

    /// Marks the local lobby as up, which reaches a lobby status
    pub fn set_lobby_running(&mut self, running: bool, now: Instant) {
        self.lobby_running = running;
        if running {
            self.check_status_reached(now);
        }
    }

    /// No control ticks are executed in this state
    pub(super) fn is_frozen(&self) -> bool {
        match self.phase() {
            GamePhase::Lobby => true,
            GamePhase::Paused => self.status.is_acknowledged(),
            _ => false,
        }
    }

    /// Client: adopts a status announced by the host
    pub(super) fn handle_status(&mut self, info: StatusInfo, now: Instant) {
        if self.registry.local_id().is_none() {
            return;
        }
        self.status.announce(info);
        debug!("Host announced {} (tick {})", info.phase, info.target_tick);
        self.enter_phase(info.phase);
        self.emit(SessionEvent::StatusChanged(info));
        self.check_status_reached(now);
    }

    /// Host: a client reports that it reached a status
    pub(super) fn handle_status_ack(
        &mut self,
        id: ClientId,
        conn: ConnHandle,
        info: StatusInfo,
        now: Instant,
    ) {
        let joined = self
            .registry
            .find_by_id(id)
            .is_some_and(|record| record.has_join_data && !record.is_removed());
        if !joined
            || !self.status.same_phase(&info)
            || info.target_tick < self.status.target_tick()
        {
            self.diagnostics.acks_ignored += 1;
            debug!(
                "Ignoring ack of client {} for {} (tick {})",
                id, info.phase, info.target_tick
            );
            return;
        }

        if !self.status.is_acknowledged() && info.target_tick > self.status.target_tick() {
            let mut tick = info.target_tick;
            let bound = self.engine.max_known_tick();
            let clamped = self.config.clamp_ack_ticks && tick > bound;
            if clamped {
                warn!(
                    "Client {} acked tick {} beyond known control {}",
                    id, tick, bound
                );
                self.diagnostics.clamped_acks += 1;
                tick = bound;
            }
            if tick > self.status.target_tick() {
                info!("Client {} is ahead, moving target to tick {}", id, tick);
                self.diagnostics.tick_adoptions += 1;
                self.change_status(info.phase, tick, now);
            }
            if clamped {
                // The client has to ack the adopted tick
                return;
            }
        }

        if self.status.is_acknowledged() {
            self.send(conn, &Packet::StatusAck(info));
        }
        self.registry.set_status(id, ClientStatus::Ready);
        self.diagnostics.acks_accepted += 1;

        if self.status.is_reached() && !self.status.is_acknowledged() {
            self.check_status_ack();
        }
    }

    /// Client: the host confirmed the barrier
    pub(super) fn handle_host_ack(&mut self, info: StatusInfo) {
        if self.status.is_acknowledged()
            || !self.status.same_phase(&info)
            || info.target_tick != self.status.target_tick()
        {
            return;
        }
        if self.status.acknowledge() {
            self.chasing = false;
            self.on_status_ack();
        }
    }

    /// Checks whether the local peer arrived at the announced status
    pub(super) fn check_status_reached(&mut self, now: Instant) {
        if !self.is_active() || self.status.is_reached() {
            return;
        }
        let reached = match self.phase() {
            GamePhase::Lobby => self.lobby_running,
            GamePhase::Running | GamePhase::Paused => {
                if !self.game_loaded {
                    return;
                }
                let target = self.status.target_tick();
                let control = self.engine.control_tick();
                let reached = self.engine.ctrl_tick_reached(target)
                    && (self.chasing || !self.engine.ctrl_ready(control));
                if !reached {
                    self.engine.set_running(true, Some(target));
                }
                reached
            }
            GamePhase::None | GamePhase::Init => false,
        };
        if reached {
            self.status.mark_reached();
            self.on_status_reached(now);
        }
    }

    fn on_status_reached(&mut self, now: Instant) {
        if self.phase().is_ticked() {
            self.engine.set_running(false, None);
        }
        debug!(
            "Reached {} (tick {})",
            self.phase(),
            self.status.target_tick()
        );
        self.emit(SessionEvent::StatusReached(self.status.info()));

        if self.is_host() {
            if self.dynamic_needed {
                self.provide_dynamic(now);
            }
            self.check_status_ack();
            return;
        }

        if self.phase().is_ticked() {
            let control = self.engine.control_tick();
            self.status.set_target_tick(control);
        }
        self.send_to_host(&Packet::StatusAck(self.status.info()));
        if self.delayed_activate {
            self.delayed_activate = false;
            self.request_activate(now);
        }
    }

    /// Host: acknowledges the barrier once everybody is ready
    pub(super) fn check_status_ack(&mut self) {
        if !self.is_host() || !self.status.is_reached() || self.status.is_acknowledged() {
            return;
        }
        if !self.registry.all_clients_ready() {
            return;
        }
        self.status.acknowledge();
        self.diagnostics.on_acknowledged();
        if self.phase().is_ticked() {
            self.engine.exec_sync_control();
        }
        self.broadcast(&Packet::StatusAck(self.status.info()));
        self.on_status_ack();
    }

    fn on_status_ack(&mut self) {
        let info = self.status.info();
        info!("Status {} (tick {}) acknowledged", info.phase, info.target_tick);
        if info.phase == GamePhase::Running {
            self.engine.set_ctrl_mode(info.ctrl_mode);
            self.engine.set_running(true, None);
        }
        self.emit(SessionEvent::StatusAcknowledged(info));
    }

    /// Host: keeps chasing clients informed about the current tick
    pub(super) fn update_chase_target(&mut self, now: Instant) {
        let chasing: Vec<ConnHandle> = self
            .registry
            .remotes()
            .filter(|record| record.is_chasing())
            .filter_map(ClientRecord::send_conn)
            .collect();
        if chasing.is_empty() {
            self.chase_timer.reset();
            return;
        }
        if !self.chase_timer.is_armed() {
            self.chase_timer.fire(now);
            return;
        }
        if !self.chase_timer.try_fire(now) {
            return;
        }
        let info = StatusInfo::new(
            self.phase(),
            self.status.ctrl_mode(),
            self.engine.control_tick(),
        );
        for conn in chasing {
            self.send(conn, &Packet::Status(info));
        }
    }

    /// Host: repeats the pending announcement to clients that have not acked
    pub(super) fn resend_barrier(&mut self, now: Instant) {
        if self.status.is_acknowledged() || !self.barrier_timer.try_fire(now) {
            return;
        }
        let waiting: Vec<ConnHandle> = self
            .registry
            .remotes()
            .filter(|record| record.is_waited_for() && !record.is_ready())
            .filter_map(ClientRecord::send_conn)
            .collect();
        if waiting.is_empty() {
            return;
        }
        self.diagnostics.resends += 1;
        debug!(
            "Barrier at tick {} still waiting for {} clients",
            self.status.target_tick(),
            waiting.len()
        );
        let packet = Packet::Status(self.status.info());
        for conn in waiting {
            self.send(conn, &packet);
        }
    }

    /// Asks the host to let the local peer take part in the game
    pub fn request_activate(&mut self, now: Instant) {
        let Some(local) = self.registry.local() else {
            return;
        };
        if local.observer || local.activated {
            self.activation_timer.reset();
            self.delayed_activate = false;
            return;
        }
        let local_id = local.id;
        if self.is_host() {
            self.set_client_activation(local_id, true);
            return;
        }
        if !self.activation_timer.is_due(now) {
            return;
        }
        if !self.status.is_reached() {
            self.delayed_activate = true;
            return;
        }
        self.activation_timer.fire(now);
        self.delayed_activate = false;
        let tick = self.engine.frame_counter();
        debug!("Requesting activation at frame {}", tick);
        self.send_to_host(&Packet::ClientActivationRequest { tick });
    }

    pub(super) fn handle_activation_request(&mut self, id: ClientId, conn: ConnHandle, tick: Tick) {
        let Some(record) = self.registry.find_by_id(id) else {
            return;
        };
        if record.activated {
            // Asking again means our update never arrived
            debug!("Client {} already activated, repeating the update", id);
            self.send(
                conn,
                &Packet::ClientUpdate {
                    client_id: id,
                    activated: true,
                },
            );
            return;
        }
        if record.observer || !record.is_waited_for() {
            debug!("Activation request of client {} ignored", id);
            return;
        }
        if self.phase() == GamePhase::Running {
            let ping = self.transport.ping_ms(conn).unwrap_or(0);
            let lag = (ping.saturating_mul(self.config.frames_per_second) / 500).min(100);
            let frame = self.engine.frame_counter();
            if tick
                .saturating_add(lag)
                .saturating_add(self.config.max_behind_for_activation)
                < frame
            {
                info!(
                    "Client {} is too far behind for activation ({} < {})",
                    id, tick, frame
                );
                return;
            }
        }
        self.set_client_activation(id, true);
    }

    /// Host: activates or deactivates a client for everyone
    pub fn set_client_activation(&mut self, id: ClientId, activated: bool) -> bool {
        if !self.is_host() || !self.registry.set_activated(id, activated) {
            return false;
        }
        if activated {
            let frame = self.engine.frame_counter();
            if let Some(record) = self.registry.find_by_id_mut(id) {
                record.last_activity = frame;
            }
        }
        self.engine.set_client_activated(id, activated);
        self.broadcast(&Packet::ClientUpdate {
            client_id: id,
            activated,
        });
        self.emit(SessionEvent::ClientActivated { id, activated });
        true
    }

    /// Host: demotes activated clients that stopped playing
    pub(super) fn deactivate_inactive_clients(&mut self) {
        let frame = self.engine.frame_counter();
        let engine = &self.engine;
        self.registry
            .update_activity(frame, |id| engine.has_players(id));
        let inactive = self
            .registry
            .inactive_clients(frame, self.config.deactivation_delay);
        for id in inactive {
            info!("Client {} inactive, deactivating", id);
            self.set_client_activation(id, false);
        }
    }
}
