//! Client registry for the session
//!
//! This module tracks every peer that ever joined the session, including:
//! - Identity assignment (stable ids, never reused within a session)
//! - Deterministic display name deduplication
//! - Activation, observer and lobby readiness flags
//! - Connection handles and barrier readiness
//!
//! Records are never erased while the session lives. A disconnecting client
//! is marked removed so ids and names stay reserved for replays and
//! statistics.

use crate::error::JoinReject;
use crate::transport::ConnHandle;
use log::{debug, info};
use shared::{ClientCore, ClientId, FIRST_CLIENT_ID, HOST_CLIENT_ID, MAX_CLIENT_NAME_LEN};
use std::collections::BTreeMap;

/// Where a client stands in the join and barrier protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    /// Accepted, waiting for its join data
    Joining,
    /// Catching up to the current tick, exempt from barriers
    Chasing,
    NotReady,
    Ready,
    Removed,
}

/// One peer of the session
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub id: ClientId,
    pub name: String,
    pub host: bool,
    pub observer: bool,
    pub activated: bool,
    /// Record of the peer running this process
    pub local: bool,
    pub msg_conn: Option<ConnHandle>,
    pub data_conn: Option<ConnHandle>,
    /// Frame at which the client was last seen controlling players
    pub last_activity: u32,
    pub lobby_ready: bool,
    pub status: ClientStatus,
    /// Join data has been delivered to this client
    pub has_join_data: bool,
}

impl ClientRecord {
    /// Creates a record from a client core whose id has been assigned
    pub fn from_core(id: ClientId, core: &ClientCore) -> Self {
        Self {
            id,
            name: core.name.clone(),
            host: core.host,
            observer: core.observer,
            activated: core.activated,
            local: false,
            msg_conn: None,
            data_conn: None,
            last_activity: 0,
            lobby_ready: false,
            status: ClientStatus::NotReady,
            has_join_data: true,
        }
    }

    /// Wire representation sent to other peers
    pub fn core(&self) -> ClientCore {
        ClientCore {
            id: Some(self.id),
            name: self.name.clone(),
            host: self.host,
            observer: self.observer,
            activated: self.activated,
        }
    }

    /// Clients the barrier waits for: fully joined and not chasing
    pub fn is_waited_for(&self) -> bool {
        matches!(self.status, ClientStatus::NotReady | ClientStatus::Ready)
    }

    pub fn is_ready(&self) -> bool {
        self.status == ClientStatus::Ready
    }

    pub fn is_chasing(&self) -> bool {
        self.status == ClientStatus::Chasing
    }

    pub fn is_removed(&self) -> bool {
        self.status == ClientStatus::Removed
    }

    pub fn is_connected(&self) -> bool {
        self.msg_conn.is_some() || self.data_conn.is_some()
    }

    pub fn has_conn(&self, conn: ConnHandle) -> bool {
        self.msg_conn == Some(conn) || self.data_conn == Some(conn)
    }

    /// Connection used for protocol messages, falling back to the data link
    pub fn send_conn(&self) -> Option<ConnHandle> {
        self.msg_conn.or(self.data_conn)
    }
}

/// All clients of the session, keyed by id
///
/// Iteration is ordered by id, which makes broadcasts and name resolution
/// reproducible from join order alone.
#[derive(Debug)]
pub struct ClientRegistry {
    clients: BTreeMap<ClientId, ClientRecord>,
    next_client_id: ClientId,
    local_id: Option<ClientId>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    /// Creates an empty registry; joiner ids start at 1, the host owns 0
    pub fn new() -> Self {
        Self {
            clients: BTreeMap::new(),
            next_client_id: FIRST_CLIENT_ID,
            local_id: None,
        }
    }

    /// Registers the local peer as host with the fixed host id
    pub fn init_host(&mut self, core: &ClientCore) -> ClientId {
        self.clients.clear();
        self.next_client_id = FIRST_CLIENT_ID;

        let mut record = ClientRecord::from_core(HOST_CLIENT_ID, core);
        record.host = true;
        record.local = true;
        record.activated = !core.observer;
        info!("Hosting as client {} ({})", HOST_CLIENT_ID, record.name);

        self.clients.insert(HOST_CLIENT_ID, record);
        self.local_id = Some(HOST_CLIENT_ID);
        HOST_CLIENT_ID
    }

    /// Registers the local peer on a joining client under the host-assigned id
    pub fn init_local(&mut self, id: ClientId, core: &ClientCore) {
        let mut record = ClientRecord::from_core(id, core);
        record.local = true;
        record.activated = false;
        self.clients.insert(id, record);
        self.local_id = Some(id);
    }

    /// Mirrors a remote client announced by the host
    pub fn add_remote(&mut self, core: &ClientCore) -> Option<ClientId> {
        let id = core.id?;
        if self.local_id == Some(id) {
            return Some(id);
        }
        debug!("Client {} ({}) known", id, core.name);
        self.clients
            .entry(id)
            .and_modify(|record| {
                record.name = core.name.clone();
                record.activated = core.activated;
            })
            .or_insert_with(|| ClientRecord::from_core(id, core));
        self.next_client_id = self.next_client_id.max(id.saturating_add(1));
        Some(id)
    }

    /// Admits a new client on the host
    ///
    /// The password is checked first so the joiner can be re-prompted. The
    /// joiner must not propose its own id. Accepted clients start
    /// deactivated, with a name that is unique among all records ever
    /// admitted, and in `Joining` status until their join data is sent.
    pub fn join(
        &mut self,
        core: &ClientCore,
        password_ok: bool,
        allow_join: bool,
    ) -> Result<ClientId, JoinReject> {
        if !password_ok {
            return Err(JoinReject::WrongPassword);
        }
        if !allow_join {
            return Err(JoinReject::JoiningDisallowed);
        }
        if let Some(id) = core.id {
            return Err(JoinReject::PresetId(id));
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        let mut record = ClientRecord::from_core(client_id, core);
        record.activated = false;
        record.host = false;
        record.name = self.unique_name(&core.name);
        record.status = ClientStatus::Joining;
        record.has_join_data = false;

        info!("Client {} joined as {}", client_id, record.name);
        self.clients.insert(client_id, record);

        Ok(client_id)
    }

    /// Resolves a name collision with the smallest free numeric suffix
    ///
    /// Suffixes start at 2. The base name is cut so that name and suffix
    /// together stay within the maximum name length.
    pub fn unique_name(&self, wanted: &str) -> String {
        let base: String = wanted.chars().take(MAX_CLIENT_NAME_LEN).collect();
        if self.find_by_name(&base).is_none() {
            return base;
        }

        let mut suffix: u32 = 1;
        loop {
            suffix += 1;
            let digits = suffix.to_string();
            let keep = MAX_CLIENT_NAME_LEN.saturating_sub(digits.len());
            let candidate: String = base.chars().take(keep).chain(digits.chars()).collect();
            if self.find_by_name(&candidate).is_none() {
                return candidate;
            }
        }
    }

    /// Sets the activation flag; returns true if it changed
    pub fn set_activated(&mut self, id: ClientId, activated: bool) -> bool {
        match self.clients.get_mut(&id) {
            Some(record) if !record.is_removed() && record.activated != activated => {
                record.activated = activated;
                info!(
                    "Client {} {}",
                    id,
                    if activated { "activated" } else { "deactivated" }
                );
                true
            }
            _ => false,
        }
    }

    /// Soft-deletes a client
    ///
    /// Returns true only for the call that actually removed it, so side
    /// effects tied to removal run once.
    pub fn mark_removed(&mut self, id: ClientId) -> bool {
        if let Some(record) = self.clients.get_mut(&id) {
            if record.is_removed() {
                return false;
            }
            record.status = ClientStatus::Removed;
            record.activated = false;
            record.lobby_ready = false;
            record.msg_conn = None;
            record.data_conn = None;
            info!("Client {} ({}) removed", id, record.name);
            true
        } else {
            false
        }
    }

    pub fn find_by_id(&self, id: ClientId) -> Option<&ClientRecord> {
        self.clients.get(&id)
    }

    pub fn find_by_id_mut(&mut self, id: ClientId) -> Option<&mut ClientRecord> {
        self.clients.get_mut(&id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&ClientRecord> {
        self.clients.values().find(|record| record.name == name)
    }

    /// Finds the live client owning a connection
    pub fn find_by_conn(&self, conn: ConnHandle) -> Option<&ClientRecord> {
        self.clients
            .values()
            .find(|record| !record.is_removed() && record.has_conn(conn))
    }

    /// Binds a connection to a client as its message link
    pub fn attach_conn(&mut self, id: ClientId, conn: ConnHandle) {
        if let Some(record) = self.clients.get_mut(&id) {
            if record.msg_conn.is_none() {
                record.msg_conn = Some(conn);
            } else if record.msg_conn != Some(conn) {
                record.data_conn = Some(conn);
            }
        }
    }

    /// Drops a connection handle from whichever client owns it
    ///
    /// Returns the owner and whether it has no connection left.
    pub fn detach_conn(&mut self, conn: ConnHandle) -> Option<(ClientId, bool)> {
        let record = self
            .clients
            .values_mut()
            .find(|record| record.has_conn(conn))?;
        if record.msg_conn == Some(conn) {
            record.msg_conn = None;
        }
        if record.data_conn == Some(conn) {
            record.data_conn = None;
        }
        Some((record.id, !record.is_connected()))
    }

    pub fn set_status(&mut self, id: ClientId, status: ClientStatus) {
        if let Some(record) = self.clients.get_mut(&id) {
            if !record.is_removed() {
                record.status = status;
            }
        }
    }

    /// Clears barrier readiness of every waited-for client
    pub fn reset_ready(&mut self) {
        for record in self.clients.values_mut() {
            if record.is_waited_for() {
                record.status = ClientStatus::NotReady;
            }
        }
    }

    /// True once every waited-for remote client has acknowledged
    pub fn all_clients_ready(&self) -> bool {
        self.clients
            .values()
            .filter(|record| !record.local && record.is_waited_for())
            .all(|record| record.is_ready())
    }

    /// Clears lobby readiness of everyone but the host
    pub fn clear_lobby_ready(&mut self) {
        for record in self.clients.values_mut() {
            if !record.host {
                record.lobby_ready = false;
            }
        }
    }

    /// Refreshes activity of activated clients that control players
    pub fn update_activity(&mut self, frame: u32, has_players: impl Fn(ClientId) -> bool) {
        for record in self.clients.values_mut() {
            if record.activated && has_players(record.id) {
                record.last_activity = frame;
            }
        }
    }

    /// Activated remote clients silent for longer than `delay` frames
    pub fn inactive_clients(&self, frame: u32, delay: u32) -> Vec<ClientId> {
        self.clients
            .values()
            .filter(|record| !record.local && record.activated)
            .filter(|record| record.last_activity.saturating_add(delay) < frame)
            .map(|record| record.id)
            .collect()
    }

    pub fn local_id(&self) -> Option<ClientId> {
        self.local_id
    }

    pub fn local(&self) -> Option<&ClientRecord> {
        self.local_id.and_then(|id| self.clients.get(&id))
    }

    pub fn local_mut(&mut self) -> Option<&mut ClientRecord> {
        let id = self.local_id?;
        self.clients.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientRecord> {
        self.clients.values()
    }

    /// Live records other than the local one
    pub fn remotes(&self) -> impl Iterator<Item = &ClientRecord> {
        self.clients
            .values()
            .filter(|record| !record.local && !record.is_removed())
    }

    /// Read-only copy of all live clients for joiners and the UI
    pub fn snapshot(&self) -> Vec<ClientCore> {
        self.clients
            .values()
            .filter(|record| !record.is_removed())
            .map(ClientRecord::core)
            .collect()
    }

    /// Number of live clients, local one included
    pub fn live_count(&self) -> usize {
        self.clients.values().filter(|r| !r.is_removed()).count()
    }

    pub fn clear(&mut self) {
        self.clients.clear();
        self.next_client_id = FIRST_CLIENT_ID;
        self.local_id = None;
    }
}
