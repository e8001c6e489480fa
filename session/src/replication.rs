//! Contract with the deterministic command-queue replication engine
//!
//! The engine carries per-tick input commands. The coordinator only asks
//! it whether ticks are reached or ready and tells it when to run.

use log::warn;
use serde::{Deserialize, Serialize};
use shared::{ClientId, ControlMode, Tick};
use std::collections::{BTreeMap, BTreeSet};

pub trait ReplicationEngine {
    /// Whether `client` has delivered its control for `tick`
    fn client_ready(&self, client: ClientId, tick: Tick) -> bool;

    /// Whether control for `tick` is complete and could be executed
    fn ctrl_ready(&self, tick: Tick) -> bool;

    fn ctrl_tick_reached(&self, tick: Tick) -> bool;

    /// Runs control up to `target`, or without bound for `None`
    fn set_running(&mut self, running: bool, target: Option<Tick>);

    /// Executes queued synchronous control once a barrier is acknowledged
    fn exec_sync_control(&mut self);

    fn set_ctrl_mode(&mut self, mode: ControlMode);

    fn control_tick(&self) -> Tick;

    fn next_control_tick(&self) -> Tick;

    fn frame_counter(&self) -> u32;

    /// Highest tick the engine has any control for
    fn max_known_tick(&self) -> Tick;

    fn has_players(&self, client: ClientId) -> bool;

    fn set_client_activated(&mut self, client: ClientId, activated: bool);

    fn client_removed(&mut self, client: ClientId);

    fn abort_game(&mut self);

    /// Serialized simulation state used as the dynamic snapshot
    fn snapshot_state(&mut self) -> Vec<u8>;

    /// Initializes a joining peer from a retrieved dynamic snapshot
    fn load_snapshot(&mut self, start_tick: Tick, snapshot: &[u8]);

    /// Record bytes written since the last call, for live streaming
    fn take_record_data(&mut self) -> Vec<u8> {
        Vec::new()
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotHeader {
    control_tick: Tick,
    frame: u32,
    players: Vec<ClientId>,
}

/// Local stand-in engine that executes control as soon as it runs
///
/// Used by the command line peer and by tests. Control ticks advance one
/// per frame while running and stop at the run target.
#[derive(Debug, Clone)]
pub struct ImmediateControl {
    control_tick: Tick,
    frame: u32,
    running: bool,
    run_target: Option<Tick>,
    lead: Tick,
    mode: ControlMode,
    players: BTreeSet<ClientId>,
    activated: BTreeSet<ClientId>,
    delivered: BTreeMap<ClientId, Tick>,
    removed: Vec<ClientId>,
    sync_executions: u32,
    aborted: bool,
    record: Vec<u8>,
}

impl Default for ImmediateControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ImmediateControl {
    pub fn new() -> Self {
        Self {
            control_tick: 0,
            frame: 0,
            running: false,
            run_target: None,
            lead: 36,
            mode: ControlMode::Central,
            players: BTreeSet::new(),
            activated: BTreeSet::new(),
            delivered: BTreeMap::new(),
            removed: Vec::new(),
            sync_executions: 0,
            aborted: false,
            record: Vec::new(),
        }
    }

    pub fn at_tick(tick: Tick) -> Self {
        Self {
            control_tick: tick,
            frame: tick,
            ..Self::new()
        }
    }

    /// Sets how far past the control tick control may be known
    pub fn with_lead(mut self, lead: Tick) -> Self {
        self.lead = lead;
        self
    }

    /// Simulates `frames` frames
    pub fn advance(&mut self, frames: u32) {
        for _ in 0..frames {
            self.frame += 1;
            if self.running && self.run_target.map_or(true, |target| self.control_tick < target) {
                self.control_tick += 1;
            }
        }
    }

    pub fn add_player(&mut self, client: ClientId) {
        self.players.insert(client);
    }

    pub fn deliver(&mut self, client: ClientId, tick: Tick) {
        self.delivered.insert(client, tick);
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn run_target(&self) -> Option<Tick> {
        self.run_target
    }

    pub fn mode(&self) -> ControlMode {
        self.mode
    }

    pub fn is_activated(&self, client: ClientId) -> bool {
        self.activated.contains(&client)
    }

    pub fn removed_clients(&self) -> &[ClientId] {
        &self.removed
    }

    pub fn sync_executions(&self) -> u32 {
        self.sync_executions
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Appends to the record, as executed control would
    pub fn write_record(&mut self, bytes: &[u8]) {
        self.record.extend_from_slice(bytes);
    }
}

impl ReplicationEngine for ImmediateControl {
    fn client_ready(&self, client: ClientId, tick: Tick) -> bool {
        self.delivered.get(&client).is_some_and(|&at| at >= tick)
    }

    fn ctrl_ready(&self, tick: Tick) -> bool {
        self.running && self.run_target.map_or(true, |target| tick < target)
    }

    fn ctrl_tick_reached(&self, tick: Tick) -> bool {
        self.control_tick >= tick
    }

    fn set_running(&mut self, running: bool, target: Option<Tick>) {
        self.running = running;
        self.run_target = if running { target } else { None };
    }

    fn exec_sync_control(&mut self) {
        self.sync_executions += 1;
    }

    fn set_ctrl_mode(&mut self, mode: ControlMode) {
        self.mode = mode;
    }

    fn control_tick(&self) -> Tick {
        self.control_tick
    }

    fn next_control_tick(&self) -> Tick {
        self.control_tick + 1
    }

    fn frame_counter(&self) -> u32 {
        self.frame
    }

    fn max_known_tick(&self) -> Tick {
        self.control_tick.saturating_add(self.lead)
    }

    fn has_players(&self, client: ClientId) -> bool {
        self.players.contains(&client)
    }

    fn set_client_activated(&mut self, client: ClientId, activated: bool) {
        if activated {
            self.activated.insert(client);
        } else {
            self.activated.remove(&client);
        }
    }

    fn client_removed(&mut self, client: ClientId) {
        self.players.remove(&client);
        self.activated.remove(&client);
        self.delivered.remove(&client);
        self.removed.push(client);
    }

    fn abort_game(&mut self) {
        self.aborted = true;
        self.running = false;
    }

    fn snapshot_state(&mut self) -> Vec<u8> {
        let header = SnapshotHeader {
            control_tick: self.control_tick,
            frame: self.frame,
            players: self.players.iter().copied().collect(),
        };
        bincode::serialize(&header).unwrap_or_default()
    }

    fn load_snapshot(&mut self, start_tick: Tick, snapshot: &[u8]) {
        match bincode::deserialize::<SnapshotHeader>(snapshot) {
            Ok(header) => {
                self.players = header.players.into_iter().collect();
                self.frame = self.frame.max(header.frame);
            }
            Err(e) => warn!("Snapshot header unreadable: {}", e),
        }
        self.control_tick = start_tick;
        self.running = false;
        self.run_target = None;
    }

    fn take_record_data(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.record)
    }
}
