//! Game phase state and the acknowledgement barrier flags
//!
//! Only the host announces phases. Every peer then tracks whether it has
//! locally arrived at the announced target tick (`reached`) and whether the
//! barrier is globally satisfied (`acknowledged`). An acknowledged status is
//! always reached; `acknowledge` refuses otherwise.

use shared::{ControlMode, GamePhase, StatusInfo, Tick};
use std::time::Instant;

#[derive(Debug, Clone, Default)]
pub struct SessionStatus {
    info: StatusInfo,
    reached: bool,
    acknowledged: bool,
}

impl SessionStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&self) -> StatusInfo {
        self.info
    }

    pub fn phase(&self) -> GamePhase {
        self.info.phase
    }

    pub fn ctrl_mode(&self) -> ControlMode {
        self.info.ctrl_mode
    }

    pub fn target_tick(&self) -> Tick {
        self.info.target_tick
    }

    pub fn is_reached(&self) -> bool {
        self.reached
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    /// Adopts a new announcement and clears both barrier flags
    pub fn announce(&mut self, info: StatusInfo) {
        self.info = info;
        self.reached = false;
        self.acknowledged = false;
    }

    /// Moves the target without touching the barrier flags
    pub fn set_target_tick(&mut self, tick: Tick) {
        self.info.target_tick = tick;
    }

    pub fn mark_reached(&mut self) {
        self.reached = true;
    }

    /// Returns false when the status has not been reached yet
    pub fn acknowledge(&mut self) -> bool {
        if !self.reached {
            return false;
        }
        self.acknowledged = true;
        true
    }

    /// True if an incoming status announcement refers to this phase
    pub fn same_phase(&self, info: &StatusInfo) -> bool {
        self.info.phase == info.phase
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Counters kept by the host while a barrier is outstanding
///
/// The host never gives up on a barrier; these numbers are what an operator
/// looks at when one does not converge.
#[derive(Debug, Clone, Default)]
pub struct BarrierDiagnostics {
    pub announcements: u32,
    pub acks_accepted: u32,
    pub acks_ignored: u32,
    pub tick_adoptions: u32,
    pub clamped_acks: u32,
    pub resends: u32,
    pub pending_since: Option<Instant>,
}

impl BarrierDiagnostics {
    pub(crate) fn on_announce(&mut self, now: Instant) {
        self.announcements += 1;
        self.pending_since = Some(now);
    }

    pub(crate) fn on_acknowledged(&mut self) {
        self.pending_since = None;
    }
}
