use serde::{Deserialize, Serialize};
use std::fmt;

pub type ClientId = u32;
pub type Tick = u32;
pub type ResourceId = u32;
pub type ContentHash = [u8; 32];

pub const ENGINE_VERSION: u32 = 1;
pub const HOST_CLIENT_ID: ClientId = 0;
pub const FIRST_CLIENT_ID: ClientId = 1;
pub const MAX_CLIENT_NAME_LEN: usize = 30;
pub const COUNTDOWN_ABORTED: i32 = -1;
pub const RES_CHUNK_SIZE: usize = 1024;
pub const MAX_DATAGRAM_SIZE: usize = 2048;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GamePhase {
    #[default]
    None,
    Init,
    Lobby,
    Paused,
    Running,
}

impl GamePhase {
    /// Phases whose barrier is bound to a control tick
    pub fn is_ticked(self) -> bool {
        matches!(self, GamePhase::Running | GamePhase::Paused)
    }
}

impl fmt::Display for GamePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GamePhase::None => "none",
            GamePhase::Init => "init",
            GamePhase::Lobby => "lobby",
            GamePhase::Paused => "pause",
            GamePhase::Running => "go",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlMode {
    #[default]
    Central,
    Decentral,
    Async,
}

/// Phase announcement as carried by `Status`, `StatusAck` and `JoinData`
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusInfo {
    pub phase: GamePhase,
    pub ctrl_mode: ControlMode,
    pub target_tick: Tick,
}

impl StatusInfo {
    pub fn new(phase: GamePhase, ctrl_mode: ControlMode, target_tick: Tick) -> Self {
        Self {
            phase,
            ctrl_mode,
            target_tick,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ClientCore {
    /// Assigned by the host; a joiner must leave this unset
    pub id: Option<ClientId>,
    pub name: String,
    pub host: bool,
    pub observer: bool,
    pub activated: bool,
}

impl ClientCore {
    pub fn new(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            host: false,
            observer: false,
            activated: false,
        }
    }

    pub fn observer(name: &str) -> Self {
        Self {
            observer: true,
            ..Self::new(name)
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Scenario,
    Dynamic,
    Material,
    Definitions,
}

/// Identity of one distributable asset
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ResourceCore {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub file_name: String,
    pub size: u64,
    pub chunk_size: u32,
    pub chunk_count: u32,
    pub hash: Option<ContentHash>,
}

impl ResourceCore {
    pub fn is_hashed(&self) -> bool {
        self.hash.is_some()
    }

    /// Whether size, chunk size and chunk count agree
    pub fn has_valid_layout(&self) -> bool {
        if self.chunk_size == 0 {
            return self.size == 0 && self.chunk_count == 0;
        }
        self.size.div_ceil(u64::from(self.chunk_size)) == u64::from(self.chunk_count)
    }

    /// Exact length of chunk `index`; only the last chunk may be short
    pub fn chunk_len(&self, index: u32) -> Option<u64> {
        if index >= self.chunk_count {
            return None;
        }
        let chunk_size = u64::from(self.chunk_size);
        let offset = u64::from(index) * chunk_size;
        Some(self.size.saturating_sub(offset).min(chunk_size))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct GameParameters {
    pub title: String,
    pub resources: Vec<ResourceCore>,
    pub ranked: bool,
    pub league_address: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoteKind {
    Cancel,
    Kick,
    Pause,
}

impl fmt::Display for VoteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VoteKind::Cancel => "cancel",
            VoteKind::Kick => "kick",
            VoteKind::Pause => "pause",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ReadyCheckData {
    Request,
    NotReady,
    Ready,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    Conn {
        engine_version: u32,
        core: ClientCore,
        password: Option<String>,
    },
    ConnRe {
        ok: bool,
        wrong_password: bool,
        message: String,
    },
    JoinData {
        client_id: ClientId,
        status: StatusInfo,
        start_tick: Tick,
        parameters: GameParameters,
        dynamic: ResourceCore,
        clients: Vec<ClientCore>,
    },
    Status(StatusInfo),
    StatusAck(StatusInfo),
    ClientActivationRequest {
        tick: Tick,
    },
    ClientJoin {
        core: ClientCore,
    },
    ClientUpdate {
        client_id: ClientId,
        activated: bool,
    },
    ClientRemove {
        client_id: ClientId,
        reason: String,
    },
    ReadyCheck {
        client_id: ClientId,
        data: ReadyCheckData,
    },
    LobbyCountdown {
        seconds: i32,
    },
    Vote {
        kind: VoteKind,
        target: u32,
        approve: bool,
        from: ClientId,
    },
    VoteEnd {
        kind: VoteKind,
        target: u32,
        approved: bool,
    },
    ResRequest {
        res_id: ResourceId,
        from_chunk: u32,
    },
    ResChunk {
        res_id: ResourceId,
        index: u32,
        data: Vec<u8>,
    },
    LeagueRoundResults {
        success: bool,
        message: String,
    },
    Heartbeat,
    Disconnect,
}

impl Packet {
    /// Whether the packet must arrive exactly once and in order
    ///
    /// Status traffic is repeated by the barrier, chunks by the window
    /// re-request, heartbeats and the handshake by their own timers.
    pub fn is_reliable(&self) -> bool {
        !matches!(
            self,
            Packet::Conn { .. }
                | Packet::Status(_)
                | Packet::StatusAck(_)
                | Packet::ResRequest { .. }
                | Packet::ResChunk { .. }
                | Packet::Heartbeat
                | Packet::Disconnect
        )
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// What actually travels between two endpoints
#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Frame {
    Unreliable(Packet),
    Reliable { seq: u64, packet: Packet },
    Ack { seq: u64 },
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_resource() -> ResourceCore {
        ResourceCore {
            id: 3,
            kind: ResourceKind::Dynamic,
            file_name: "dynamic-3.bin".to_string(),
            size: 4096,
            chunk_size: 1024,
            chunk_count: 4,
            hash: Some([7u8; 32]),
        }
    }

    #[test]
    fn test_phase_ticked() {
        assert!(GamePhase::Running.is_ticked());
        assert!(GamePhase::Paused.is_ticked());
        assert!(!GamePhase::Lobby.is_ticked());
        assert!(!GamePhase::Init.is_ticked());
        assert_eq!(GamePhase::default(), GamePhase::None);
    }

    #[test]
    fn test_client_core_constructors() {
        let core = ClientCore::new("alice");
        assert_eq!(core.id, None);
        assert!(!core.observer);

        let watcher = ClientCore::observer("bob");
        assert!(watcher.observer);
        assert_eq!(watcher.name, "bob");
    }

    #[test]
    fn test_packet_serialization_join_data() {
        let packet = Packet::JoinData {
            client_id: 2,
            status: StatusInfo::new(GamePhase::Running, ControlMode::Decentral, 140),
            start_tick: 140,
            parameters: GameParameters {
                title: "Test".to_string(),
                resources: vec![test_resource()],
                ranked: true,
                league_address: None,
            },
            dynamic: test_resource(),
            clients: vec![ClientCore::new("host")],
        };

        let bytes = packet.encode().unwrap();
        match Packet::decode(&bytes).unwrap() {
            Packet::JoinData {
                client_id,
                status,
                parameters,
                dynamic,
                clients,
                ..
            } => {
                assert_eq!(client_id, 2);
                assert_eq!(status.phase, GamePhase::Running);
                assert_eq!(status.ctrl_mode, ControlMode::Decentral);
                assert_eq!(status.target_tick, 140);
                assert!(parameters.ranked);
                assert_eq!(dynamic, test_resource());
                assert_eq!(clients.len(), 1);
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_chunk_layout() {
        let mut core = test_resource();
        core.size = 2500;
        core.chunk_count = 3;
        assert!(core.has_valid_layout());
        assert_eq!(core.chunk_len(0), Some(1024));
        assert_eq!(core.chunk_len(2), Some(452));
        assert_eq!(core.chunk_len(3), None);

        core.chunk_count = 5;
        assert!(!core.has_valid_layout());
        core.chunk_size = 0;
        assert!(!core.has_valid_layout());
    }

    #[test]
    fn test_countdown_abort_sentinel() {
        let packet = Packet::LobbyCountdown {
            seconds: COUNTDOWN_ABORTED,
        };
        let bytes = packet.encode().unwrap();

        match Packet::decode(&bytes).unwrap() {
            Packet::LobbyCountdown { seconds } => assert!(seconds < 0),
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_full_chunk_fits_datagram() {
        let packet = Packet::ResChunk {
            res_id: u32::MAX,
            index: u32::MAX,
            data: vec![0xAB; RES_CHUNK_SIZE],
        };

        assert!(packet.encode().unwrap().len() <= MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn test_reliability_classes() {
        assert!(Packet::ClientUpdate {
            client_id: 1,
            activated: true
        }
        .is_reliable());
        assert!(Packet::VoteEnd {
            kind: VoteKind::Kick,
            target: 2,
            approved: false
        }
        .is_reliable());
        assert!(!Packet::Status(StatusInfo::default()).is_reliable());
        assert!(!Packet::Heartbeat.is_reliable());
    }

    #[test]
    fn test_reliable_chunk_frame_fits_datagram() {
        let frame = Frame::Reliable {
            seq: u64::MAX,
            packet: Packet::ResChunk {
                res_id: 1,
                index: 0,
                data: vec![0; RES_CHUNK_SIZE],
            },
        };

        assert!(frame.encode().unwrap().len() <= MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn test_malformed_packet_rejected() {
        assert!(Packet::decode(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]).is_err());
        assert!(Packet::decode(&[]).is_err());
    }
}
