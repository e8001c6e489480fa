//! Error types for session construction and the collaborator seams

use crate::transport::ConnHandle;
use shared::{ClientId, ResourceId};
use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors that abort hosting or joining a session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a session is already active")]
    AlreadyActive,
    #[error("no session is active")]
    NotActive,
    #[error("only the host may {0}")]
    NotHost(&'static str),
    #[error("no host address given")]
    NoAddress,
    #[error("connection to the host lost")]
    ConnectionLost,
    #[error("join timed out")]
    JoinTimeout,
    #[error("unexpected join data: {0}")]
    BadJoinData(String),
    #[error("join rejected: {0}")]
    JoinRejected(#[from] JoinReject),
    #[error("league registration failed: {0}")]
    League(#[from] LeagueError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Reasons the host turns a joiner away
///
/// `WrongPassword` is kept apart from the rest so that the joiner can
/// re-prompt for credentials instead of giving up.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JoinReject {
    #[error("join denied")]
    JoiningDisallowed,
    #[error("join with set id not allowed (id {0})")]
    PresetId(ClientId),
    #[error("wrong password")]
    WrongPassword,
    #[error("engine version mismatch (got {0})")]
    VersionMismatch(u32),
    #[error("{0}")]
    Host(String),
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown resource {0}")]
    Unknown(ResourceId),
    #[error("resource {0} has no content hash")]
    NotHashed(ResourceId),
    #[error("content hash mismatch on resource {0}")]
    HashMismatch(ResourceId),
    #[error("chunk {index} out of range for resource {id}")]
    ChunkOutOfRange { id: ResourceId, index: u32 },
    #[error("chunk {index} of resource {id} has {len} bytes, expected {expected}")]
    ChunkLength {
        id: ResourceId,
        index: u32,
        len: usize,
        expected: u64,
    },
    #[error("resource {0} has an inconsistent chunk layout")]
    BadLayout(ResourceId),
    #[error("resource {0} is not present locally")]
    NotPresent(ResourceId),
}

impl ResourceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ResourceError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown connection {0:?}")]
    UnknownConnection(ConnHandle),
    #[error("invalid address {0}")]
    InvalidAddress(String),
    #[error("transport is shut down")]
    Closed,
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("packet encoding failed: {0}")]
    Encode(#[from] bincode::Error),
    #[error("packet of {0} bytes does not fit a datagram")]
    Oversized(usize),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LeagueError {
    #[error("league client is busy")]
    Busy,
    #[error("league server rejected the request: {0}")]
    Rejected(String),
    #[error("league server unreachable: {0}")]
    Unreachable(String),
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream server rejected the block: {0}")]
    Rejected(String),
    #[error("stream server unreachable: {0}")]
    Unreachable(String),
    #[error("record already finished")]
    Finished,
    #[error("record compression failed: {0}")]
    Compression(#[from] std::io::Error),
}
