//! Transport seam between the coordinator and the wire
//!
//! The coordinator never touches sockets. It hands packets to a `Transport`
//! and drains `TransportEvent`s from it during its message pump.

use crate::error::TransportError;
use shared::{ClientCore, Packet};
use std::time::Instant;

/// Opaque connection identifier handed out by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnHandle(pub u64);

#[derive(Debug)]
pub enum TransportEvent {
    Received { conn: ConnHandle, packet: Packet },
    Closed { conn: ConnHandle },
}

pub trait Transport {
    /// Starts accepting inbound connections
    fn listen(&mut self) -> Result<(), TransportError>;

    /// Opens a connection and sends the `Conn` handshake on it
    fn connect(
        &mut self,
        addr: &str,
        core: &ClientCore,
        password: Option<&str>,
    ) -> Result<ConnHandle, TransportError>;

    fn send(&mut self, conn: ConnHandle, packet: &Packet) -> Result<(), TransportError>;

    fn close(&mut self, conn: ConnHandle);

    fn poll_event(&mut self) -> Option<TransportEvent>;

    /// Round trip estimate used for the activation lag bound
    fn ping_ms(&self, _conn: ConnHandle) -> Option<u32> {
        None
    }

    /// Periodic housekeeping such as heartbeats and timeouts
    fn maintain(&mut self, _now: Instant) {}
}
