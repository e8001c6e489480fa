//! In-process transport for driving several peers from one thread
//!
//! All endpoints share one hub. Sends are delivered into the receiving
//! endpoint's inbox immediately and show up on its next `poll_event`.

use crate::error::TransportError;
use crate::reliable::ReliableLink;
use crate::transport::{ConnHandle, Transport, TransportEvent};
use log::debug;
use shared::{ClientCore, Frame, Packet, ENGINE_VERSION};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::time::Instant;

/// What sits in an endpoint's inbox
#[derive(Debug)]
enum Wire {
    Frame { conn: u64, frame: Frame },
    Closed { conn: u64 },
}

type PacketFilter = Box<dyn Fn(&Packet) -> bool>;

#[derive(Default)]
struct Hub {
    listeners: HashSet<String>,
    inboxes: HashMap<String, VecDeque<Wire>>,
    /// Local handle to (remote address, remote handle)
    links: HashMap<u64, (String, u64)>,
    owners: HashMap<u64, String>,
    next_handle: u64,
    /// One-shot losses per receiving address
    losses: HashMap<String, Vec<PacketFilter>>,
    dropped: usize,
}

impl Hub {
    fn allocate(&mut self, owner: &str) -> u64 {
        self.next_handle += 1;
        self.owners.insert(self.next_handle, owner.to_string());
        self.next_handle
    }

    fn push(&mut self, addr: &str, wire: Wire) {
        self.inboxes
            .entry(addr.to_string())
            .or_default()
            .push_back(wire);
    }

    /// Sends a frame across `handle`, unless a planned loss eats it
    fn transmit(&mut self, handle: u64, frame: Frame) -> Result<(), TransportError> {
        let (remote_addr, remote) = self
            .links
            .get(&handle)
            .cloned()
            .ok_or(TransportError::UnknownConnection(ConnHandle(handle)))?;
        let packet = match &frame {
            Frame::Unreliable(packet) | Frame::Reliable { packet, .. } => Some(packet),
            Frame::Ack { .. } => None,
        };
        if let (Some(packet), Some(filters)) = (packet, self.losses.get_mut(&remote_addr)) {
            if let Some(index) = filters.iter().position(|matches| matches(packet)) {
                filters.remove(index);
                self.dropped += 1;
                debug!("Dropping {:?} on its way to {}", packet, remote_addr);
                return Ok(());
            }
        }
        self.push(
            &remote_addr,
            Wire::Frame {
                conn: remote,
                frame,
            },
        );
        Ok(())
    }

    fn close(&mut self, handle: u64) {
        self.owners.remove(&handle);
        if let Some((remote_addr, remote)) = self.links.remove(&handle) {
            self.links.remove(&remote);
            self.owners.remove(&remote);
            self.push(&remote_addr, Wire::Closed { conn: remote });
        }
    }
}

/// Shared loopback network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Rc<RefCell<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the transport of the peer reachable under `addr`
    pub fn endpoint(&self, addr: &str) -> MemoryTransport {
        self.hub
            .borrow_mut()
            .inboxes
            .entry(addr.to_string())
            .or_default();
        MemoryTransport {
            addr: addr.to_string(),
            hub: Rc::clone(&self.hub),
            links: HashMap::new(),
            ready: VecDeque::new(),
        }
    }

    /// Drops every link of `addr` as if the peer crashed
    pub fn kill(&self, addr: &str) {
        let mut hub = self.hub.borrow_mut();
        let owned: Vec<u64> = hub
            .owners
            .iter()
            .filter(|(_, owner)| owner.as_str() == addr)
            .map(|(handle, _)| *handle)
            .collect();
        for handle in owned {
            hub.close(handle);
        }
        hub.listeners.remove(addr);
        if let Some(inbox) = hub.inboxes.get_mut(addr) {
            inbox.clear();
        }
    }

    /// Loses the next packet bound for `addr` that `filter` matches
    pub fn drop_next<F>(&self, addr: &str, filter: F)
    where
        F: Fn(&Packet) -> bool + 'static,
    {
        self.hub
            .borrow_mut()
            .losses
            .entry(addr.to_string())
            .or_default()
            .push(Box::new(filter));
    }

    /// Packets lost so far
    pub fn dropped(&self) -> usize {
        self.hub.borrow().dropped
    }

    /// Number of undelivered frames and closes across all endpoints
    pub fn pending(&self) -> usize {
        self.hub.borrow().inboxes.values().map(VecDeque::len).sum()
    }
}

pub struct MemoryTransport {
    addr: String,
    hub: Rc<RefCell<Hub>>,
    links: HashMap<ConnHandle, ReliableLink>,
    ready: VecDeque<TransportEvent>,
}

impl MemoryTransport {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Reliable packets on `conn` still waiting for their ack
    pub fn unacked(&self, conn: ConnHandle) -> usize {
        self.links.get(&conn).map_or(0, ReliableLink::unacked)
    }

    fn next_wire(&self) -> Option<Wire> {
        self.hub
            .borrow_mut()
            .inboxes
            .get_mut(&self.addr)
            .and_then(VecDeque::pop_front)
    }
}

impl Transport for MemoryTransport {
    fn listen(&mut self) -> Result<(), TransportError> {
        self.hub.borrow_mut().listeners.insert(self.addr.clone());
        Ok(())
    }

    fn connect(
        &mut self,
        addr: &str,
        core: &ClientCore,
        password: Option<&str>,
    ) -> Result<ConnHandle, TransportError> {
        let mut hub = self.hub.borrow_mut();
        let local = hub.allocate(&self.addr);
        if !hub.listeners.contains(addr) {
            debug!("{}: nobody listening on {}", self.addr, addr);
            hub.owners.remove(&local);
            hub.push(&self.addr, Wire::Closed { conn: local });
            return Ok(ConnHandle(local));
        }

        let remote = hub.allocate(addr);
        hub.links.insert(local, (addr.to_string(), remote));
        hub.links.insert(remote, (self.addr.clone(), local));
        self.links.insert(ConnHandle(local), ReliableLink::default());
        hub.transmit(
            local,
            Frame::Unreliable(Packet::Conn {
                engine_version: ENGINE_VERSION,
                core: core.clone(),
                password: password.map(str::to_string),
            }),
        )?;
        Ok(ConnHandle(local))
    }

    fn send(&mut self, conn: ConnHandle, packet: &Packet) -> Result<(), TransportError> {
        let mut hub = self.hub.borrow_mut();
        if !hub.links.contains_key(&conn.0) {
            return Err(TransportError::UnknownConnection(conn));
        }
        let frame = self.links.entry(conn).or_default().outgoing(packet);
        hub.transmit(conn.0, frame)
    }

    fn close(&mut self, conn: ConnHandle) {
        self.links.remove(&conn);
        self.hub.borrow_mut().close(conn.0);
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        while self.ready.is_empty() {
            match self.next_wire()? {
                Wire::Closed { conn } => {
                    self.links.remove(&ConnHandle(conn));
                    return Some(TransportEvent::Closed {
                        conn: ConnHandle(conn),
                    });
                }
                Wire::Frame { conn, frame } => {
                    let handle = ConnHandle(conn);
                    let received = self.links.entry(handle).or_default().incoming(frame);
                    if let Some(ack) = received.ack {
                        // The link may already be gone on our side
                        let _ = self.hub.borrow_mut().transmit(conn, ack);
                    }
                    self.ready.extend(
                        received
                            .packets
                            .into_iter()
                            .map(|packet| TransportEvent::Received { conn: handle, packet }),
                    );
                }
            }
        }
        self.ready.pop_front()
    }

    fn ping_ms(&self, _conn: ConnHandle) -> Option<u32> {
        Some(0)
    }

    fn maintain(&mut self, now: Instant) {
        let mut hub = self.hub.borrow_mut();
        for (conn, link) in self.links.iter_mut() {
            for frame in link.due_resends(now) {
                if hub.transmit(conn.0, frame).is_err() {
                    break;
                }
            }
        }
    }
}
