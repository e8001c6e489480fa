//! UDP transport driven by tokio tasks
//!
//! A receiver task reads datagrams and forwards decoded frames through a
//! channel; a sender task drains the outgoing queue. The coordinator-facing
//! side is synchronous and never awaits. Each peer carries a
//! `ReliableLink`, so packets the coordinator sends once survive loss.

use crate::error::TransportError;
use crate::reliable::ReliableLink;
use crate::transport::{ConnHandle, Transport, TransportEvent};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{ClientCore, Frame, Packet, ENGINE_VERSION, MAX_DATAGRAM_SIZE};
use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Silence after which a peer is considered gone
pub const PEER_TIMEOUT: Duration = Duration::from_secs(10);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Messages sent from the receiver task
#[derive(Debug)]
enum Inbound {
    Frame { frame: Frame, addr: SocketAddr },
}

/// Messages queued for the sender task
#[derive(Debug)]
enum Outbound {
    Datagram { data: Vec<u8>, addr: SocketAddr },
}

#[derive(Debug)]
struct Peer {
    addr: SocketAddr,
    last_seen: Instant,
    link: ReliableLink,
}

impl Peer {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            last_seen: Instant::now(),
            link: ReliableLink::default(),
        }
    }

    fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }
}

pub struct UdpTransport {
    local_addr: SocketAddr,
    listening: bool,
    peers: HashMap<ConnHandle, Peer>,
    by_addr: HashMap<SocketAddr, ConnHandle>,
    next_handle: u64,
    timeout: Duration,
    last_heartbeat: Option<Instant>,
    pending: VecDeque<TransportEvent>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
}

impl UdpTransport {
    /// Binds the socket and spawns the network tasks
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        info!("Socket bound to {}", local_addr);

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        spawn_receiver(Arc::clone(&socket), inbound_tx);
        spawn_sender(socket, outbound_rx);

        Ok(Self {
            local_addr,
            listening: false,
            peers: HashMap::new(),
            by_addr: HashMap::new(),
            next_handle: 0,
            timeout: PEER_TIMEOUT,
            last_heartbeat: None,
            pending: VecDeque::new(),
            inbound_rx,
            outbound_tx,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self, conn: ConnHandle) -> Option<SocketAddr> {
        self.peers.get(&conn).map(|peer| peer.addr)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Reliable packets on `conn` still waiting for their ack
    pub fn unacked(&self, conn: ConnHandle) -> usize {
        self.peers.get(&conn).map_or(0, |peer| peer.link.unacked())
    }

    fn open(&mut self, addr: SocketAddr) -> ConnHandle {
        self.next_handle += 1;
        let conn = ConnHandle(self.next_handle);
        self.peers.insert(conn, Peer::new(addr));
        self.by_addr.insert(addr, conn);
        conn
    }

    fn forget(&mut self, conn: ConnHandle) -> Option<Peer> {
        let peer = self.peers.remove(&conn)?;
        self.by_addr.remove(&peer.addr);
        Some(peer)
    }

    fn send_frame(&self, addr: SocketAddr, frame: &Frame) -> Result<(), TransportError> {
        let data = serialize(frame)?;
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::Oversized(data.len()));
        }
        self.outbound_tx
            .send(Outbound::Datagram { data, addr })
            .map_err(|_| TransportError::Closed)
    }

    /// Maps one datagram onto connection events
    fn accept(&mut self, frame: Frame, addr: SocketAddr) {
        let conn = match self.by_addr.get(&addr) {
            Some(conn) => *conn,
            None if self.listening && matches!(frame, Frame::Unreliable(Packet::Conn { .. })) => {
                let conn = self.open(addr);
                info!("New connection {:?} from {}", conn, addr);
                conn
            }
            None => {
                debug!("Dropping frame from unknown peer {}", addr);
                return;
            }
        };

        let Some(peer) = self.peers.get_mut(&conn) else {
            return;
        };
        peer.last_seen = Instant::now();
        let received = peer.link.incoming(frame);
        if let Some(ack) = received.ack {
            if let Err(e) = self.send_frame(addr, &ack) {
                warn!("Failed to acknowledge frame from {}: {}", addr, e);
            }
        }
        for packet in received.packets {
            match packet {
                Packet::Heartbeat => {}
                Packet::Disconnect => {
                    self.forget(conn);
                    info!("Peer {} disconnected", addr);
                    self.pending.push_back(TransportEvent::Closed { conn });
                    return;
                }
                packet => self.pending.push_back(TransportEvent::Received { conn, packet }),
            }
        }
    }
}

impl Transport for UdpTransport {
    fn listen(&mut self) -> Result<(), TransportError> {
        self.listening = true;
        info!("Accepting connections on {}", self.local_addr);
        Ok(())
    }

    fn connect(
        &mut self,
        addr: &str,
        core: &ClientCore,
        password: Option<&str>,
    ) -> Result<ConnHandle, TransportError> {
        let target = addr
            .to_socket_addrs()
            .map_err(|_| TransportError::InvalidAddress(addr.to_string()))?
            .next()
            .ok_or_else(|| TransportError::InvalidAddress(addr.to_string()))?;

        if let Some(old) = self.by_addr.get(&target).copied() {
            self.forget(old);
        }
        let conn = self.open(target);
        self.send_frame(
            target,
            &Frame::Unreliable(Packet::Conn {
                engine_version: ENGINE_VERSION,
                core: core.clone(),
                password: password.map(str::to_string),
            }),
        )?;
        debug!("Connecting to {} as {:?}", target, conn);
        Ok(conn)
    }

    fn send(&mut self, conn: ConnHandle, packet: &Packet) -> Result<(), TransportError> {
        let peer = self
            .peers
            .get(&conn)
            .ok_or(TransportError::UnknownConnection(conn))?;
        let (addr, frame) = (peer.addr, peer.link.frame(packet));
        self.send_frame(addr, &frame)?;
        if let Some(peer) = self.peers.get_mut(&conn) {
            peer.link.commit(&frame);
        }
        Ok(())
    }

    fn close(&mut self, conn: ConnHandle) {
        if let Some(peer) = self.forget(conn) {
            if let Err(e) = self.send_frame(peer.addr, &Frame::Unreliable(Packet::Disconnect)) {
                warn!("Failed to send disconnect to {}: {}", peer.addr, e);
            }
        }
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        while self.pending.is_empty() {
            let Ok(Inbound::Frame { frame, addr }) = self.inbound_rx.try_recv() else {
                break;
            };
            self.accept(frame, addr);
        }
        self.pending.pop_front()
    }

    fn maintain(&mut self, now: Instant) {
        let timed_out: Vec<ConnHandle> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.is_timed_out(now, self.timeout))
            .map(|(conn, _)| *conn)
            .collect();
        for conn in timed_out {
            if let Some(peer) = self.forget(conn) {
                warn!("Peer {} timed out", peer.addr);
                self.pending.push_back(TransportEvent::Closed { conn });
            }
        }

        let mut resends = Vec::new();
        for peer in self.peers.values_mut() {
            let addr = peer.addr;
            resends.extend(peer.link.due_resends(now).into_iter().map(|frame| (addr, frame)));
        }
        for (addr, frame) in resends {
            if let Err(e) = self.send_frame(addr, &frame) {
                warn!("Resend to {} failed: {}", addr, e);
            }
        }

        let due = self
            .last_heartbeat
            .map_or(true, |last| now.saturating_duration_since(last) >= HEARTBEAT_INTERVAL);
        if due {
            self.last_heartbeat = Some(now);
            for peer in self.peers.values() {
                if let Err(e) = self.send_frame(peer.addr, &Frame::Unreliable(Packet::Heartbeat)) {
                    warn!("Heartbeat to {} failed: {}", peer.addr, e);
                }
            }
        }
    }
}

/// Spawns task that continuously listens for incoming packets
fn spawn_receiver(socket: Arc<UdpSocket>, tx: mpsc::UnboundedSender<Inbound>) {
    tokio::spawn(async move {
        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];

        loop {
            match socket.recv_from(&mut buffer).await {
                Ok((len, addr)) => match deserialize::<Frame>(&buffer[..len]) {
                    Ok(frame) => {
                        if tx.send(Inbound::Frame { frame, addr }).is_err() {
                            debug!("Transport dropped, receiver stopping");
                            break;
                        }
                    }
                    Err(_) => warn!("Failed to deserialize frame from {}", addr),
                },
                Err(e) => {
                    error!("Error receiving packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    });
}

/// Spawns task that processes the outgoing packet queue
fn spawn_sender(socket: Arc<UdpSocket>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    tokio::spawn(async move {
        while let Some(Outbound::Datagram { data, addr }) = rx.recv().await {
            if let Err(e) = socket.send_to(&data, addr).await {
                error!("Failed to send packet to {}: {}", addr, e);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_event(transport: &mut UdpTransport) -> TransportEvent {
        for _ in 0..200 {
            if let Some(event) = transport.poll_event() {
                return event;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no transport event within a second");
    }

    #[tokio::test]
    async fn test_unknown_peer_needs_listening_host() {
        let mut host = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let mut client = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let host_addr = host.local_addr().to_string();

        client
            .connect(&host_addr, &ClientCore::new("early"), None)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(host.poll_event().is_none());
        assert_eq!(host.peer_count(), 0);

        host.listen().unwrap();
        client
            .connect(&host_addr, &ClientCore::new("late"), None)
            .unwrap();
        match next_event(&mut host).await {
            TransportEvent::Received {
                packet: Packet::Conn { core, .. },
                ..
            } => assert_eq!(core.name, "late"),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(host.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let mut host = UdpTransport::bind("127.0.0.1:0")
            .await
            .unwrap()
            .with_timeout(Duration::from_secs(1));
        let mut client = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        host.listen().unwrap();
        client
            .connect(&host.local_addr().to_string(), &ClientCore::new("quiet"), None)
            .unwrap();
        let conn = match next_event(&mut host).await {
            TransportEvent::Received { conn, .. } => conn,
            other => panic!("unexpected event {:?}", other),
        };

        host.maintain(Instant::now() + Duration::from_secs(5));
        assert!(matches!(
            host.poll_event(),
            Some(TransportEvent::Closed { conn: closed }) if closed == conn
        ));
        assert!(host.send(conn, &Packet::Heartbeat).is_err());
    }

    #[tokio::test]
    async fn test_reliable_packet_is_acknowledged() {
        let mut host = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let mut client = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        host.listen().unwrap();
        client
            .connect(&host.local_addr().to_string(), &ClientCore::new("acked"), None)
            .unwrap();
        let conn = match next_event(&mut host).await {
            TransportEvent::Received { conn, .. } => conn,
            other => panic!("unexpected event {:?}", other),
        };

        host.send(
            conn,
            &Packet::ClientUpdate {
                client_id: 1,
                activated: true,
            },
        )
        .unwrap();
        assert_eq!(host.unacked(conn), 1);
        assert!(matches!(
            next_event(&mut client).await,
            TransportEvent::Received {
                packet: Packet::ClientUpdate { activated: true, .. },
                ..
            }
        ));

        for _ in 0..200 {
            host.poll_event();
            if host.unacked(conn) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(host.unacked(conn), 0);
    }

    #[test]
    fn test_invalid_address_rejected() {
        tokio_test::block_on(async {
            let mut client = UdpTransport::bind("127.0.0.1:0").await.unwrap();
            assert!(matches!(
                client.connect("not an address", &ClientCore::new("x"), None),
                Err(TransportError::InvalidAddress(_))
            ));
        });
    }
}
