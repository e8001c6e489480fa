//! Integration tests for the wire protocol and the UDP transport
//!
//! These tests validate real socket behavior and full sessions over
//! loopback UDP.

use session::coordinator::{JoinPoll, SessionCoordinator, SessionEvent};
use session::error::TransportError;
use session::network::UdpTransport;
use session::replication::{ImmediateControl, ReplicationEngine};
use session::transport::{Transport, TransportEvent};
use session::SessionConfig;
use shared::{
    ClientCore, ControlMode, Frame, GameParameters, GamePhase, Packet, ResourceCore,
    ResourceKind, StatusInfo, VoteKind, ENGINE_VERSION, MAX_DATAGRAM_SIZE, RES_CHUNK_SIZE,
};
use std::net::UdpSocket;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

type UdpPeer = SessionCoordinator<UdpTransport, ImmediateControl>;

async fn udp_peer(dir: &Path, name: &str, engine: ImmediateControl) -> UdpPeer {
    let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();
    let config = SessionConfig {
        title: "Loopback".to_string(),
        work_dir: dir.join(name),
        ..SessionConfig::default()
    };
    SessionCoordinator::new(config, ClientCore::new(name), transport, engine)
}

/// Pumps both peers until `done` holds or two seconds pass
async fn drive(host: &mut UdpPeer, client: &mut UdpPeer, done: impl Fn(&UdpPeer, &UdpPeer) -> bool) {
    for _ in 0..400 {
        let now = Instant::now();
        host.pump(now);
        client.pump(now);
        if done(&*host, &*client) {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("peers did not converge");
}

/// NETWORK PROTOCOL TESTS
mod protocol_tests {
    use super::*;

    /// Tests that join data survives a trip through a real UDP socket
    #[tokio::test]
    async fn join_data_over_udp_echo() {
        let server_socket = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind server socket");
        let server_addr = server_socket.local_addr().unwrap();

        // Echo server
        let server_socket_clone = server_socket.try_clone().unwrap();
        thread::spawn(move || {
            let mut buf = [0; MAX_DATAGRAM_SIZE];
            if let Ok((size, client_addr)) = server_socket_clone.recv_from(&mut buf) {
                let _ = server_socket_clone.send_to(&buf[..size], client_addr);
            }
        });

        sleep(Duration::from_millis(10)).await;

        let client_socket = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind client socket");
        client_socket
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();

        let mut host_core = ClientCore::new("host");
        host_core.id = Some(0);
        host_core.host = true;
        let packet = Packet::JoinData {
            client_id: 3,
            status: StatusInfo::new(GamePhase::Running, ControlMode::Central, 4242),
            start_tick: 4200,
            parameters: GameParameters {
                title: "Echo".to_string(),
                ..GameParameters::default()
            },
            dynamic: ResourceCore {
                id: 7,
                kind: ResourceKind::Dynamic,
                file_name: "7-dynamic.bin".to_string(),
                size: 3000,
                chunk_size: 1024,
                chunk_count: 3,
                hash: None,
            },
            clients: vec![host_core],
        };
        client_socket
            .send_to(&packet.encode().unwrap(), server_addr)
            .unwrap();

        let mut buf = [0; MAX_DATAGRAM_SIZE];
        let (size, _) = client_socket.recv_from(&mut buf).unwrap();
        match Packet::decode(&buf[..size]).unwrap() {
            Packet::JoinData {
                client_id,
                status,
                start_tick,
                parameters,
                dynamic,
                clients,
            } => {
                assert_eq!(client_id, 3);
                assert_eq!(status.target_tick, 4242);
                assert_eq!(status.phase, GamePhase::Running);
                assert_eq!(start_tick, 4200);
                assert_eq!(parameters.title, "Echo");
                assert_eq!(dynamic.chunk_count, 3);
                assert_eq!(clients.len(), 1);
                assert!(clients[0].host);
            }
            _ => panic!("Wrong packet type received"),
        }
    }

    /// A full resource chunk must fit in one datagram
    #[test]
    fn full_chunk_fits_datagram() {
        let packet = Packet::ResChunk {
            res_id: u32::MAX,
            index: u32::MAX,
            data: vec![0xAB; RES_CHUNK_SIZE],
        };
        let encoded = packet.encode().unwrap();
        assert!(encoded.len() <= MAX_DATAGRAM_SIZE);
    }

    /// Tests that truncated input is rejected instead of misread
    #[test]
    fn malformed_packet_rejected() {
        let encoded = Packet::ClientRemove {
            client_id: 2,
            reason: "kicked by vote".to_string(),
        }
        .encode()
        .unwrap();

        assert!(Packet::decode(&encoded[..encoded.len() - 3]).is_err());
        assert!(Packet::decode(&[0xFF, 0xFF, 0xFF, 0xFF]).is_err());
        assert!(Packet::decode(&[]).is_err());
    }
}

/// UDP TRANSPORT TESTS
mod transport_tests {
    use super::*;

    /// Garbage datagrams are dropped and the socket keeps working
    #[tokio::test]
    async fn garbage_does_not_break_listener() {
        let mut host = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        host.listen().unwrap();
        let host_addr = host.local_addr();

        let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
        raw.send_to(&[0xFF; 16], host_addr).unwrap();

        let mut client = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        client
            .connect(&host_addr.to_string(), &ClientCore::new("after-noise"), None)
            .unwrap();

        let mut accepted = None;
        for _ in 0..200 {
            if let Some(event) = host.poll_event() {
                accepted = Some(event);
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        match accepted {
            Some(TransportEvent::Received {
                packet: Packet::Conn { core, .. },
                ..
            }) => assert_eq!(core.name, "after-noise"),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(host.peer_count(), 1);
    }

    /// Reads frames from a raw socket until one matches
    async fn recv_frame_matching(
        socket: &tokio::net::UdpSocket,
        wanted: impl Fn(&Frame) -> bool,
    ) -> Frame {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
                .await
                .expect("no frame within two seconds")
                .unwrap();
            let frame: Frame = bincode::deserialize(&buf[..len]).unwrap();
            if wanted(&frame) {
                return frame;
            }
        }
    }

    /// A peer that never acknowledges gets the packet again
    #[tokio::test]
    async fn unacknowledged_packet_is_resent() {
        let mut host = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        host.listen().unwrap();
        let raw = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let hello = Frame::Unreliable(Packet::Conn {
            engine_version: ENGINE_VERSION,
            core: ClientCore::new("raw"),
            password: None,
        });
        raw.send_to(&bincode::serialize(&hello).unwrap(), host.local_addr())
            .await
            .unwrap();

        let mut conn = None;
        for _ in 0..200 {
            if let Some(TransportEvent::Received { conn: at, .. }) = host.poll_event() {
                conn = Some(at);
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        let conn = conn.expect("connection never arrived");

        let vote_end = Packet::VoteEnd {
            kind: VoteKind::Pause,
            target: 1,
            approved: true,
        };
        host.send(conn, &vote_end).unwrap();
        let is_vote_end = |frame: &Frame| {
            matches!(
                frame,
                Frame::Reliable {
                    seq: 0,
                    packet: Packet::VoteEnd { .. }
                }
            )
        };
        recv_frame_matching(&raw, is_vote_end).await;

        let start = Instant::now();
        host.maintain(start);
        host.maintain(start + Duration::from_secs(1));
        recv_frame_matching(&raw, is_vote_end).await;
        assert_eq!(host.unacked(conn), 1);

        let ack = bincode::serialize(&Frame::Ack { seq: 0 }).unwrap();
        raw.send_to(&ack, host.local_addr()).await.unwrap();
        for _ in 0..200 {
            host.poll_event();
            if host.unacked(conn) == 0 {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(host.unacked(conn), 0);
    }

    /// Packets beyond the datagram limit are refused at the sender
    #[tokio::test]
    async fn oversized_packet_refused() {
        let host = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let mut client = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let conn = client
            .connect(&host.local_addr().to_string(), &ClientCore::new("big"), None)
            .unwrap();

        let result = client.send(
            conn,
            &Packet::ResChunk {
                res_id: 1,
                index: 0,
                data: vec![0; MAX_DATAGRAM_SIZE * 2],
            },
        );
        assert!(matches!(result, Err(TransportError::Oversized(_))));
    }
}

/// FULL SESSIONS OVER LOOPBACK
mod session_tests {
    use super::*;

    /// Tests a client joining a hosted lobby over real sockets
    #[tokio::test]
    async fn join_lobby_over_udp() {
        let dir = TempDir::new().unwrap();
        let mut host = udp_peer(dir.path(), "host", ImmediateControl::at_tick(10)).await;
        host.host_session(true, Instant::now()).unwrap();
        let host_addr = host.transport().local_addr().to_string();

        let mut client = udp_peer(dir.path(), "client", ImmediateControl::new()).await;
        client
            .join_session(&[host_addr], None, Instant::now())
            .unwrap();

        let mut joined = None;
        for _ in 0..400 {
            let now = Instant::now();
            host.pump(now);
            match client.poll_join(now) {
                JoinPoll::Pending => {}
                JoinPoll::Joined(outcome) => {
                    joined = Some(outcome);
                    break;
                }
                other => panic!("join failed: {:?}", other),
            }
            sleep(Duration::from_millis(5)).await;
        }
        let outcome = joined.expect("client never joined");
        assert_eq!(outcome.client_id, 1);
        assert_eq!(outcome.start_tick, 10);

        drive(&mut host, &mut client, |host, client| {
            client.is_game_loaded()
                && client.status().is_acknowledged()
                && host
                    .registry()
                    .find_by_id(1)
                    .is_some_and(|record| record.is_ready())
        })
        .await;
        assert_eq!(client.engine().control_tick(), 10);
        assert_eq!(client.status().phase(), GamePhase::Lobby);
    }

    /// Tests that a leaving client is removed on the host
    #[tokio::test]
    async fn leave_over_udp() {
        let dir = TempDir::new().unwrap();
        let mut host = udp_peer(dir.path(), "host", ImmediateControl::new()).await;
        host.host_session(true, Instant::now()).unwrap();
        let host_addr = host.transport().local_addr().to_string();

        let mut client = udp_peer(dir.path(), "client", ImmediateControl::new()).await;
        client
            .join_session(&[host_addr], None, Instant::now())
            .unwrap();
        let mut joined = false;
        for _ in 0..400 {
            let now = Instant::now();
            host.pump(now);
            if let JoinPoll::Joined(_) = client.poll_join(now) {
                joined = true;
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert!(joined);
        drive(&mut host, &mut client, |_, client| client.is_game_loaded()).await;
        host.drain_events();

        client.leave();
        drive(&mut host, &mut client, |host, _| {
            host.registry()
                .find_by_id(1)
                .is_some_and(|record| record.is_removed())
        })
        .await;
        assert!(host
            .drain_events()
            .iter()
            .any(|e| matches!(e, SessionEvent::ClientRemoved { id: 1, .. })));
        assert_eq!(host.transport().peer_count(), 0);
    }
}
