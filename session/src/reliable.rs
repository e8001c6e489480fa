//! Ordered, acknowledged delivery on top of a lossy link
//!
//! Every transport keeps one `ReliableLink` per connection. Packets that
//! must arrive (`Packet::is_reliable`) are numbered and kept until the peer
//! acknowledges them; `due_resends` hands them out again once the resend
//! interval passed. The receiving side acknowledges every numbered frame,
//! drops duplicates and holds back frames that overtook a lost one, so the
//! coordinator sees each reliable packet exactly once and in send order.
//!
//! Timing is driven from the transport's `maintain`: a frame is stamped on
//! the first maintenance pass after it was sent and resent on every later
//! pass that finds the interval elapsed.

use log::{debug, trace};
use shared::{Frame, Packet};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

pub const RESEND_INTERVAL: Duration = Duration::from_millis(500);

/// Frames further ahead than this are not buffered and not acknowledged
pub const HOLDBACK_WINDOW: u64 = 256;

#[derive(Debug)]
struct Unacked {
    frame: Frame,
    last_sent: Option<Instant>,
}

/// What one incoming frame produced
#[derive(Debug, Default)]
pub struct Received {
    /// Acknowledgement to send back on the same connection
    pub ack: Option<Frame>,
    /// Packets now deliverable, in order
    pub packets: Vec<Packet>,
}

#[derive(Debug)]
pub struct ReliableLink {
    resend_interval: Duration,
    next_seq: u64,
    unacked: BTreeMap<u64, Unacked>,
    next_expected: u64,
    holdback: BTreeMap<u64, Packet>,
    resent: u64,
}

impl Default for ReliableLink {
    fn default() -> Self {
        Self::new(RESEND_INTERVAL)
    }
}

impl ReliableLink {
    pub fn new(resend_interval: Duration) -> Self {
        Self {
            resend_interval,
            next_seq: 0,
            unacked: BTreeMap::new(),
            next_expected: 0,
            holdback: BTreeMap::new(),
            resent: 0,
        }
    }

    /// Frames `packet` without committing to send it
    ///
    /// Callers that can still fail (size checks) pass the frame to
    /// `commit` only once it is on its way, so no sequence number is lost.
    pub fn frame(&self, packet: &Packet) -> Frame {
        if packet.is_reliable() {
            Frame::Reliable {
                seq: self.next_seq,
                packet: packet.clone(),
            }
        } else {
            Frame::Unreliable(packet.clone())
        }
    }

    /// Records a frame handed to the wire
    pub fn commit(&mut self, frame: &Frame) {
        if let Frame::Reliable { seq, .. } = frame {
            self.next_seq = seq + 1;
            self.unacked.insert(
                *seq,
                Unacked {
                    frame: frame.clone(),
                    last_sent: None,
                },
            );
        }
    }

    /// Frames and commits in one step
    pub fn outgoing(&mut self, packet: &Packet) -> Frame {
        let frame = self.frame(packet);
        self.commit(&frame);
        frame
    }

    pub fn incoming(&mut self, frame: Frame) -> Received {
        match frame {
            Frame::Unreliable(packet) => {
                // A connection request starts both streams over
                if matches!(packet, Packet::Conn { .. }) {
                    self.restart();
                }
                Received {
                    ack: None,
                    packets: vec![packet],
                }
            }
            Frame::Ack { seq } => {
                if self.unacked.remove(&seq).is_some() {
                    trace!("Frame {} acknowledged", seq);
                }
                Received::default()
            }
            Frame::Reliable { seq, packet } => self.receive_numbered(seq, packet),
        }
    }

    fn receive_numbered(&mut self, seq: u64, packet: Packet) -> Received {
        if seq >= self.next_expected.saturating_add(HOLDBACK_WINDOW) {
            debug!("Frame {} too far ahead of {}", seq, self.next_expected);
            return Received::default();
        }
        let ack = Some(Frame::Ack { seq });
        if seq < self.next_expected {
            trace!("Duplicate frame {}", seq);
            return Received {
                ack,
                packets: Vec::new(),
            };
        }

        self.holdback.insert(seq, packet);
        let mut packets = Vec::new();
        while let Some(packet) = self.holdback.remove(&self.next_expected) {
            packets.push(packet);
            self.next_expected += 1;
        }
        if packets.is_empty() {
            debug!("Holding frame {} until {} arrives", seq, self.next_expected);
        }
        Received { ack, packets }
    }

    /// Frames whose acknowledgement is overdue
    pub fn due_resends(&mut self, now: Instant) -> Vec<Frame> {
        let mut due = Vec::new();
        for pending in self.unacked.values_mut() {
            match pending.last_sent {
                None => pending.last_sent = Some(now),
                Some(at) if now.saturating_duration_since(at) >= self.resend_interval => {
                    pending.last_sent = Some(now);
                    due.push(pending.frame.clone());
                }
                Some(_) => {}
            }
        }
        self.resent += due.len() as u64;
        due
    }

    /// Forgets both directions, as for a brand new connection
    pub fn restart(&mut self) {
        self.next_seq = 0;
        self.unacked.clear();
        self.next_expected = 0;
        self.holdback.clear();
    }

    pub fn unacked(&self) -> usize {
        self.unacked.len()
    }

    /// Total number of frames sent again
    pub fn resent(&self) -> u64 {
        self.resent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::VoteKind;

    fn vote_end(target: u32) -> Packet {
        Packet::VoteEnd {
            kind: VoteKind::Kick,
            target,
            approved: false,
        }
    }

    fn targets(packets: &[Packet]) -> Vec<u32> {
        packets
            .iter()
            .filter_map(|p| match p {
                Packet::VoteEnd { target, .. } => Some(*target),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_unreliable_passes_straight_through() {
        let mut sender = ReliableLink::default();
        let mut receiver = ReliableLink::default();

        let frame = sender.outgoing(&Packet::Heartbeat);
        assert!(matches!(frame, Frame::Unreliable(Packet::Heartbeat)));
        assert_eq!(sender.unacked(), 0);

        let received = receiver.incoming(frame);
        assert!(received.ack.is_none());
        assert_eq!(received.packets.len(), 1);
    }

    #[test]
    fn test_lost_frame_is_resent_and_reordered() {
        let start = Instant::now();
        let mut sender = ReliableLink::default();
        let mut receiver = ReliableLink::default();

        let _lost = sender.outgoing(&vote_end(1));
        let second = sender.outgoing(&vote_end(2));

        let held = receiver.incoming(second);
        assert!(matches!(held.ack, Some(Frame::Ack { seq: 1 })));
        assert!(held.packets.is_empty());

        // Stamped on the first pass, resent once the interval is over
        assert!(sender.due_resends(start).is_empty());
        assert!(sender.due_resends(start + Duration::from_millis(100)).is_empty());
        let resends = sender.due_resends(start + RESEND_INTERVAL);
        assert_eq!(resends.len(), 2);

        let mut delivered = Vec::new();
        for frame in resends {
            let received = receiver.incoming(frame);
            if let Some(ack) = received.ack {
                sender.incoming(ack);
            }
            delivered.extend(received.packets);
        }
        assert_eq!(targets(&delivered), vec![1, 2]);
        assert_eq!(sender.unacked(), 0);
        assert_eq!(sender.resent(), 2);
    }

    #[test]
    fn test_duplicates_are_acked_but_not_delivered() {
        let mut sender = ReliableLink::default();
        let mut receiver = ReliableLink::default();
        let frame = sender.outgoing(&vote_end(7));

        assert_eq!(receiver.incoming(frame.clone()).packets.len(), 1);
        let again = receiver.incoming(frame);
        assert!(again.packets.is_empty());
        assert!(matches!(again.ack, Some(Frame::Ack { seq: 0 })));
    }

    #[test]
    fn test_frame_without_commit_keeps_sequence() {
        let mut link = ReliableLink::default();
        let first = link.frame(&vote_end(1));
        let retry = link.frame(&vote_end(1));
        assert!(matches!(first, Frame::Reliable { seq: 0, .. }));
        assert!(matches!(retry, Frame::Reliable { seq: 0, .. }));

        link.commit(&retry);
        assert!(matches!(link.frame(&vote_end(2)), Frame::Reliable { seq: 1, .. }));
    }

    #[test]
    fn test_far_ahead_frame_is_ignored() {
        let mut receiver = ReliableLink::default();
        let received = receiver.incoming(Frame::Reliable {
            seq: HOLDBACK_WINDOW + 5,
            packet: vote_end(1),
        });
        assert!(received.ack.is_none());
        assert!(received.packets.is_empty());
    }

    #[test]
    fn test_connection_request_restarts_streams() {
        let mut host_side = ReliableLink::default();
        host_side.outgoing(&vote_end(1));
        host_side.incoming(Frame::Reliable {
            seq: 0,
            packet: vote_end(9),
        });

        host_side.incoming(Frame::Unreliable(Packet::Conn {
            engine_version: shared::ENGINE_VERSION,
            core: shared::ClientCore::new("again"),
            password: None,
        }));
        assert_eq!(host_side.unacked(), 0);
        let fresh = host_side.incoming(Frame::Reliable {
            seq: 0,
            packet: vote_end(3),
        });
        assert_eq!(targets(&fresh.packets), vec![3]);
    }
}
