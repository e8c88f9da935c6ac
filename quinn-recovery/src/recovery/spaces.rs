use std::collections::BTreeMap;

use super::pending_acks::PendingAcks;
use crate::{frame::Frame, mtud::PacketInfo, Instant, SpaceId};

/// Loss recovery state of one packet number space
#[derive(Debug, Clone)]
pub(crate) struct PacketSpace {
    /// Transmitted but not acked
    // We use a BTreeMap here so we can efficiently query by range on ACK and for loss detection
    pub(crate) sent_packets: BTreeMap<u64, SentPacket>,
    /// The largest packet number sent so far
    pub(crate) largest_sent: Option<u64>,
    /// The largest packet number the remote peer acknowledged in an ACK frame.
    pub(crate) largest_acked_packet: Option<u64>,
    /// The time the most recently sent ack-eliciting packet was sent.
    pub(crate) time_of_last_ack_eliciting_packet: Option<Instant>,
    /// The time at which the earliest sent packet in this space will be considered lost based on
    /// exceeding the reordering window in time. Only set for packets numbered prior to a packet
    /// that has been acknowledged.
    pub(crate) loss_time: Option<Instant>,
    /// Number of ack-eliciting packets in `sent_packets` that count towards bytes in flight
    pub(crate) ack_eliciting_in_flight: u64,
    /// Bytes in flight sent in this space
    pub(crate) in_flight: u64,
    /// Packet numbers to acknowledge
    pub(crate) pending_acks: PendingAcks,
    /// Whether the keys of this space were discarded
    pub(crate) discarded: bool,
}

impl PacketSpace {
    pub(crate) fn new(space: SpaceId, ack_eliciting_threshold: u32) -> Self {
        Self {
            sent_packets: BTreeMap::new(),
            largest_sent: None,
            largest_acked_packet: None,
            time_of_last_ack_eliciting_packet: None,
            loss_time: None,
            ack_eliciting_in_flight: 0,
            in_flight: 0,
            // Handshake packets are acknowledged without delay, RFC 9000 §13.2.1
            pending_acks: PendingAcks::new(ack_eliciting_threshold, space != SpaceId::Data),
            discarded: false,
        }
    }

    pub(crate) fn sent(&mut self, number: u64, packet: SentPacket) {
        if packet.in_flight {
            self.in_flight += u64::from(packet.size);
            if packet.ack_eliciting {
                self.ack_eliciting_in_flight += 1;
                self.time_of_last_ack_eliciting_packet = Some(packet.time_sent);
            }
        }
        self.largest_sent = Some(number);
        self.sent_packets.insert(number, packet);
    }

    /// Stop tracking a sent packet, returning it if it was tracked
    pub(crate) fn take(&mut self, number: u64) -> Option<SentPacket> {
        let packet = self.sent_packets.remove(&number)?;
        if packet.in_flight {
            self.in_flight -= u64::from(packet.size);
            if packet.ack_eliciting {
                self.ack_eliciting_in_flight -= 1;
            }
        }
        Some(packet)
    }

    /// Whether any ack-eliciting packets are in flight
    pub(crate) fn has_ack_eliciting_in_flight(&self) -> bool {
        self.ack_eliciting_in_flight != 0
    }

    /// The oldest unacknowledged ack-eliciting packet
    pub(crate) fn oldest_ack_eliciting(&self) -> Option<(u64, &SentPacket)> {
        self.sent_packets
            .iter()
            .find(|(_, packet)| packet.ack_eliciting)
            .map(|(&number, packet)| (number, packet))
    }
}

/// Represents one or more packets subject to retransmission
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SentPacket {
    /// The time the packet was sent.
    pub time_sent: Instant,
    /// The number of bytes sent in the packet, not including UDP or IP overhead, but including
    /// QUIC framing overhead
    pub size: u16,
    /// Whether an acknowledgement is expected directly in response to this packet.
    pub ack_eliciting: bool,
    /// Whether the packet counts towards bytes in flight
    pub in_flight: bool,
    /// Whether the packet is a PMTU probe, whose loss does not indicate congestion
    pub pmtu_probe: bool,
    /// Frames carried by the packet
    pub frames: Vec<Frame>,
}

impl SentPacket {
    /// Describe a packet carrying `frames`, sent at `time_sent`
    ///
    /// Packets are ack-eliciting if any frame is, and count towards bytes in flight if they are
    /// ack-eliciting or padded.
    pub fn new(time_sent: Instant, size: u16, frames: Vec<Frame>) -> Self {
        let ack_eliciting = frames.iter().any(Frame::is_ack_eliciting);
        Self {
            time_sent,
            size,
            ack_eliciting,
            in_flight: ack_eliciting || frames.contains(&Frame::Padding),
            pmtu_probe: false,
            frames,
        }
    }

    /// The largest packet number acknowledged by an ACK frame in this packet
    pub fn largest_acked(&self) -> Option<u64> {
        self.frames.iter().find_map(|frame| match *frame {
            Frame::Ack { largest } => Some(largest),
            _ => None,
        })
    }

    /// Frames that must be sent again if this packet is lost
    pub fn retransmittable_frames(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter().filter(|frame| frame.is_retransmittable())
    }

    pub(crate) fn info(&self) -> PacketInfo {
        PacketInfo {
            time_sent: self.time_sent,
            size: self.size,
            probe: self.pmtu_probe,
        }
    }
}
