//! Counters describing the behavior of the recovery logic

use crate::Duration;

/// Statistics about the network path
#[derive(Default, Debug, Copy, Clone)]
#[non_exhaustive]
pub struct PathStats {
    /// Current best estimate of this path's latency (round-trip-time)
    pub rtt: Duration,
    /// Current congestion window of the connection
    pub cwnd: u64,
    /// Congestion events on the connection
    pub congestion_events: u64,
    /// Persistent congestion events on the connection
    pub persistent_congestion_events: u64,
    /// The amount of packets lost on this path
    pub lost_packets: u64,
    /// The amount of bytes lost on this path
    pub lost_bytes: u64,
    /// The amount of packets sent on this path
    pub sent_packets: u64,
    /// Probe timeouts that fired
    pub pto_count: u64,
    /// Current UDP payload size limit
    pub current_mtu: u16,
}

/// Statistics about path MTU discovery
#[derive(Default, Debug, Copy, Clone)]
#[non_exhaustive]
pub struct MtudStats {
    /// PMTU probes sent, retransmissions included
    pub probes_sent: u64,
    /// PMTU probes acknowledged
    pub probes_acked: u64,
    /// PMTU probes declared lost
    pub probes_lost: u64,
    /// Times the validator found the confirmed PMTU no longer usable
    pub invalidations: u64,
    /// Packet too big messages that lowered the PMTU ceiling
    pub packet_too_big: u64,
}

/// Statistics of a [`crate::Recovery`] instance
#[derive(Debug, Default, Copy, Clone)]
#[non_exhaustive]
pub struct RecoveryStats {
    /// Statistics about the network path
    pub path: PathStats,
    /// Statistics about path MTU discovery
    pub mtud: MtudStats,
    /// ACK frames built for the peer
    pub acks_sent: u64,
    /// ACK frames received from the peer
    pub acks_received: u64,
}
