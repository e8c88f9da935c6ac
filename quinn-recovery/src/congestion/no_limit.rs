use super::{default_initial_window, Controller, LostPacket};
use crate::Instant;

/// A congestion controller that never limits the amount of data in flight
///
/// Bytes in flight are still accounted for, so that they can be observed.
#[derive(Debug, Clone)]
pub struct NoLimit {
    bytes_in_flight: u64,
    max_datagram_size: u64,
}

impl NoLimit {
    /// Construct a state for a path whose max datagram size is `current_mtu`
    pub fn new(current_mtu: u16) -> Self {
        Self {
            bytes_in_flight: 0,
            max_datagram_size: u64::from(current_mtu),
        }
    }
}

impl Controller for NoLimit {
    fn on_sent(&mut self, _now: Instant, bytes: u64) {
        self.bytes_in_flight += bytes;
    }

    fn on_ack(&mut self, _now: Instant, _sent: Instant, bytes: u64) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
    }

    fn on_packets_lost(&mut self, _now: Instant, lost: &[LostPacket], _persistent: bool) {
        let bytes = lost.iter().map(|packet| packet.bytes).sum::<u64>();
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
    }

    fn on_discarded(&mut self, bytes: u64) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
    }

    fn on_mtu_update(&mut self, new_mtu: u16) {
        self.max_datagram_size = u64::from(new_mtu);
    }

    fn set_app_limited(&mut self, _app_limited: bool) {}

    fn window(&self) -> u64 {
        u64::MAX
    }

    fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    fn initial_window(&self) -> u64 {
        default_initial_window(self.max_datagram_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_limits() {
        let now = Instant::now();
        let mut cc = NoLimit::new(1200);
        cc.on_sent(now, 1_000_000);
        assert_eq!(cc.remaining_window(), u64::MAX - 1_000_000);
        cc.on_packets_lost(
            now,
            &[LostPacket {
                time_sent: now,
                bytes: 1_000_000,
                pmtu_probe: false,
            }],
            true,
        );
        assert_eq!(cc.bytes_in_flight(), 0);
        assert_eq!(cc.window(), u64::MAX);
    }
}
