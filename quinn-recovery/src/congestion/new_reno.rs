use std::sync::Arc;

use tracing::debug;

use super::{default_initial_window, Controller, ControllerMetrics, LostPacket};
use crate::Instant;

/// A simple, standard congestion controller
///
/// Slow start doubles the window every round trip until the first loss; afterwards the window
/// grows by one datagram per window's worth of acknowledged data and is halved on every loss
/// event. Losses of packets sent before the current recovery period started do not reduce the
/// window again.
#[derive(Debug, Clone)]
pub struct NewReno {
    config: Arc<NewRenoConfig>,
    max_datagram_size: u64,
    /// Maximum number of bytes in flight that may be sent
    window: u64,
    bytes_in_flight: u64,
    /// Slow start threshold in bytes. When the congestion window is below ssthresh, the mode is
    /// slow start and the window grows by the number of bytes acknowledged.
    ssthresh: u64,
    /// The time when QUIC first detects a loss, causing it to enter recovery. When a packet sent
    /// after this time is acknowledged, QUIC exits recovery.
    recovery_start_time: Option<Instant>,
    /// Bytes which had been acked by the peer since leaving slow start
    bytes_acked: u64,
    app_limited: bool,
    /// Whether a single packet may be sent regardless of the window, right after entering
    /// recovery
    send_one: bool,
}

impl NewReno {
    /// Construct a state using the given `config` and current time `now`
    pub fn new(config: Arc<NewRenoConfig>, _now: Instant, current_mtu: u16) -> Self {
        let max_datagram_size = u64::from(current_mtu);
        let window = config
            .initial_window
            .unwrap_or_else(|| default_initial_window(max_datagram_size));
        Self {
            config,
            max_datagram_size,
            window,
            bytes_in_flight: 0,
            ssthresh: u64::MAX,
            recovery_start_time: None,
            bytes_acked: 0,
            app_limited: false,
            send_one: false,
        }
    }

    fn minimum_window(&self) -> u64 {
        self.config
            .minimum_window
            .unwrap_or(2 * self.max_datagram_size)
    }

    /// Whether a packet sent at `sent` belongs to the current recovery period
    fn in_recovery(&self, sent: Instant) -> bool {
        self.recovery_start_time.is_some_and(|start| sent <= start)
    }
}

impl Controller for NewReno {
    fn on_sent(&mut self, _now: Instant, bytes: u64) {
        self.bytes_in_flight += bytes;
        self.send_one = false;
    }

    fn on_ack(&mut self, _now: Instant, sent: Instant, bytes: u64) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
        if self.bytes_in_flight == 0 {
            self.bytes_acked = 0;
        }

        if self.app_limited || self.in_recovery(sent) {
            return;
        }

        if self.window < self.ssthresh {
            // Slow start
            self.window += bytes;
        } else {
            // Congestion avoidance
            self.bytes_acked += bytes;
            if self.bytes_acked > self.window.saturating_sub(self.max_datagram_size) {
                self.bytes_acked = self.bytes_acked.saturating_sub(self.window);
                self.window += self.max_datagram_size;
            }
        }
    }

    fn on_packets_lost(&mut self, now: Instant, lost: &[LostPacket], persistent_congestion: bool) {
        let lost_bytes = lost.iter().map(|packet| packet.bytes).sum::<u64>();
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(lost_bytes);

        let Some(largest_sent) = lost
            .iter()
            .filter(|packet| !packet.pmtu_probe)
            .map(|packet| packet.time_sent)
            .max()
        else {
            return;
        };

        if !self.in_recovery(largest_sent) {
            self.recovery_start_time = Some(now);
            self.ssthresh = (self.window as f64 * self.config.loss_reduction_factor) as u64;
            self.window = self.ssthresh.max(self.minimum_window());
            self.bytes_acked = 0;
            self.send_one = true;
            debug!(window = self.window, ssthresh = self.ssthresh, "entering recovery");
        }

        if persistent_congestion {
            self.window = self.minimum_window();
            self.bytes_acked = 0;
            debug!(window = self.window, "persistent congestion, collapsing window");
        }
    }

    fn on_discarded(&mut self, bytes: u64) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
    }

    fn on_mtu_update(&mut self, new_mtu: u16) {
        self.max_datagram_size = u64::from(new_mtu);
        self.window = self.window.max(self.minimum_window());
    }

    fn set_app_limited(&mut self, app_limited: bool) {
        self.app_limited = app_limited;
    }

    fn window(&self) -> u64 {
        self.window
    }

    fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    fn remaining_window(&self) -> u64 {
        if self.send_one {
            return self.max_datagram_size;
        }
        self.window.saturating_sub(self.bytes_in_flight)
    }

    fn metrics(&self) -> ControllerMetrics {
        ControllerMetrics {
            congestion_window: self.window,
            bytes_in_flight: self.bytes_in_flight,
            ssthresh: Some(self.ssthresh),
        }
    }

    fn initial_window(&self) -> u64 {
        self.config
            .initial_window
            .unwrap_or_else(|| default_initial_window(self.max_datagram_size))
    }
}

/// Configuration for the `NewReno` congestion controller
#[derive(Debug, Clone)]
pub struct NewRenoConfig {
    initial_window: Option<u64>,
    minimum_window: Option<u64>,
    loss_reduction_factor: f64,
}

impl NewRenoConfig {
    /// Default limit on the amount of outstanding data in bytes.
    ///
    /// Recommended value: `min(10 * max_datagram_size, max(2 * max_datagram_size, 14720))`,
    /// which is what is used unless a value is set here.
    pub fn initial_window(&mut self, value: u64) -> &mut Self {
        self.initial_window = Some(value);
        self
    }

    /// Default minimum congestion window.
    ///
    /// Recommended value: `2 * max_datagram_size`, which follows the current PMTU unless a value
    /// is set here.
    pub fn minimum_window(&mut self, value: u64) -> &mut Self {
        self.minimum_window = Some(value);
        self
    }

    /// Reduction in congestion window when a new loss event is detected.
    pub fn loss_reduction_factor(&mut self, value: f64) -> &mut Self {
        self.loss_reduction_factor = value;
        self
    }
}

impl Default for NewRenoConfig {
    fn default() -> Self {
        Self {
            initial_window: None,
            minimum_window: None,
            loss_reduction_factor: 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn new_reno(now: Instant) -> NewReno {
        NewReno::new(Arc::new(NewRenoConfig::default()), now, 1200)
    }

    fn lost(time_sent: Instant, bytes: u64) -> LostPacket {
        LostPacket {
            time_sent,
            bytes,
            pmtu_probe: false,
        }
    }

    #[test]
    fn slow_start_grows_by_acked_bytes() {
        let now = Instant::now();
        let mut cc = new_reno(now);
        assert_eq!(cc.window(), 12_000);
        for _ in 0..10 {
            cc.on_sent(now, 1200);
        }
        assert_eq!(cc.bytes_in_flight(), 12_000);
        assert_eq!(cc.remaining_window(), 0);

        cc.on_ack(now + Duration::from_millis(50), now, 1200);
        assert_eq!(cc.bytes_in_flight(), 10_800);
        assert_eq!(cc.window(), 13_200);
    }

    #[test]
    fn loss_enters_recovery_once() {
        let start = Instant::now();
        let mut cc = new_reno(start);
        for _ in 0..4 {
            cc.on_sent(start, 1200);
        }
        let now = start + Duration::from_millis(100);
        cc.on_packets_lost(now, &[lost(start, 1200)], false);
        assert_eq!(cc.window(), 6000);
        assert_eq!(cc.metrics().ssthresh, Some(6000));
        assert_eq!(cc.bytes_in_flight(), 3600);
        // Exactly one datagram may be sent right away
        assert_eq!(cc.remaining_window(), 1200);
        cc.on_sent(now, 1200);
        assert_eq!(cc.remaining_window(), 6000 - 4800);

        // A second loss of a packet sent before recovery started changes nothing
        cc.on_packets_lost(now + Duration::from_millis(10), &[lost(start, 1200)], false);
        assert_eq!(cc.window(), 6000);
    }

    #[test]
    fn no_growth_for_packets_sent_before_recovery() {
        let start = Instant::now();
        let mut cc = new_reno(start);
        cc.window = 10_000;
        cc.ssthresh = 5_000;
        cc.recovery_start_time = Some(start + Duration::from_millis(100));
        cc.on_sent(start, 1200);
        cc.on_sent(start, 1200);

        cc.on_ack(start + Duration::from_millis(150), start, 1200);
        assert_eq!(cc.window(), 10_000);
        assert_eq!(cc.bytes_in_flight(), 1200);
    }

    #[test]
    fn congestion_avoidance_adds_one_datagram_per_window() {
        let start = Instant::now();
        let mut cc = new_reno(start);
        cc.window = 6000;
        cc.ssthresh = 6000;
        for _ in 0..6 {
            cc.on_sent(start, 1200);
        }
        let now = start + Duration::from_millis(10);
        // 4 acks bring the counter to 4800, which is not above 6000 - 1200
        for _ in 0..4 {
            cc.on_ack(now, start, 1200);
            assert_eq!(cc.window(), 6000);
        }
        cc.on_ack(now, start, 1200);
        assert_eq!(cc.window(), 7200);
    }

    #[test]
    fn persistent_congestion_collapses_window() {
        let start = Instant::now();
        let mut cc = new_reno(start);
        cc.on_sent(start, 1200);
        cc.on_packets_lost(start + Duration::from_secs(1), &[lost(start, 1200)], true);
        assert_eq!(cc.window(), 2400);
        assert_eq!(cc.bytes_in_flight(), 0);
    }

    #[test]
    fn lost_probe_is_not_congestion() {
        let start = Instant::now();
        let mut cc = new_reno(start);
        cc.on_sent(start, 1400);
        cc.on_packets_lost(
            start + Duration::from_millis(100),
            &[LostPacket {
                time_sent: start,
                bytes: 1400,
                pmtu_probe: true,
            }],
            false,
        );
        assert_eq!(cc.window(), 12_000);
        assert_eq!(cc.bytes_in_flight(), 0);
    }

    #[test]
    fn app_limited_does_not_grow() {
        let start = Instant::now();
        let mut cc = new_reno(start);
        cc.set_app_limited(true);
        cc.on_sent(start, 1200);
        cc.on_ack(start + Duration::from_millis(10), start, 1200);
        assert_eq!(cc.window(), 12_000);
    }

    #[test]
    fn large_window_is_halved_exactly() {
        let start = Instant::now();
        let mut cc = new_reno(start);
        cc.window = (1 << 30) + 3;
        cc.on_sent(start, 1200);
        cc.on_packets_lost(start + Duration::from_millis(100), &[lost(start, 1200)], false);
        assert_eq!(cc.metrics().ssthresh, Some((1 << 29) + 1));
        assert_eq!(cc.window(), (1 << 29) + 1);
    }

    #[test]
    fn mtu_update_raises_floor() {
        let start = Instant::now();
        let mut cc = new_reno(start);
        cc.on_sent(start, 1200);
        cc.on_packets_lost(start + Duration::from_secs(1), &[lost(start, 1200)], true);
        cc.on_mtu_update(1452);
        assert_eq!(cc.window(), 2904);
    }
}
