use std::collections::VecDeque;

use tracing::{debug, trace};

use super::PacketInfo;
use crate::{Duration, Instant, PmtuValidatorConfig};

/// Upper bound on the history kept by the validator
const MAX_ENTRIES: usize = 256;

/// Detects that the path stopped carrying packets of the confirmed PMTU
///
/// Losses of packets larger than the minimum PMTU are only suspicious if nothing at least as large,
/// sent at the same time or later, was acknowledged. Enough suspicious losses spread over a long
/// enough time invalidate the PMTU, as do repeated persistent congestion events during which no
/// packet larger than the minimum PMTU got through.
#[derive(Debug, Clone)]
pub(crate) struct PmtuValidator {
    config: PmtuValidatorConfig,
    min_mtu: u16,
    /// Acknowledged packets, ascending by send time and strictly descending by size
    ///
    /// An entry that is older and not larger than another one carries no information and is
    /// dropped.
    acked: VecDeque<Entry>,
    /// Suspicious losses, ascending by send time
    lost: VecDeque<Entry>,
    last_invalidation: Option<Instant>,
}

impl PmtuValidator {
    pub(crate) fn new(config: PmtuValidatorConfig, min_mtu: u16) -> Self {
        Self {
            config,
            min_mtu,
            acked: VecDeque::new(),
            lost: VecDeque::new(),
            last_invalidation: None,
        }
    }

    pub(crate) fn on_packets_acked(&mut self, packets: &[PacketInfo]) {
        for packet in packets {
            let entry = Entry::from(packet);
            self.lost.retain(|lost| !entry.covers(lost));

            if self.acked_since(entry.time_sent) >= Some(entry.size) {
                continue;
            }
            self.acked.retain(|acked| !entry.covers(acked));
            let index = self
                .acked
                .partition_point(|acked| acked.time_sent <= entry.time_sent);
            self.acked.insert(index, entry);
            if self.acked.len() > MAX_ENTRIES {
                self.acked.pop_front();
            }
        }
    }

    /// Returns an invalidation if the losses show the PMTU is no longer supported
    pub(crate) fn on_packets_lost(
        &mut self,
        now: Instant,
        packets: &[PacketInfo],
        smoothed_rtt: Duration,
    ) -> Option<Invalidation> {
        for packet in packets {
            if packet.probe
                || packet.size <= self.min_mtu
                || self.last_invalidation.is_some_and(|t| packet.time_sent <= t)
                || self.acked_since(packet.time_sent) >= Some(packet.size)
            {
                continue;
            }
            let entry = Entry::from(packet);
            let index = self
                .lost
                .partition_point(|lost| lost.time_sent <= entry.time_sent);
            self.lost.insert(index, entry);
            if self.lost.len() > MAX_ENTRIES {
                self.lost.pop_front();
            }
        }

        let (first, last) = (self.lost.front()?, self.lost.back()?);
        let span = last.time_sent.saturating_duration_since(first.time_sent);
        trace!(
            suspicious = self.lost.len(),
            ?span,
            "PMTU validator loss history"
        );
        if self.lost.len() < self.config.loss_threshold as usize
            || span <= self.config.time_threshold.get(smoothed_rtt)
        {
            return None;
        }

        let floor = self.acked_since(first.time_sent);
        debug!(?floor, losses = self.lost.len(), "PMTU invalidated by losses");
        Some(self.invalidate(now, floor))
    }

    /// Returns an invalidation if `count` consecutive persistent congestion events, the current
    /// one starting with a packet sent at `first_time_sent`, went by without any packet larger
    /// than the minimum PMTU getting through
    pub(crate) fn on_persistent_congestion(
        &mut self,
        now: Instant,
        first_time_sent: Instant,
        count: u32,
    ) -> Option<Invalidation> {
        if count < self.config.persistent_congestion_threshold
            || self
                .last_invalidation
                .is_some_and(|t| first_time_sent <= t)
            || self
                .acked_since(first_time_sent)
                .is_some_and(|size| size > self.min_mtu)
        {
            return None;
        }
        debug!(count, "PMTU invalidated by persistent congestion");
        Some(self.invalidate(now, None))
    }

    /// Largest acknowledged size among packets sent at or after `time`
    fn acked_since(&self, time: Instant) -> Option<u16> {
        // Sizes descend with time, so the first match is the largest
        self.acked
            .iter()
            .find(|acked| acked.time_sent >= time)
            .map(|acked| acked.size)
    }

    fn invalidate(&mut self, now: Instant, floor: Option<u16>) -> Invalidation {
        self.last_invalidation = Some(now);
        self.acked.clear();
        self.lost.clear();
        Invalidation {
            floor: floor.filter(|&size| size > self.min_mtu),
        }
    }
}

/// Evidence that the path no longer supports the confirmed PMTU
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct Invalidation {
    /// Largest size still known to get through, if larger than the minimum PMTU
    pub(crate) floor: Option<u16>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Entry {
    time_sent: Instant,
    size: u16,
}

impl Entry {
    /// Whether an acknowledgement of `self` makes `other` irrelevant
    fn covers(&self, other: &Self) -> bool {
        other.time_sent <= self.time_sent && other.size <= self.size
    }
}

impl From<&PacketInfo> for Entry {
    fn from(packet: &PacketInfo) -> Self {
        Self {
            time_sent: packet.time_sent,
            size: packet.size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ValidatorTime;

    const RTT: Duration = Duration::from_millis(100);

    fn validator() -> PmtuValidator {
        PmtuValidator::new(PmtuValidatorConfig::default(), 1200)
    }

    fn packet(start: Instant, ms: u64, size: u16) -> PacketInfo {
        PacketInfo {
            time_sent: start + Duration::from_millis(ms),
            size,
            probe: false,
        }
    }

    #[test]
    fn spread_out_losses_invalidate() {
        let start = Instant::now();
        let now = start + Duration::from_secs(1);
        let mut validator = validator();
        validator.on_packets_acked(&[packet(start, 0, 1400)]);
        assert_eq!(
            validator.on_packets_lost(now, &[packet(start, 10, 1400), packet(start, 50, 1400)], RTT),
            None
        );
        // Three suspicious losses, but only 90ms apart
        assert_eq!(
            validator.on_packets_lost(now, &[packet(start, 100, 1400)], RTT),
            None
        );
        let invalidation = validator.on_packets_lost(now, &[packet(start, 150, 1400)], RTT);
        assert_eq!(invalidation, Some(Invalidation { floor: None }));
        assert!(validator.lost.is_empty());
    }

    #[test]
    fn later_ack_clears_suspicion() {
        let start = Instant::now();
        let now = start + Duration::from_secs(1);
        let mut validator = validator();
        validator.on_packets_lost(now, &[packet(start, 0, 1400), packet(start, 10, 1400)], RTT);
        assert_eq!(validator.lost.len(), 2);
        validator.on_packets_acked(&[packet(start, 20, 1400)]);
        assert!(validator.lost.is_empty());

        // Packets sent before an acknowledged packet of the same size are never suspicious
        validator.on_packets_lost(now, &[packet(start, 15, 1400), packet(start, 18, 1300)], RTT);
        assert!(validator.lost.is_empty());
    }

    #[test]
    fn small_packets_and_probes_are_ignored() {
        let start = Instant::now();
        let now = start + Duration::from_secs(1);
        let mut validator = validator();
        let mut probe = packet(start, 0, 1400);
        probe.probe = true;
        for ms in [0, 100, 200, 300] {
            validator.on_packets_lost(now, &[packet(start, ms, 1200)], RTT);
        }
        assert_eq!(validator.on_packets_lost(now, &[probe], RTT), None);
        assert!(validator.lost.is_empty());
    }

    #[test]
    fn floor_is_largest_ack_after_first_loss() {
        let start = Instant::now();
        let now = start + Duration::from_secs(1);
        let mut config = PmtuValidatorConfig::default();
        config.time_threshold(ValidatorTime::Fixed(Duration::from_millis(10)));
        let mut validator = PmtuValidator::new(config, 1200);
        validator.on_packets_acked(&[packet(start, 5, 1300), packet(start, 6, 1250)]);
        assert_eq!(validator.acked.len(), 2);
        let lost = [
            packet(start, 1, 1400),
            packet(start, 10, 1400),
            packet(start, 20, 1400),
        ];
        let invalidation = validator.on_packets_lost(now, &lost, RTT);
        assert_eq!(invalidation, Some(Invalidation { floor: Some(1300) }));

        // Losses from before the invalidation no longer count
        assert_eq!(validator.on_packets_lost(now, &lost, RTT), None);
        assert!(validator.lost.is_empty());
    }

    #[test]
    fn acked_history_stays_monotonic() {
        let start = Instant::now();
        let mut validator = validator();
        validator.on_packets_acked(&[
            packet(start, 0, 1300),
            packet(start, 1, 1400),
            packet(start, 2, 1250),
            packet(start, 1, 1200),
        ]);
        let sizes = validator.acked.iter().map(|e| e.size).collect::<Vec<_>>();
        assert_eq!(sizes, [1400, 1250]);
    }

    #[test]
    fn persistent_congestion_without_large_acks() {
        let start = Instant::now();
        let now = start + Duration::from_secs(5);
        let mut validator = validator();
        assert_eq!(validator.on_persistent_congestion(now, start, 1), None);

        validator.on_packets_acked(&[packet(start, 10, 1400)]);
        assert_eq!(validator.on_persistent_congestion(now, start, 2), None);

        let later = start + Duration::from_millis(20);
        assert_eq!(
            validator.on_persistent_congestion(now, later, 2),
            Some(Invalidation { floor: None })
        );
    }
}
