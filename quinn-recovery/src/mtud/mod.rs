use std::mem;

use tracing::{debug, trace};

use crate::{
    recovery::ConnectionError, stats::MtudStats, Duration, Instant, MtuDiscoveryConfig,
    PathProperties, RecoveryConfig,
};

mod candidates;
mod validator;

use candidates::{Bounds, Candidates};
use validator::{Invalidation, PmtuValidator};

/// Implements Datagram Packetization Layer Path Maximum Transmission Unit Discovery
///
/// See [`MtuDiscoveryConfig`] for details. The confirmed PMTU always stays within
/// `min_mtu..=max_mtu`.
#[derive(Debug, Clone)]
pub(crate) struct MtuDiscovery {
    /// Detected MTU for the path
    current_mtu: u16,
    /// The UDP payload size guaranteed to be supported by the network
    min_mtu: u16,
    /// Largest UDP payload size the path may support, lowered by packet too big messages
    max_mtu: u16,
    /// The state of the MTU discovery, if enabled
    state: Option<EnabledMtuDiscovery>,
    validator: Option<PmtuValidator>,
    stats: MtudStats,
}

impl MtuDiscovery {
    pub(crate) fn new(config: &RecoveryConfig, path: &PathProperties) -> Self {
        let min_mtu = config.min_mtu;
        let max_mtu = config.max_mtu(path);
        let state = config
            .mtu_discovery_config
            .clone()
            .map(|config| EnabledMtuDiscovery {
                phase: Phase::Base(Probe::new(min_mtu)),
                config,
            });
        Self {
            // With discovery enabled, nothing but the minimum is trusted until probes get through
            current_mtu: if state.is_some() { min_mtu } else { max_mtu },
            min_mtu,
            max_mtu,
            state,
            validator: config
                .pmtu_validator_config
                .clone()
                .map(|config| PmtuValidator::new(config, min_mtu)),
            stats: MtudStats::default(),
        }
    }

    /// Returns the current MTU
    pub(crate) fn current_mtu(&self) -> u16 {
        self.current_mtu
    }

    pub(crate) fn min_mtu(&self) -> u16 {
        self.min_mtu
    }

    #[cfg(test)]
    pub(crate) fn max_mtu(&self) -> u16 {
        self.max_mtu
    }

    pub(crate) fn stats(&self) -> MtudStats {
        self.stats
    }

    /// When the PMTU should be probed again after discovery completed, if ever
    pub(crate) fn raise_deadline(&self) -> Option<Instant> {
        match self.state.as_ref()?.phase {
            Phase::Complete { raise_at, .. } => raise_at,
            _ => None,
        }
    }

    /// Size of the probe due for transmission, if any
    pub(crate) fn pending_probe(&self) -> Option<u16> {
        let state = self.state.as_ref()?;
        let probe = match &state.phase {
            Phase::Base(probe) => Some(probe),
            Phase::Search { probe, .. } | Phase::Complete { probe, .. } => probe.as_ref(),
        }?;
        probe.ready(state.config.max_probes).then_some(probe.size)
    }

    /// Returns the amount of bytes that should be sent as an MTU probe, if any
    ///
    /// The probe is considered sent at `now`.
    pub(crate) fn poll_transmit(&mut self, now: Instant) -> Option<u16> {
        let state = self.state.as_mut()?;
        let max_probes = state.config.max_probes;
        let probe = state.phase.probe_mut()?;
        if !probe.ready(max_probes) {
            return None;
        }
        probe.attempts += 1;
        probe.time_sent = Some(now);
        self.stats.probes_sent += 1;
        trace!(size = probe.size, attempt = probe.attempts, "sending PMTU probe");
        Some(probe.size)
    }

    /// Notifies the [`MtuDiscovery`] that packets were acknowledged
    pub(crate) fn on_packets_acked(&mut self, now: Instant, packets: &[PacketInfo]) {
        if let Some(validator) = &mut self.validator {
            validator.on_packets_acked(packets);
        }
        for packet in packets.iter().filter(|packet| packet.probe) {
            self.on_probe_acked(now, packet.size);
        }
    }

    fn on_probe_acked(&mut self, now: Instant, size: u16) {
        let Some(state) = &mut self.state else {
            return;
        };
        let phase = mem::replace(&mut state.phase, Phase::IDLE);
        state.phase = match phase {
            Phase::Base(probe) if probe.size == size => {
                self.stats.probes_acked += 1;
                debug!(size, "base PMTU confirmed");
                if self.min_mtu >= self.max_mtu {
                    Phase::IDLE
                } else {
                    let bounds = Bounds::new(self.current_mtu, self.max_mtu);
                    state.search(now, Candidates::new(&state.config, bounds))
                }
            }
            Phase::Search {
                mut candidates,
                probe: Some(probe),
            } if probe.size == size => {
                self.stats.probes_acked += 1;
                candidates.on_success(size);
                self.current_mtu = self.current_mtu.max(size);
                trace!(current_mtu = self.current_mtu, "new MTU detected");
                state.search(now, candidates)
            }
            Phase::Complete {
                probe: Some(probe), ..
            } if probe.size == size => {
                self.stats.probes_acked += 1;
                self.current_mtu = self.current_mtu.max(size);
                debug!(current_mtu = self.current_mtu, "path supports a larger MTU, searching");
                let bounds = Bounds::new(self.current_mtu, self.max_mtu);
                state.search(now, Candidates::new(&state.config, bounds))
            }
            // A probe from an earlier phase, whose outcome is no longer relevant
            phase => phase,
        };
    }

    /// Notifies the [`MtuDiscovery`] that packets were declared lost
    ///
    /// Fails if the path cannot even carry probes of the minimum PMTU.
    pub(crate) fn on_packets_lost(
        &mut self,
        now: Instant,
        packets: &[PacketInfo],
        smoothed_rtt: Duration,
    ) -> Result<(), ConnectionError> {
        if let Some(invalidation) = self
            .validator
            .as_mut()
            .and_then(|validator| validator.on_packets_lost(now, packets, smoothed_rtt))
        {
            self.invalidate(now, invalidation);
        }
        for packet in packets.iter().filter(|packet| packet.probe) {
            self.on_probe_lost(now, packet.size)?;
        }
        Ok(())
    }

    fn on_probe_lost(&mut self, now: Instant, size: u16) -> Result<(), ConnectionError> {
        let Some(state) = &mut self.state else {
            return Ok(());
        };
        let max_probes = state.config.max_probes;
        let mut result = Ok(());
        let phase = mem::replace(&mut state.phase, Phase::IDLE);
        state.phase = match phase {
            Phase::Base(mut probe) if probe.size == size => {
                self.stats.probes_lost += 1;
                probe.lost += 1;
                if probe.lost >= max_probes {
                    debug!(size, "path does not carry datagrams of the minimum PMTU");
                    result = Err(ConnectionError::PmtuUnreachable { size });
                }
                Phase::Base(probe)
            }
            Phase::Search {
                mut candidates,
                probe: Some(mut probe),
            } if probe.size == size => {
                self.stats.probes_lost += 1;
                probe.lost += 1;
                if probe.lost < max_probes {
                    Phase::Search {
                        candidates,
                        probe: Some(probe),
                    }
                } else {
                    trace!(size, "PMTU probe size unsupported");
                    candidates.on_failure(size);
                    state.search(now, candidates)
                }
            }
            Phase::Complete {
                raise_at,
                probe: Some(mut probe),
            } if probe.size == size => {
                self.stats.probes_lost += 1;
                probe.lost += 1;
                if probe.lost < max_probes {
                    Phase::Complete {
                        raise_at,
                        probe: Some(probe),
                    }
                } else {
                    Phase::Complete {
                        raise_at: Some(now + state.config.raise_interval),
                        probe: None,
                    }
                }
            }
            phase => phase,
        };
        result
    }

    /// Probes for a larger PMTU once the raise timer set after completing discovery expired
    pub(crate) fn on_raise_timeout(&mut self, now: Instant) {
        let Some(state) = &mut self.state else {
            return;
        };
        if let Phase::Complete { raise_at, probe } = &mut state.phase {
            if probe.is_some() || !raise_at.is_some_and(|t| t <= now) {
                return;
            }
            *raise_at = None;
            let size = self
                .current_mtu
                .saturating_add(state.config.step)
                .min(self.max_mtu);
            if size > self.current_mtu {
                debug!(size, "probing for a larger PMTU");
                *probe = Some(Probe::new(size));
            }
        }
    }

    /// Handles an ICMP packet too big message reporting `ptb_size` for a `packet_size` datagram
    ///
    /// Messages reporting a size below the minimum PMTU, or not smaller than the dropped packet,
    /// are ignored.
    pub(crate) fn on_packet_too_big(&mut self, now: Instant, packet_size: u16, ptb_size: u16) {
        if ptb_size < self.min_mtu || ptb_size >= packet_size {
            trace!(packet_size, ptb_size, "ignoring packet too big message");
            return;
        }
        self.stats.packet_too_big += 1;
        self.max_mtu = self.max_mtu.min(ptb_size);

        let Some(state) = &mut self.state else {
            self.current_mtu = self.current_mtu.min(self.max_mtu);
            return;
        };
        debug!(ptb_size, current_mtu = self.current_mtu, "packet too big");
        state.phase = match ptb_size.cmp(&self.current_mtu) {
            std::cmp::Ordering::Less => {
                self.current_mtu = self.min_mtu;
                Phase::Base(Probe::new(self.min_mtu))
            }
            std::cmp::Ordering::Equal => Phase::IDLE,
            std::cmp::Ordering::Greater => {
                let bounds = Bounds::new(self.current_mtu, self.max_mtu);
                state.search(now, Candidates::new(&state.config, bounds))
            }
        };
    }

    /// Handles a persistent congestion event, the `count`th in a row
    pub(crate) fn on_persistent_congestion(
        &mut self,
        now: Instant,
        first_time_sent: Instant,
        count: u32,
    ) {
        if let Some(invalidation) = self
            .validator
            .as_mut()
            .and_then(|validator| validator.on_persistent_congestion(now, first_time_sent, count))
        {
            self.invalidate(now, invalidation);
        }
    }

    /// Lowers the PMTU after the validator found the path no longer supports it
    fn invalidate(&mut self, now: Instant, invalidation: Invalidation) {
        self.stats.invalidations += 1;
        let old = self.current_mtu;
        let Some(state) = &mut self.state else {
            self.current_mtu = self.min_mtu;
            return;
        };
        match invalidation.floor.filter(|&floor| floor < old) {
            Some(floor) => {
                self.current_mtu = floor;
                let bounds = Bounds {
                    lower: floor,
                    max: self.max_mtu,
                    smallest_failed: Some(old),
                };
                state.phase = state.search(now, Candidates::new(&state.config, bounds));
            }
            None => {
                self.current_mtu = self.min_mtu;
                state.phase = Phase::Base(Probe::new(self.min_mtu));
            }
        }
        debug!(old, current_mtu = self.current_mtu, "PMTU invalidated");
    }
}

/// What the recovery logic knows about a packet that was acknowledged or lost
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct PacketInfo {
    pub(crate) time_sent: Instant,
    pub(crate) size: u16,
    /// Whether the packet was a PMTU probe
    pub(crate) probe: bool,
}

/// Additional state for enabled MTU discovery
#[derive(Debug, Clone)]
struct EnabledMtuDiscovery {
    phase: Phase,
    config: MtuDiscoveryConfig,
}

impl EnabledMtuDiscovery {
    /// Continue a search with the next candidate, or complete it if there is none
    fn search(&self, now: Instant, mut candidates: Candidates) -> Phase {
        match candidates.next_candidate() {
            Some(size) => Phase::Search {
                candidates,
                probe: Some(Probe::new(size)),
            },
            None => {
                let bounds = candidates.bounds();
                debug!(pmtu = bounds.lower, "PMTU search complete");
                Phase::Complete {
                    // Nothing to gain from raising once the ceiling is reached
                    raise_at: (bounds.lower < bounds.max).then(|| now + self.config.raise_interval),
                    probe: None,
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Phase {
    /// Confirming that the path carries datagrams of the minimum PMTU
    Base(Probe),
    /// Looking for the largest supported size
    Search {
        candidates: Candidates,
        probe: Option<Probe>,
    },
    /// The PMTU is fixed until `raise_at`, when a larger probe is attempted
    Complete {
        raise_at: Option<Instant>,
        probe: Option<Probe>,
    },
}

impl Phase {
    /// Complete without any further probing
    const IDLE: Self = Self::Complete {
        raise_at: None,
        probe: None,
    };

    fn probe_mut(&mut self) -> Option<&mut Probe> {
        match self {
            Self::Base(probe) => Some(probe),
            Self::Search { probe, .. } | Self::Complete { probe, .. } => probe.as_mut(),
        }
    }
}

#[derive(Debug, Copy, Clone)]
struct Probe {
    size: u16,
    /// When the probe was last transmitted
    time_sent: Option<Instant>,
    /// Transmissions so far
    attempts: u8,
    /// Transmissions declared lost
    lost: u8,
}

impl Probe {
    fn new(size: u16) -> Self {
        Self {
            size,
            time_sent: None,
            attempts: 0,
            lost: 0,
        }
    }

    /// Whether the probe is due for a (re)transmission
    fn ready(&self, max_probes: u8) -> bool {
        self.attempts == self.lost && self.attempts < max_probes
    }
}
