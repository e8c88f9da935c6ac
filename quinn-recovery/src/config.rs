use std::fmt;

use thiserror::Error;

use crate::{
    congestion::CongestionControl, Duration, PathProperties, INITIAL_MTU, MAX_UDP_PAYLOAD,
};

/// Parameters governing loss recovery, congestion control and path MTU discovery
///
/// Default values follow RFC 9002 and RFC 8899 and should be suitable for most internet
/// applications. A configuration is checked once, when it is handed to [`crate::Recovery::new`];
/// invalid combinations are reported as a [`ConfigError`] at that point and never later.
#[derive(Clone)]
pub struct RecoveryConfig {
    pub(crate) packet_threshold: u32,
    pub(crate) time_threshold: f32,
    pub(crate) initial_rtt: Duration,
    pub(crate) max_ack_delay: Duration,
    pub(crate) ack_delay_exponent: u8,
    pub(crate) ack_eliciting_threshold: u32,
    pub(crate) persistent_congestion_threshold: u32,
    pub(crate) max_pto_count: u32,
    pub(crate) old_packet_threshold: Duration,
    pub(crate) reduce_packet_size_threshold: Option<ReduceThreshold>,

    pub(crate) initial_mtu: u16,
    pub(crate) min_mtu: u16,
    pub(crate) mtu_discovery_config: Option<MtuDiscoveryConfig>,
    pub(crate) pmtu_validator_config: Option<PmtuValidatorConfig>,

    pub(crate) congestion_controller: CongestionControl,
}

impl RecoveryConfig {
    /// Maximum reordering in packet number space before FACK style loss detection considers a
    /// packet lost. Should not be less than 3, per RFC5681.
    pub fn packet_threshold(&mut self, value: u32) -> &mut Self {
        self.packet_threshold = value;
        self
    }

    /// Maximum reordering in time space before time based loss detection considers a packet lost,
    /// as a factor of RTT
    pub fn time_threshold(&mut self, value: f32) -> &mut Self {
        self.time_threshold = value;
        self
    }

    /// The RTT used before an RTT sample is taken
    pub fn initial_rtt(&mut self, value: Duration) -> &mut Self {
        self.initial_rtt = value;
        self
    }

    /// Maximum amount of time the local endpoint delays acknowledging ack-eliciting application
    /// data packets
    ///
    /// Defaults to 25ms. Packets in the Initial and Handshake spaces are always acknowledged
    /// immediately.
    pub fn max_ack_delay(&mut self, value: Duration) -> &mut Self {
        self.max_ack_delay = value;
        self
    }

    /// Exponent used to scale the delay field of ACK frames sent by the local endpoint
    ///
    /// Must not exceed 20.
    pub fn ack_delay_exponent(&mut self, value: u8) -> &mut Self {
        self.ack_delay_exponent = value;
        self
    }

    /// Number of ack-eliciting packets received before an ACK is sent without waiting for the
    /// max ack delay
    pub fn ack_eliciting_threshold(&mut self, value: u32) -> &mut Self {
        self.ack_eliciting_threshold = value;
        self
    }

    /// Multiple of the probe timeout period (without backoff) that a span of lost packets must
    /// exceed for the path to be considered in persistent congestion
    pub fn persistent_congestion_threshold(&mut self, value: u32) -> &mut Self {
        self.persistent_congestion_threshold = value;
        self
    }

    /// Number of consecutive probe timeouts without any acknowledgement after which the peer is
    /// considered unreachable and the connection times out
    pub fn max_pto_count(&mut self, value: u32) -> &mut Self {
        self.max_pto_count = value;
        self
    }

    /// Age after which records of sent packets that do not count towards bytes in flight are
    /// forgotten, even if they were never acknowledged
    pub fn old_packet_threshold(&mut self, value: Duration) -> &mut Self {
        self.old_packet_threshold = value;
        self
    }

    /// How long an ack-eliciting packet may remain unacknowledged before the connection should
    /// stop building packets of a similar size
    ///
    /// See [`crate::Recovery::reduce_packet_size`]. Disabled by default.
    pub fn reduce_packet_size_threshold(&mut self, value: Option<ReduceThreshold>) -> &mut Self {
        self.reduce_packet_size_threshold = value;
        self
    }

    /// The initial value to be used as the maximum UDP payload size before running MTU discovery
    ///
    /// Must be at least 1200, which is the default. If MTU discovery is enabled it starts by
    /// confirming [`RecoveryConfig::min_mtu`] and the PMTU only grows once probes are
    /// acknowledged, so this value only matters when discovery is disabled.
    pub fn initial_mtu(&mut self, value: u16) -> &mut Self {
        self.initial_mtu = value.max(INITIAL_MTU);
        self
    }

    /// The maximum UDP payload size guaranteed to be supported by the network
    ///
    /// Must be at least 1200, which is the default, and lower than or equal to
    /// [`RecoveryConfig::initial_mtu`]. MTU discovery never goes below this value: if the path
    /// cannot carry probes of this size the connection fails.
    pub fn min_mtu(&mut self, value: u16) -> &mut Self {
        self.min_mtu = value.max(INITIAL_MTU);
        self
    }

    /// Specifies the MTU discovery config (see [`MtuDiscoveryConfig`] for details)
    ///
    /// Enabled by default.
    pub fn mtu_discovery_config(&mut self, value: Option<MtuDiscoveryConfig>) -> &mut Self {
        self.mtu_discovery_config = value;
        self
    }

    /// Specifies the PMTU validator config (see [`PmtuValidatorConfig`] for details)
    ///
    /// Enabled by default.
    pub fn pmtu_validator_config(&mut self, value: Option<PmtuValidatorConfig>) -> &mut Self {
        self.pmtu_validator_config = value;
        self
    }

    /// How to construct the congestion controller
    pub fn congestion_controller(&mut self, value: CongestionControl) -> &mut Self {
        self.congestion_controller = value;
        self
    }

    /// Check that the settings are consistent with each other and with `path`
    pub(crate) fn validate(&self, path: &PathProperties) -> Result<(), ConfigError> {
        if self.packet_threshold == 0
            || !(1.0..=16.0).contains(&self.time_threshold)
            || self.ack_delay_exponent > 20
            || self.ack_eliciting_threshold == 0
            || self.persistent_congestion_threshold == 0
            || self.max_pto_count == 0
            || self.initial_rtt.is_zero()
        {
            return Err(ConfigError::OutOfBounds);
        }
        // RFC 9000 §18.2: values of 2^14 or greater are invalid
        if self.max_ack_delay >= Duration::from_millis(1 << 14) {
            return Err(ConfigError::OutOfBounds);
        }
        if let Some(ReduceThreshold::PtoMultiple(factor)) = self.reduce_packet_size_threshold {
            if !(factor.is_finite() && factor > 0.0) {
                return Err(ConfigError::OutOfBounds);
            }
        }
        if self.min_mtu > self.initial_mtu || self.min_mtu > path.max_udp_payload_size() {
            return Err(ConfigError::InvalidMtuBounds);
        }
        if let Some(mtud) = &self.mtu_discovery_config {
            if mtud.upper_bound < self.min_mtu {
                return Err(ConfigError::InvalidMtuBounds);
            }
            if mtud.max_probes == 0 || mtud.step == 0 || mtud.minimum_change == 0 {
                return Err(ConfigError::OutOfBounds);
            }
        }
        if let Some(validator) = &self.pmtu_validator_config {
            if validator.loss_threshold < 2 || validator.persistent_congestion_threshold == 0 {
                return Err(ConfigError::OutOfBounds);
            }
            if let ValidatorTime::RttMultiple(factor) = validator.time_threshold {
                if !(factor.is_finite() && factor >= 0.0) {
                    return Err(ConfigError::OutOfBounds);
                }
            }
        }
        Ok(())
    }

    /// Largest UDP payload MTU discovery may reach on `path`
    pub(crate) fn max_mtu(&self, path: &PathProperties) -> u16 {
        let upper = self
            .mtu_discovery_config
            .as_ref()
            .map_or(self.initial_mtu, |mtud| mtud.upper_bound);
        upper.min(path.max_udp_payload_size()).max(self.min_mtu)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            packet_threshold: 3,
            time_threshold: 9.0 / 8.0,
            initial_rtt: Duration::from_millis(333), // per RFC 9002 §6.2.2
            max_ack_delay: Duration::from_millis(25),
            ack_delay_exponent: 3,
            ack_eliciting_threshold: 2,
            persistent_congestion_threshold: 3,
            max_pto_count: 10,
            old_packet_threshold: Duration::from_secs(10),
            reduce_packet_size_threshold: None,

            initial_mtu: INITIAL_MTU,
            min_mtu: INITIAL_MTU,
            mtu_discovery_config: Some(MtuDiscoveryConfig::default()),
            pmtu_validator_config: Some(PmtuValidatorConfig::default()),

            congestion_controller: CongestionControl::default(),
        }
    }
}

impl fmt::Debug for RecoveryConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            packet_threshold,
            time_threshold,
            initial_rtt,
            max_ack_delay,
            ack_delay_exponent,
            ack_eliciting_threshold,
            persistent_congestion_threshold,
            max_pto_count,
            old_packet_threshold,
            reduce_packet_size_threshold,
            initial_mtu,
            min_mtu,
            mtu_discovery_config,
            pmtu_validator_config,
            congestion_controller,
        } = self;
        fmt.debug_struct("RecoveryConfig")
            .field("packet_threshold", packet_threshold)
            .field("time_threshold", time_threshold)
            .field("initial_rtt", initial_rtt)
            .field("max_ack_delay", max_ack_delay)
            .field("ack_delay_exponent", ack_delay_exponent)
            .field("ack_eliciting_threshold", ack_eliciting_threshold)
            .field(
                "persistent_congestion_threshold",
                persistent_congestion_threshold,
            )
            .field("max_pto_count", max_pto_count)
            .field("old_packet_threshold", old_packet_threshold)
            .field("reduce_packet_size_threshold", reduce_packet_size_threshold)
            .field("initial_mtu", initial_mtu)
            .field("min_mtu", min_mtu)
            .field("mtu_discovery_config", mtu_discovery_config)
            .field("pmtu_validator_config", pmtu_validator_config)
            .field("congestion_controller", congestion_controller)
            .finish()
    }
}

/// Age threshold used by [`crate::Recovery::reduce_packet_size`]
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ReduceThreshold {
    /// A fixed duration
    Fixed(Duration),
    /// A multiple of `smoothed_rtt + max(4 * rttvar, granularity) + max_ack_delay`
    PtoMultiple(f32),
}

/// Parameters governing MTU discovery
///
/// # The why of MTU discovery
///
/// By design, QUIC ensures during the handshake that the network path between the client and the
/// server is able to transmit unfragmented UDP packets with a body of 1200 bytes. In other words,
/// once the connection is established, we know that the network path's maximum transmission unit
/// (MTU) is of at least 1200 bytes (plus IP and UDP headers). Because of this, a QUIC endpoint can
/// split outgoing data in packets of 1200 bytes, with confidence that the network will be able to
/// deliver them (if the endpoint were to send bigger packets, they could prove too big and end up
/// being dropped).
///
/// There is, however, a significant overhead associated to sending a packet. If the same
/// information can be sent in fewer packets, that results in higher throughput. The amount of
/// packets that need to be sent is inversely proportional to the MTU: the higher the MTU, the
/// bigger the packets that can be sent, and the fewer packets that are needed to transmit a given
/// amount of bytes.
///
/// # Discovery phases
///
/// Discovery follows RFC 8899. In the *base* phase a probe of [`RecoveryConfig::min_mtu`] bytes
/// confirms that the path works at all; if [`MtuDiscoveryConfig::max_probes`] such probes are
/// lost the connection fails. The *search* phase then probes sizes chosen by the configured
/// [`CandidateSequenceKind`] until no candidate is left. In the *complete* phase the PMTU stays
/// fixed until [`MtuDiscoveryConfig::raise_interval`] elapses, after which a slightly larger
/// probe is sent to find out whether the path improved.
///
/// ICMP "packet too big" messages and the PMTU validator can interrupt any phase and lower the
/// PMTU.
#[derive(Clone, Debug)]
pub struct MtuDiscoveryConfig {
    pub(crate) candidate_sequence: CandidateSequenceKind,
    pub(crate) upper_bound: u16,
    pub(crate) max_probes: u8,
    pub(crate) raise_interval: Duration,
    pub(crate) step: u16,
    pub(crate) minimum_change: u16,
    pub(crate) jump_sizes: Vec<u16>,
}

impl MtuDiscoveryConfig {
    /// Strategy used to choose the next probe size while searching
    ///
    /// Defaults to [`CandidateSequenceKind::Binary`].
    pub fn candidate_sequence(&mut self, value: CandidateSequenceKind) -> &mut Self {
        self.candidate_sequence = value;
        self
    }

    /// Specifies the upper bound to the max UDP payload size that MTU discovery will search for
    ///
    /// Defaults to 1452, to stay within Ethernet's MTU when using IPv4 and IPv6. The highest
    /// allowed value is 65527, which corresponds to the maximum permitted UDP payload on IPv6. The
    /// bound is further limited by the MTU of the local interface.
    pub fn upper_bound(&mut self, value: u16) -> &mut Self {
        self.upper_bound = value.min(MAX_UDP_PAYLOAD);
        self
    }

    /// Number of times a probe of a given size is sent before that size is considered
    /// unsupported by the path
    ///
    /// Defaults to 3, the `MAX_PROBES` constant of RFC 8899.
    pub fn max_probes(&mut self, value: u8) -> &mut Self {
        self.max_probes = value;
        self
    }

    /// Specifies the time to wait after completing MTU discovery before probing for a larger
    /// PMTU again
    ///
    /// Defaults to 600 seconds, as recommended by [RFC
    /// 8899](https://www.rfc-editor.org/rfc/rfc8899).
    pub fn raise_interval(&mut self, value: Duration) -> &mut Self {
        self.raise_interval = value;
        self
    }

    /// Size increment used by the linear candidate sequences and by raise probes
    ///
    /// Defaults to 32.
    pub fn step(&mut self, value: u16) -> &mut Self {
        self.step = value;
        self
    }

    /// Specifies the minimum MTU change to stop the binary search phase
    ///
    /// Defaults to 20.
    pub fn minimum_change(&mut self, value: u16) -> &mut Self {
        self.minimum_change = value;
        self
    }

    /// UDP payload sizes probed by [`CandidateSequenceKind::Jump`]
    ///
    /// Defaults to the payload sizes of common link MTUs (IPv6 minimum, tunnels, PPPoE, Ethernet
    /// and jumbo frames). Sizes outside the search bounds are skipped.
    pub fn jump_sizes(&mut self, mut value: Vec<u16>) -> &mut Self {
        value.sort_unstable();
        value.dedup();
        self.jump_sizes = value;
        self
    }
}

impl Default for MtuDiscoveryConfig {
    fn default() -> Self {
        Self {
            candidate_sequence: CandidateSequenceKind::Binary,
            upper_bound: 1452,
            max_probes: 3,
            raise_interval: Duration::from_secs(600),
            step: 32,
            minimum_change: 20,
            jump_sizes: vec![1232, 1352, 1372, 1392, 1444, 1452, 1472, 8952],
        }
    }
}

/// Strategies for choosing the next PMTU probe size
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum CandidateSequenceKind {
    /// Walk up from the confirmed PMTU in fixed steps
    Up,
    /// Walk down from the upper bound in fixed steps until a probe succeeds
    Down,
    /// Binary search between the confirmed PMTU and the upper bound
    #[default]
    Binary,
    /// Probe the upper bound first, then fall back to binary search
    OptBinary,
    /// Probe the upper bound first, then fall back to walking up in fixed steps
    OptUp,
    /// Probe well-known payload sizes in increasing order, then refine with binary search
    Jump,
}

/// Parameters of the PMTU validator
///
/// The validator watches for loss patterns that indicate the path stopped carrying packets of the
/// confirmed PMTU while smaller packets still get through (a "black hole"). When that happens the
/// PMTU is lowered and MTU discovery starts over.
#[derive(Clone, Debug)]
pub struct PmtuValidatorConfig {
    pub(crate) loss_threshold: u32,
    pub(crate) time_threshold: ValidatorTime,
    pub(crate) persistent_congestion_threshold: u32,
}

impl PmtuValidatorConfig {
    /// Number of lost packets, each larger than anything acknowledged since it was sent, needed to
    /// invalidate the PMTU
    ///
    /// Defaults to 3, must be at least 2.
    pub fn loss_threshold(&mut self, value: u32) -> &mut Self {
        self.loss_threshold = value;
        self
    }

    /// Minimum time between the first and last of those lost packets
    ///
    /// Defaults to one smoothed RTT.
    pub fn time_threshold(&mut self, value: ValidatorTime) -> &mut Self {
        self.time_threshold = value;
        self
    }

    /// Number of consecutive persistent congestion events, without any packet larger than the
    /// minimum PMTU being acknowledged, that invalidate the PMTU
    ///
    /// Defaults to 2.
    pub fn persistent_congestion_threshold(&mut self, value: u32) -> &mut Self {
        self.persistent_congestion_threshold = value;
        self
    }
}

impl Default for PmtuValidatorConfig {
    fn default() -> Self {
        Self {
            loss_threshold: 3,
            time_threshold: ValidatorTime::RttMultiple(1.0),
            persistent_congestion_threshold: 2,
        }
    }
}

/// Time threshold of the PMTU validator
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ValidatorTime {
    /// A fixed duration
    Fixed(Duration),
    /// A multiple of the smoothed RTT
    RttMultiple(f32),
}

impl ValidatorTime {
    pub(crate) fn get(&self, smoothed_rtt: Duration) -> Duration {
        match *self {
            Self::Fixed(duration) => duration,
            Self::RttMultiple(factor) => smoothed_rtt.mul_f32(factor),
        }
    }
}

/// Errors in the configuration of an endpoint
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Value exceeds supported bounds
    #[error("value exceeds supported bounds")]
    OutOfBounds,
    /// The minimum, initial and maximum MTUs are inconsistent
    #[error("minimum MTU exceeds initial MTU or the path's maximum")]
    InvalidMtuBounds,
}
