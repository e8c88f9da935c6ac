use std::{cmp, collections::VecDeque, iter, sync::Arc};

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{
    congestion::{Congestion, Controller, LostPacket},
    frame::{Ack, Frame},
    mtud::MtuDiscovery,
    packet::PerSpace,
    stats::RecoveryStats,
    timer::{Timer, TimerTable},
    transport_error::Error as TransportError,
    ConfigError, Duration, Instant, PathProperties, RecoveryConfig, ReduceThreshold, SpaceId,
    TIMER_GRANULARITY,
};

mod pending_acks;
mod rtt;
mod spaces;

pub use rtt::RttEstimator;
pub use spaces::SentPacket;

use spaces::PacketSpace;

/// Upper bound on the exponent of the PTO backoff
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Loss recovery state of a single connection and path
///
/// `Recovery` keeps the bookkeeping of RFC 9002 for all three packet number spaces: it remembers
/// sent packets until they are acknowledged or declared lost, tracks received packet numbers to
/// build ACK frames, estimates the RTT, runs the loss detection and probe timeout timers and feeds
/// the outcome of every packet to the congestion controller and to path MTU discovery.
///
/// It never performs I/O and never reads the clock. The connection reports what happens through
/// the `on_*` methods, drives the timers through [`Recovery::poll_timeout`] and
/// [`Recovery::handle_timeout`] and reacts to the [`Event`]s returned by [`Recovery::poll`].
pub struct Recovery {
    config: Arc<RecoveryConfig>,
    path: PathProperties,
    spaces: PerSpace<PacketSpace>,
    rtt: RttEstimator,
    /// When the first RTT sample was taken
    first_rtt_sample: Option<Instant>,
    congestion: Congestion,
    mtud: MtuDiscovery,
    /// PMTU last reported to the congestion controller and the application
    current_mtu: u16,
    timers: TimerTable,
    /// The number of times a PTO has been sent without receiving an ack.
    pto_count: u32,
    /// Consecutive loss batches that indicated persistent congestion
    persistent_congestion_count: u32,
    handshake_confirmed: bool,
    peer_max_ack_delay: Duration,
    peer_ack_delay_exponent: u8,
    stats: RecoveryStats,
    events: VecDeque<Event>,
    /// When non-in-flight packets are next checked for expiry
    next_purge: Option<Instant>,
}

impl Recovery {
    /// Create the recovery state for a path with the given properties
    ///
    /// Fails if `config` is inconsistent, either with itself or with `path`.
    pub fn new(
        config: Arc<RecoveryConfig>,
        path: PathProperties,
        now: Instant,
    ) -> Result<Self, ConfigError> {
        config.validate(&path)?;
        let mtud = MtuDiscovery::new(&config, &path);
        let current_mtu = mtud.current_mtu();
        Ok(Self {
            spaces: PerSpace::new(|space| PacketSpace::new(space, config.ack_eliciting_threshold)),
            rtt: RttEstimator::new(config.initial_rtt),
            first_rtt_sample: None,
            congestion: config.congestion_controller.build(now, current_mtu),
            mtud,
            current_mtu,
            timers: TimerTable::default(),
            pto_count: 0,
            persistent_congestion_count: 0,
            handshake_confirmed: false,
            // RFC 9000 §18.2 defaults until the peer's transport parameters are known
            peer_max_ack_delay: Duration::from_millis(25),
            peer_ack_delay_exponent: 3,
            stats: RecoveryStats::default(),
            events: VecDeque::new(),
            next_purge: None,
            config,
            path,
        })
    }

    /// Record the transmission of packet `number` in `space`
    ///
    /// Packet numbers must be assigned in increasing order within a space.
    pub fn on_packet_sent(&mut self, now: Instant, space: SpaceId, number: u64, packet: SentPacket) {
        if self.spaces[space].discarded {
            warn!(?space, number, "packet sent in discarded space");
            return;
        }
        debug_assert!(
            self.spaces[space].largest_sent.map_or(true, |largest| number > largest),
            "packet numbers must increase"
        );
        trace!(
            ?space,
            number,
            size = packet.size,
            ack_eliciting = packet.ack_eliciting,
            probe = packet.pmtu_probe,
            "packet sent"
        );
        self.stats.path.sent_packets += 1;
        let in_flight = packet.in_flight;
        if in_flight {
            self.congestion.on_sent(now, u64::from(packet.size));
        }
        self.spaces[space].sent(number, packet);
        self.purge_old_packets(now);
        if in_flight {
            self.set_loss_detection_timer();
        }
    }

    /// Forget non-in-flight packets that will never be acknowledged, at most once per threshold
    fn purge_old_packets(&mut self, now: Instant) {
        if self.next_purge.is_some_and(|next| now < next) {
            return;
        }
        let threshold = self.config.old_packet_threshold;
        self.next_purge = Some(now + threshold);
        let Some(expiry) = now.checked_sub(threshold) else {
            return;
        };
        for space in SpaceId::iter() {
            let sent = &mut self.spaces[space].sent_packets;
            let before = sent.len();
            sent.retain(|_, packet| packet.in_flight || packet.time_sent > expiry);
            if sent.len() != before {
                trace!(?space, purged = before - sent.len(), "forgot old packets");
            }
        }
    }

    /// Record the receipt of packet `number` in `space`
    ///
    /// `immediate` reflects a request from the peer to acknowledge the packet without delay.
    pub fn on_packet_received(
        &mut self,
        now: Instant,
        space: SpaceId,
        number: u64,
        ack_eliciting: bool,
        immediate: bool,
    ) {
        if self.spaces[space].discarded {
            return;
        }
        let pending = &mut self.spaces[space].pending_acks;
        pending.on_packet_received(now, number, ack_eliciting, immediate);
        if space == SpaceId::Data {
            match pending.max_ack_delay_timeout(self.config.max_ack_delay) {
                Some(timeout) => self.timers.set(Timer::MaxAckDelay, timeout),
                None => self.timers.stop(Timer::MaxAckDelay),
            }
        }
    }

    /// Whether an ACK frame for `space` should be sent now, in an ACK-only packet if necessary
    pub fn immediate_ack_required(&self, space: SpaceId) -> bool {
        self.spaces[space].pending_acks.immediate_ack_required()
    }

    /// Whether packets were received in `space` since the last ACK frame was built
    pub fn has_pending_acks(&self, space: SpaceId) -> bool {
        self.spaces[space].pending_acks.has_new_info()
    }

    /// Build an ACK frame for `space` whose encoding fits in `max_size` bytes
    ///
    /// Returns `None` if nothing was received in `space` yet. Fails if not even the largest
    /// received packet can be acknowledged within `max_size` bytes.
    pub fn ack_frame(
        &mut self,
        space: SpaceId,
        now: Instant,
        max_size: usize,
    ) -> Result<Option<Ack>, ConnectionError> {
        let pending = &mut self.spaces[space].pending_acks;
        if pending.largest().is_none() {
            return Ok(None);
        }
        let exponent = self.config.ack_delay_exponent;
        let ack = pending
            .generate(now, max_size, exponent)
            .ok_or(ConnectionError::AckFrameTooLarge { max_size })?;
        self.stats.acks_sent += 1;
        if space == SpaceId::Data {
            self.timers.stop(Timer::MaxAckDelay);
        }
        Ok(Some(ack))
    }

    /// Process an ACK frame received in `space`
    pub fn on_ack_received(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        ack: &Ack,
    ) -> Result<(), ConnectionError> {
        ack.smallest()?;
        let space = &mut self.spaces[space_id];
        if space.discarded {
            warn!(space = ?space_id, "ACK received in discarded space");
            return Ok(());
        }
        if space.largest_sent.map_or(true, |largest| ack.largest > largest) {
            return Err(TransportError::PROTOCOL_VIOLATION("unsent packet acked").into());
        }
        self.stats.acks_received += 1;
        if space
            .largest_acked_packet
            .map_or(true, |largest| ack.largest > largest)
        {
            space.largest_acked_packet = Some(ack.largest);
        }

        let acked = newly_acked(space, ack)
            .into_iter()
            .filter_map(|number| Some((number, space.take(number)?)))
            .collect::<Vec<_>>();
        if acked.is_empty() {
            return Ok(());
        }

        let largest_time_sent = acked
            .iter()
            .find(|&&(number, _)| number == ack.largest)
            .map(|(_, packet)| packet.time_sent);
        if let Some(time_sent) = largest_time_sent {
            if acked.iter().any(|(_, packet)| packet.ack_eliciting) {
                let ack_delay = match space_id {
                    SpaceId::Data => cmp::min(
                        self.peer_max_ack_delay,
                        Duration::from_micros(
                            ack.delay
                                .saturating_mul(1 << self.peer_ack_delay_exponent),
                        ),
                    ),
                    _ => Duration::ZERO,
                };
                if !self.rtt.has_sample() {
                    self.first_rtt_sample = Some(now);
                }
                self.rtt
                    .update(ack_delay, now.saturating_duration_since(time_sent));
                trace!(
                    latest = ?self.rtt.latest(),
                    smoothed = ?self.rtt.get(),
                    var = ?self.rtt.var(),
                    "RTT sample"
                );
            }
        }

        // Acknowledgements are evidence for the PMTU validator before losses are
        let infos = acked
            .iter()
            .map(|(_, packet)| packet.info())
            .collect::<Vec<_>>();
        self.mtud.on_packets_acked(now, &infos);

        let lost = self.detect_lost_packets(now, space_id);
        if let Ok(false) = lost {
            self.persistent_congestion_count = 0;
        }

        for (number, packet) in acked {
            trace!(space = ?space_id, number, "packet acked");
            if packet.in_flight {
                self.congestion
                    .on_ack(now, packet.time_sent, u64::from(packet.size));
            }
            if let Some(largest) = packet.largest_acked() {
                self.spaces[space_id].pending_acks.on_packet_acked(largest);
            }
            self.events.push_back(Event::PacketAcked {
                space: space_id,
                number,
                packet,
            });
        }

        self.pto_count = 0;
        self.sync_mtu();
        self.set_loss_detection_timer();
        lost.map(|_| ())
    }

    /// Declare packets of `space_id` lost, returning whether any were
    fn detect_lost_packets(
        &mut self,
        now: Instant,
        space_id: SpaceId,
    ) -> Result<bool, ConnectionError> {
        let loss_delay = cmp::max(
            self.rtt.conservative().mul_f32(self.config.time_threshold),
            TIMER_GRANULARITY,
        );
        // Packets sent before this time are deemed lost.
        let lost_send_time = now.checked_sub(loss_delay);
        let packet_threshold = u64::from(self.config.packet_threshold);

        let space = &mut self.spaces[space_id];
        space.loss_time = None;
        let Some(largest_acked) = space.largest_acked_packet else {
            return Ok(false);
        };
        let mut lost_numbers = Vec::new();
        for (&number, packet) in space.sent_packets.range(..largest_acked) {
            if lost_send_time.is_some_and(|t| packet.time_sent <= t)
                || largest_acked - number >= packet_threshold
            {
                lost_numbers.push(number);
            } else {
                let next_loss_time = packet.time_sent + loss_delay;
                space.loss_time = Some(
                    space
                        .loss_time
                        .map_or(next_loss_time, |x| cmp::min(x, next_loss_time)),
                );
            }
        }

        let lost = lost_numbers
            .into_iter()
            .filter_map(|number| Some((number, space.take(number)?)))
            .collect::<Vec<_>>();
        if lost.is_empty() {
            return Ok(false);
        }
        self.on_packets_lost(now, space_id, lost)?;
        Ok(true)
    }

    fn on_packets_lost(
        &mut self,
        now: Instant,
        space: SpaceId,
        lost: Vec<(u64, SentPacket)>,
    ) -> Result<(), ConnectionError> {
        self.stats.path.lost_packets += lost.len() as u64;
        self.stats.path.lost_bytes += lost
            .iter()
            .map(|(_, packet)| u64::from(packet.size))
            .sum::<u64>();
        trace!(
            ?space,
            packets = ?lost.iter().map(|&(number, _)| number).collect::<Vec<_>>(),
            "packets lost"
        );

        let persistent_congestion = self.persistent_congestion_start(&lost);
        match persistent_congestion {
            Some(start) => {
                self.persistent_congestion_count += 1;
                self.stats.path.persistent_congestion_events += 1;
                debug!(
                    ?space,
                    count = self.persistent_congestion_count,
                    "persistent congestion"
                );
                self.mtud
                    .on_persistent_congestion(now, start, self.persistent_congestion_count);
            }
            None => self.persistent_congestion_count = 0,
        }

        let infos = lost
            .iter()
            .map(|(_, packet)| packet.info())
            .collect::<Vec<_>>();
        let result = self.mtud.on_packets_lost(now, &infos, self.rtt.get());

        let in_flight = lost
            .iter()
            .filter(|(_, packet)| packet.in_flight)
            .map(|(_, packet)| LostPacket {
                time_sent: packet.time_sent,
                bytes: u64::from(packet.size),
                pmtu_probe: packet.pmtu_probe,
            })
            .collect::<Vec<_>>();
        if !in_flight.is_empty() {
            if in_flight.iter().any(|packet| !packet.pmtu_probe) {
                self.stats.path.congestion_events += 1;
            }
            self.congestion
                .on_packets_lost(now, &in_flight, persistent_congestion.is_some());
        }

        for (number, packet) in lost {
            self.events
                .push_back(Event::PacketLost { space, number, packet });
        }
        self.sync_mtu();
        result
    }

    /// If `lost` spans a persistent congestion period, the send time of its first packet
    ///
    /// Only ack-eliciting packets sent after the first RTT sample count, and any packet number
    /// missing from `lost` restarts the span.
    fn persistent_congestion_start(&self, lost: &[(u64, SentPacket)]) -> Option<Instant> {
        let first_rtt_sample = self.first_rtt_sample?;
        let period =
            (self.rtt.pto_base() + self.peer_max_ack_delay) * self.config.persistent_congestion_threshold;
        let mut start = None;
        let mut prev = None;
        for (number, packet) in lost {
            if prev.is_some_and(|prev| prev + 1 != *number) {
                start = None;
            }
            prev = Some(*number);
            if !packet.ack_eliciting || packet.pmtu_probe || packet.time_sent <= first_rtt_sample {
                continue;
            }
            match start {
                None => start = Some(packet.time_sent),
                Some(first) if packet.time_sent.saturating_duration_since(first) > period => {
                    return Some(first);
                }
                Some(_) => {}
            }
        }
        None
    }

    fn on_loss_detection_timeout(&mut self, now: Instant) -> Result<(), ConnectionError> {
        if let Some((loss_time, space)) = self.earliest_time_and_space(|x| x.loss_time) {
            // Time threshold loss detection
            let result = if loss_time <= now {
                self.detect_lost_packets(now, space).map(|_| ())
            } else {
                Ok(())
            };
            self.set_loss_detection_timer();
            return result;
        }

        let Some((_, space)) = self.pto_time_and_space() else {
            trace!("loss detection timeout with nothing to probe");
            self.set_loss_detection_timer();
            return Ok(());
        };
        if self.pto_count >= self.config.max_pto_count {
            debug!(count = self.pto_count, "peer unresponsive");
            return Err(ConnectionError::TimedOut);
        }
        self.pto_count = self.pto_count.saturating_add(1);
        self.stats.path.pto_count += 1;
        debug!(?space, count = self.pto_count, "PTO fired");

        let retransmit = self.spaces[space]
            .oldest_ack_eliciting()
            .map(|(_, packet)| packet.retransmittable_frames().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        self.events
            .push_back(Event::SendProbe(ProbeRequest { space, retransmit }));
        self.set_loss_detection_timer();
        Ok(())
    }

    fn set_loss_detection_timer(&mut self) {
        if let Some((loss_time, _)) = self.earliest_time_and_space(|x| x.loss_time) {
            // Time threshold loss detection.
            self.timers.set(Timer::LossDetection, loss_time);
            return;
        }
        match self.pto_time_and_space() {
            Some((timeout, _)) => self.timers.set(Timer::LossDetection, timeout),
            None => self.timers.stop(Timer::LossDetection),
        }
    }

    fn earliest_time_and_space(
        &self,
        get: impl Fn(&PacketSpace) -> Option<Instant>,
    ) -> Option<(Instant, SpaceId)> {
        SpaceId::iter()
            .filter_map(|id| get(&self.spaces[id]).map(|time| (time, id)))
            .min_by_key(|&(time, _)| time)
    }

    /// When and in which space the next probe timeout fires
    ///
    /// Application data is not probed before the handshake is confirmed.
    fn pto_time_and_space(&self) -> Option<(Instant, SpaceId)> {
        let backoff = 2u32.pow(cmp::min(self.pto_count, MAX_BACKOFF_EXPONENT));
        SpaceId::iter()
            .filter(|&id| id != SpaceId::Data || self.handshake_confirmed)
            .filter_map(|id| {
                let space = &self.spaces[id];
                if !space.has_ack_eliciting_in_flight() {
                    return None;
                }
                let sent = space.time_of_last_ack_eliciting_packet?;
                Some((sent + self.pto_duration(id) * backoff, id))
            })
            .min_by_key(|&(time, _)| time)
    }

    /// Probe timeout of `space`, without exponential backoff
    ///
    /// Application data also waits for the peer's `max_ack_delay`. Connections size their closing
    /// and draining periods from this.
    pub fn pto_duration(&self, space: SpaceId) -> Duration {
        let max_ack_delay = match space {
            SpaceId::Data => self.peer_max_ack_delay,
            _ => Duration::ZERO,
        };
        self.rtt.pto_base() + max_ack_delay
    }

    /// The earliest time at which [`Recovery::handle_timeout`] should be called
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.timers.peek()
    }

    /// Process timer expirations
    ///
    /// Fails if the peer stopped responding or the path stopped carrying datagrams of the minimum
    /// PMTU.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<(), ConnectionError> {
        let expired = iter::from_fn(|| self.timers.expire_before(now)).collect::<Vec<_>>();
        for (timer, _) in expired {
            trace!(?timer, "timeout");
            match timer {
                Timer::LossDetection => self.on_loss_detection_timeout(now)?,
                Timer::MaxAckDelay => self.spaces[SpaceId::Data]
                    .pending_acks
                    .on_max_ack_delay_timeout(),
                Timer::PmtuRaise => {
                    self.mtud.on_raise_timeout(now);
                    self.sync_mtu();
                }
            }
        }
        Ok(())
    }

    /// Returns the next application-facing event
    pub fn poll(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Size of the next PMTU probe, if one is due and fits in the congestion window
    ///
    /// The probe is considered sent at `now`; the connection must send a packet of exactly that
    /// size with [`SentPacket::pmtu_probe`] set.
    pub fn poll_pmtu_probe(&mut self, now: Instant) -> Option<u16> {
        if !self.handshake_confirmed {
            return None;
        }
        let size = self.mtud.pending_probe()?;
        if self.congestion.remaining_window() < u64::from(size) {
            trace!(size, "PMTU probe blocked by congestion window");
            return None;
        }
        self.mtud.poll_transmit(now)
    }

    /// Process an ICMP "packet too big" message about packet `number`
    ///
    /// `link_mtu` is the MTU reported by the message, IP and UDP headers included. Messages about
    /// packets that are no longer tracked are ignored.
    pub fn on_packet_too_big(&mut self, now: Instant, space: SpaceId, number: u64, link_mtu: u16) {
        let Some(packet) = self.get_sent_packet(space, number) else {
            trace!(?space, number, "packet too big for unknown packet");
            return;
        };
        let packet_size = packet.size;
        self.mtud
            .on_packet_too_big(now, packet_size, self.path.udp_payload_size(link_mtu));
        self.sync_mtu();
    }

    /// Propagate PMTU changes to the congestion controller, the application and the raise timer
    fn sync_mtu(&mut self) {
        let mtu = self.mtud.current_mtu();
        if mtu != self.current_mtu {
            debug!(old = self.current_mtu, mtu, "PMTU changed");
            self.current_mtu = mtu;
            self.congestion.on_mtu_update(mtu);
            self.events.push_back(Event::MtuUpdated { mtu });
        }
        match self.mtud.raise_deadline() {
            Some(deadline) => self.timers.set(Timer::PmtuRaise, deadline),
            None => self.timers.stop(Timer::PmtuRaise),
        }
    }

    /// Whether packets of a size in `(min, max]` should no longer be built
    ///
    /// True if an ack-eliciting packet of such a size, other than a PMTU probe, has gone
    /// unacknowledged for longer than [`RecoveryConfig::reduce_packet_size_threshold`].
    pub fn reduce_packet_size(&self, min: u16, max: u16, now: Instant) -> bool {
        let threshold = match self.config.reduce_packet_size_threshold {
            None => return false,
            Some(ReduceThreshold::Fixed(threshold)) => threshold,
            Some(ReduceThreshold::PtoMultiple(factor)) => {
                (self.rtt.pto_base() + self.peer_max_ack_delay).mul_f32(factor)
            }
        };
        let Some(sent_before) = now.checked_sub(threshold) else {
            return false;
        };
        SpaceId::iter().any(|id| {
            let space = &self.spaces[id];
            let after = space.largest_acked_packet.map_or(0, |largest| largest + 1);
            space.sent_packets.range(after..).any(|(_, packet)| {
                packet.ack_eliciting
                    && !packet.pmtu_probe
                    && packet.size > min
                    && packet.size <= max
                    && packet.time_sent <= sent_before
            })
        })
    }

    /// Forget everything about `space`, whose keys were discarded
    ///
    /// Packets still in flight in `space` are removed from congestion accounting without being
    /// treated as lost.
    pub fn discard_space(&mut self, space_id: SpaceId) {
        let space = &mut self.spaces[space_id];
        if space.discarded {
            return;
        }
        debug!(space = ?space_id, "discarding packet space");
        let in_flight = space.in_flight;
        *space = PacketSpace::new(space_id, self.config.ack_eliciting_threshold);
        space.discarded = true;
        self.congestion.on_discarded(in_flight);
        if space_id == SpaceId::Data {
            self.timers.stop(Timer::MaxAckDelay);
        }
        self.pto_count = 0;
        self.set_loss_detection_timer();
    }

    /// The handshake is confirmed, so application data may be probed
    pub fn set_handshake_confirmed(&mut self) {
        self.handshake_confirmed = true;
        self.set_loss_detection_timer();
    }

    /// Apply the peer's `max_ack_delay` and `ack_delay_exponent` transport parameters
    pub fn set_peer_params(
        &mut self,
        max_ack_delay: Duration,
        ack_delay_exponent: u8,
    ) -> Result<(), TransportError> {
        if ack_delay_exponent > 20 {
            return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                "ack_delay_exponent exceeds 20",
            ));
        }
        if max_ack_delay >= Duration::from_millis(1 << 14) {
            return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                "max_ack_delay exceeds 2^14 ms",
            ));
        }
        self.peer_max_ack_delay = max_ack_delay;
        self.peer_ack_delay_exponent = ack_delay_exponent;
        Ok(())
    }

    /// Whether the connection is currently limited by the application rather than the window
    pub fn set_app_limited(&mut self, app_limited: bool) {
        self.congestion.set_app_limited(app_limited);
    }

    /// Number of bytes that may be sent right now
    pub fn remaining_congestion_window(&self) -> u64 {
        self.congestion.remaining_window()
    }

    /// Current state of the congestion controller
    pub fn congestion_state(&self) -> &dyn Controller {
        &*self.congestion
    }

    /// Bytes currently in flight
    pub fn bytes_in_flight(&self) -> u64 {
        self.congestion.bytes_in_flight()
    }

    /// Largest UDP payload that may currently be sent
    pub fn current_mtu(&self) -> u16 {
        self.current_mtu
    }

    /// UDP payload size that is always safe to send, e.g. for ACK-only packets
    pub fn safe_packet_size(&self) -> u16 {
        self.mtud.min_mtu()
    }

    /// An unacknowledged packet that is still tracked
    pub fn get_sent_packet(&self, space: SpaceId, number: u64) -> Option<&SentPacket> {
        self.spaces[space].sent_packets.get(&number)
    }

    /// Number of unacknowledged ack-eliciting packets in `space`
    pub fn ack_eliciting_sent_packets(&self, space: SpaceId) -> usize {
        self.spaces[space]
            .sent_packets
            .values()
            .filter(|packet| packet.ack_eliciting)
            .count()
    }

    /// Largest packet number of `space` acknowledged by the peer
    pub fn largest_acked_packet(&self, space: SpaceId) -> Option<u64> {
        self.spaces[space].largest_acked_packet
    }

    /// Consecutive probe timeouts without an acknowledgement
    pub fn pto_count(&self) -> u32 {
        self.pto_count
    }

    /// Current RTT estimates
    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Current statistics
    pub fn stats(&self) -> RecoveryStats {
        let mut stats = self.stats;
        stats.path.rtt = self.rtt.get();
        stats.path.cwnd = self.congestion.window();
        stats.path.current_mtu = self.current_mtu;
        stats.mtud = self.mtud.stats();
        stats
    }
}

/// Numbers of the tracked packets in `space` that `ack` acknowledges, ascending
fn newly_acked(space: &PacketSpace, ack: &Ack) -> Vec<u64> {
    // Avoid DoS from unreasonably huge ack ranges by filtering out just the new acks.
    let Some(&lowest) = space.sent_packets.keys().next() else {
        return Vec::new();
    };
    let mut numbers = Vec::new();
    for range in ack.iter() {
        if *range.end() < lowest {
            break;
        }
        numbers.extend(space.sent_packets.range(range).map(|(&number, _)| number));
    }
    numbers.sort_unstable();
    numbers
}

/// Events of interest to the connection
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Event {
    /// A sent packet was acknowledged; its frames were delivered
    PacketAcked {
        /// Space the packet was sent in
        space: SpaceId,
        /// Packet number
        number: u64,
        /// The packet
        packet: SentPacket,
    },
    /// A sent packet was declared lost; its retransmittable frames should be sent again
    PacketLost {
        /// Space the packet was sent in
        space: SpaceId,
        /// Packet number
        number: u64,
        /// The packet
        packet: SentPacket,
    },
    /// A probe timeout fired and an ack-eliciting packet should be sent right away
    SendProbe(ProbeRequest),
    /// The PMTU changed
    MtuUpdated {
        /// The new largest UDP payload size
        mtu: u16,
    },
}

/// Request to send an ack-eliciting packet after a probe timeout
///
/// New data is preferred. Without any, the frames in `retransmit` should be sent again, and
/// failing that a PING frame.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProbeRequest {
    /// Space to send the probe in
    pub space: SpaceId,
    /// Retransmittable frames of the oldest unacknowledged ack-eliciting packet in `space`
    pub retransmit: Vec<Frame>,
}

/// Reasons why a connection might be lost
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The peer violated the QUIC specification as understood by this implementation
    #[error(transparent)]
    TransportError(#[from] TransportError),
    /// The network path cannot carry datagrams of the minimum PMTU
    #[error("path does not carry datagrams of {size} bytes")]
    PmtuUnreachable {
        /// Size of the probes that were lost
        size: u16,
    },
    /// Not even a minimal ACK frame fits in the available space
    #[error("ACK frame does not fit in {max_size} bytes")]
    AckFrameTooLarge {
        /// Space that was available
        max_size: usize,
    },
    /// The peer has become unreachable
    #[error("timed out")]
    TimedOut,
}
