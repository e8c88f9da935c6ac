use std::collections::VecDeque;

use tracing::trace;

use crate::{frame::Ack, varint, Duration, Instant, MAX_ACK_BLOCKS};

/// Packet numbers received in one packet number space that still have to be acknowledged
///
/// Received packet numbers are stored as the span between `smallest` and `largest` minus a list of
/// gaps, which keeps the common in-order case down to a couple of integers.
#[derive(Debug, Clone)]
pub(crate) struct PendingAcks {
    /// The packet with the largest packet number, and the time upon which it was received (used to
    /// calculate the ACK delay)
    largest: Option<(u64, Instant)>,
    /// Smallest packet number still reported in ACK frames
    smallest: u64,
    /// Packets numbered below this are no longer tracked
    floor: u64,
    /// Missing packet numbers between `smallest` and `largest`, ascending
    gaps: VecDeque<GapRange>,
    /// The number of ack-eliciting packets received since the last ACK frame was built
    ack_eliciting_since_last_ack: u32,
    ack_eliciting_threshold: u32,
    /// Whether every ack-eliciting packet is acknowledged right away
    always_immediate: bool,
    /// Whether an ACK should be sent now, even if that means sending an ACK-only packet
    immediate_ack_required: bool,
    /// The earliest ack-eliciting packet received since the last ACK was built, used to calculate
    /// the moment upon which `max_ack_delay` elapses
    earliest_unacked: Option<Instant>,
    /// Whether anything was received since the last ACK frame was built
    new_info: bool,
}

/// A run of unreceived packet numbers
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct GapRange {
    pub(crate) first: u64,
    pub(crate) last: u64,
}

impl PendingAcks {
    pub(crate) fn new(ack_eliciting_threshold: u32, always_immediate: bool) -> Self {
        Self {
            largest: None,
            smallest: 0,
            floor: 0,
            gaps: VecDeque::new(),
            ack_eliciting_since_last_ack: 0,
            ack_eliciting_threshold,
            always_immediate,
            immediate_ack_required: false,
            earliest_unacked: None,
            new_info: false,
        }
    }

    /// Handle receipt of a new packet
    ///
    /// Returns true if the max ack delay timer should be armed.
    pub(crate) fn on_packet_received(
        &mut self,
        now: Instant,
        packet_number: u64,
        ack_eliciting: bool,
        immediate: bool,
    ) -> bool {
        let prev_largest = self.largest.map(|(pn, _)| pn);
        if !self.insert(now, packet_number) {
            trace!(packet_number, "duplicate or obsolete packet");
            return false;
        }
        self.new_info = true;
        if !ack_eliciting {
            return false;
        }

        self.ack_eliciting_since_last_ack += 1;
        // Reordering, or a new gap, lets the peer detect losses sooner if acknowledged right away
        let out_of_order = prev_largest.is_some_and(|largest| {
            packet_number < largest || packet_number > largest + 1 || !self.gaps.is_empty()
        });
        self.immediate_ack_required |= self.always_immediate
            || immediate
            || out_of_order
            || self.ack_eliciting_since_last_ack >= self.ack_eliciting_threshold;

        if self.immediate_ack_required {
            self.earliest_unacked = None;
            return false;
        }
        if self.earliest_unacked.is_none() {
            self.earliest_unacked = Some(now);
            return true;
        }
        false
    }

    /// Record `packet_number` as received, returning false if nothing changed
    fn insert(&mut self, now: Instant, packet_number: u64) -> bool {
        if packet_number < self.floor {
            return false;
        }
        let Some((largest, _)) = self.largest else {
            self.largest = Some((packet_number, now));
            self.smallest = packet_number;
            return true;
        };

        if packet_number > largest {
            if packet_number > largest + 1 {
                self.gaps.push_back(GapRange {
                    first: largest + 1,
                    last: packet_number - 1,
                });
            }
            self.largest = Some((packet_number, now));
        } else if packet_number < self.smallest {
            if packet_number + 1 < self.smallest {
                self.gaps.push_front(GapRange {
                    first: packet_number + 1,
                    last: self.smallest - 1,
                });
            }
            self.smallest = packet_number;
        } else {
            let Some(index) = self
                .gaps
                .iter()
                .position(|gap| gap.first <= packet_number && packet_number <= gap.last)
            else {
                return false;
            };
            let gap = self.gaps[index];
            if gap.first == gap.last {
                self.gaps.remove(index);
            } else if packet_number == gap.first {
                self.gaps[index].first += 1;
            } else if packet_number == gap.last {
                self.gaps[index].last -= 1;
            } else {
                self.gaps[index].last = packet_number - 1;
                self.gaps.insert(
                    index + 1,
                    GapRange {
                        first: packet_number + 1,
                        last: gap.last,
                    },
                );
            }
        }

        while self.gaps.len() > MAX_ACK_BLOCKS {
            // Forget the oldest packets rather than keep an unbounded history
            if let Some(oldest) = self.gaps.pop_front() {
                self.smallest = oldest.last + 1;
                self.floor = self.smallest;
            }
        }
        true
    }

    pub(crate) fn on_max_ack_delay_timeout(&mut self) {
        self.immediate_ack_required = self.ack_eliciting_since_last_ack > 0;
        self.earliest_unacked = None;
    }

    pub(crate) fn max_ack_delay_timeout(&self, max_ack_delay: Duration) -> Option<Instant> {
        self.earliest_unacked
            .map(|earliest_unacked| earliest_unacked + max_ack_delay)
    }

    /// Whether an ACK frame should be sent without waiting for other data
    pub(crate) fn immediate_ack_required(&self) -> bool {
        self.immediate_ack_required && self.largest.is_some()
    }

    /// Whether anything was received since the last ACK frame was built
    pub(crate) fn has_new_info(&self) -> bool {
        self.new_info
    }

    /// The largest packet number received so far
    pub(crate) fn largest(&self) -> Option<u64> {
        self.largest.map(|(pn, _)| pn)
    }

    /// The outstanding gaps, ascending
    #[cfg(test)]
    pub(crate) fn gaps(&self) -> impl Iterator<Item = &GapRange> {
        self.gaps.iter()
    }

    /// Build an ACK frame no larger than `max_size` bytes
    ///
    /// Ranges are included from the most recent to the oldest until the budget is exhausted.
    /// Returns `None` if nothing was received or even a frame without additional ranges does not
    /// fit.
    pub(crate) fn generate(
        &mut self,
        now: Instant,
        max_size: usize,
        ack_delay_exponent: u8,
    ) -> Option<Ack> {
        let (largest, received) = self.largest?;
        let delay = micros(now.saturating_duration_since(received)) >> ack_delay_exponent;
        let top = self.gaps.back().map_or(self.smallest, |gap| gap.last + 1);
        let first_range = largest - top;

        let mut size = Ack::minimal_size(largest, delay, first_range);
        if size > max_size {
            return None;
        }

        let mut ranges = Vec::new();
        for (index, gap) in self.gaps.iter().enumerate().rev() {
            let start = match index {
                0 => self.smallest,
                _ => self.gaps[index - 1].last + 1,
            };
            let pair = (gap.last - gap.first, gap.first - 1 - start);
            let next_size = size - varint::size_of(ranges.len() as u64)
                + varint::size_of(ranges.len() as u64 + 1)
                + varint::size_of(pair.0)
                + varint::size_of(pair.1);
            if next_size > max_size {
                break;
            }
            ranges.push(pair);
            size = next_size;
        }

        self.immediate_ack_required = false;
        self.ack_eliciting_since_last_ack = 0;
        self.earliest_unacked = None;
        self.new_info = false;

        let ack = Ack {
            largest,
            delay,
            first_range,
            ranges,
        };
        debug_assert_eq!(ack.size(), size);
        trace!(?ack, "built ACK frame");
        Some(ack)
    }

    /// The peer acknowledged a packet carrying an ACK frame up to `largest_acked`
    ///
    /// Packets below it no longer need to be reported.
    pub(crate) fn on_packet_acked(&mut self, largest_acked: u64) {
        let Some(largest) = self.largest() else {
            return;
        };
        if largest_acked <= self.smallest || largest_acked > largest {
            return;
        }
        self.smallest = largest_acked;
        while let Some(gap) = self.gaps.front().copied() {
            if gap.first > self.smallest {
                break;
            }
            self.gaps.pop_front();
            if gap.last >= self.smallest {
                self.smallest = gap.last + 1;
            }
        }
        self.floor = self.floor.max(self.smallest);
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}
