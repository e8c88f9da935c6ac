//! Logic for controlling the rate at which data is sent

use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

use crate::Instant;

mod new_reno;
mod no_limit;

pub use new_reno::{NewReno, NewRenoConfig};
pub use no_limit::NoLimit;

/// Common interface for different congestion controllers
///
/// Controllers account for bytes in flight themselves: every in-flight packet passed to
/// [`Controller::on_sent`] is later handed back exactly once, through [`Controller::on_ack`],
/// [`Controller::on_packets_lost`] or [`Controller::on_discarded`].
pub trait Controller: Send + Sync {
    /// An in-flight packet of `bytes` bytes was just sent
    fn on_sent(&mut self, now: Instant, bytes: u64);

    /// Delivery of an in-flight packet sent at `sent` was confirmed
    fn on_ack(&mut self, now: Instant, sent: Instant, bytes: u64);

    /// A batch of in-flight packets was declared lost
    ///
    /// `persistent_congestion` indicates whether the loss of the batch spans more than the
    /// persistent congestion period.
    fn on_packets_lost(&mut self, now: Instant, lost: &[LostPacket], persistent_congestion: bool);

    /// In-flight packets were forgotten without being acknowledged or lost, e.g. because their
    /// packet number space was discarded
    fn on_discarded(&mut self, bytes: u64);

    /// The known MTU for the current network path has been updated
    fn on_mtu_update(&mut self, new_mtu: u16);

    /// Whether the connection is currently limited by the application rather than the window
    fn set_app_limited(&mut self, app_limited: bool);

    /// Number of ack-eliciting bytes that may be in flight
    fn window(&self) -> u64;

    /// Number of bytes currently in flight
    fn bytes_in_flight(&self) -> u64;

    /// Number of bytes that may be sent right now
    fn remaining_window(&self) -> u64 {
        self.window().saturating_sub(self.bytes_in_flight())
    }

    /// Retrieve implementation-specific metrics
    fn metrics(&self) -> ControllerMetrics {
        ControllerMetrics {
            congestion_window: self.window(),
            bytes_in_flight: self.bytes_in_flight(),
            ssthresh: None,
        }
    }

    /// Initial congestion window
    fn initial_window(&self) -> u64;
}

/// Common congestion controller metrics
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub struct ControllerMetrics {
    /// Congestion window (bytes)
    pub congestion_window: u64,
    /// Bytes in flight
    pub bytes_in_flight: u64,
    /// Slow start threshold (bytes)
    pub ssthresh: Option<u64>,
}

/// A packet that was declared lost, as seen by the congestion controller
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LostPacket {
    /// When the packet was sent
    pub time_sent: Instant,
    /// Size of the packet
    pub bytes: u64,
    /// Whether the packet was a PMTU probe, whose loss is no sign of congestion
    pub pmtu_probe: bool,
}

/// Selects the congestion controller used by a connection
#[derive(Debug, Clone)]
pub enum CongestionControl {
    /// Never limit the amount of data in flight
    NoLimit,
    /// NewReno, as described in RFC 9002 §7
    NewReno(Arc<NewRenoConfig>),
}

impl CongestionControl {
    /// Construct a fresh controller for a path whose max datagram size is `current_mtu`
    pub(crate) fn build(&self, now: Instant, current_mtu: u16) -> Congestion {
        match self {
            Self::NoLimit => Congestion::NoLimit(NoLimit::new(current_mtu)),
            Self::NewReno(config) => {
                Congestion::NewReno(NewReno::new(config.clone(), now, current_mtu))
            }
        }
    }
}

impl Default for CongestionControl {
    fn default() -> Self {
        Self::NewReno(Arc::new(NewRenoConfig::default()))
    }
}

/// The congestion controller of a connection
#[derive(Debug, Clone)]
pub(crate) enum Congestion {
    NoLimit(NoLimit),
    NewReno(NewReno),
}

impl Deref for Congestion {
    type Target = dyn Controller;
    fn deref(&self) -> &Self::Target {
        match self {
            Self::NoLimit(x) => x,
            Self::NewReno(x) => x,
        }
    }
}

impl DerefMut for Congestion {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            Self::NoLimit(x) => x,
            Self::NewReno(x) => x,
        }
    }
}

/// Initial window of RFC 9002 §7.2 for a given max datagram size
pub(crate) fn default_initial_window(max_datagram_size: u64) -> u64 {
    (10 * max_datagram_size).min((2 * max_datagram_size).max(14720))
}
