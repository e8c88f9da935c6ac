//! Loss recovery, congestion control and path MTU discovery for QUIC
//!
//! quinn-recovery contains the deterministic reliability core of a QUIC connection: it keeps track
//! of which packets have been received and must be acknowledged, which packets have been sent and
//! are still unacknowledged, estimates the round-trip time of the path, declares packets lost,
//! schedules probe timeouts, limits the amount of data in flight and searches for the largest
//! datagram size the network path can carry. It contains no networking code and never reads the
//! system clock: every operation takes the current time as an argument.
//!
//! The entry point is [`Recovery`], which owns all of the state for a single connection and path.
//! Packet assembly, stream state and cryptography stay with the caller, who feeds sent packets,
//! received packets and ACK frames into [`Recovery`], drives its timers through
//! [`Recovery::poll_timeout`] and [`Recovery::handle_timeout`], and reacts to the [`Event`]s
//! returned by [`Recovery::poll`].

#![warn(missing_docs)]
#![cfg_attr(test, allow(dead_code))]
// Fixes welcome:
#![allow(clippy::too_many_arguments)]

mod coding;
mod packet;
mod path;
mod timer;
mod varint;

pub use crate::packet::SpaceId;
pub use crate::path::{AddressFamily, PathProperties};
pub use crate::coding::UnexpectedEnd;

mod config;
pub use crate::config::{
    CandidateSequenceKind, ConfigError, MtuDiscoveryConfig, PmtuValidatorConfig, RecoveryConfig,
    ReduceThreshold, ValidatorTime,
};

pub mod congestion;

mod frame;
pub use crate::frame::{Ack, AckIter, Frame, StreamMeta};

mod mtud;

mod recovery;
pub use crate::recovery::{
    ConnectionError, Event, ProbeRequest, Recovery, RttEstimator, SentPacket,
};

mod stats;
pub use crate::stats::{MtudStats, PathStats, RecoveryStats};

mod transport_error;
pub use crate::transport_error::{Code as TransportErrorCode, Error as TransportError};

#[cfg(test)]
mod tests;

pub(crate) use std::time::{Duration, Instant};

/// The maximum UDP payload size a path can ever carry (IPv6 jumbograms aside)
pub const MAX_UDP_PAYLOAD: u16 = 65527;

/// The UDP payload size every QUIC path is required to support
pub const INITIAL_MTU: u16 = 1200;

/// Clock granularity used by the loss detection and probe timeout computations
pub const TIMER_GRANULARITY: Duration = Duration::from_millis(1);

/// Maximum number of gap ranges remembered per packet number space
const MAX_ACK_BLOCKS: usize = 64;
