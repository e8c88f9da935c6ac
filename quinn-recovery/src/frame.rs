use std::{fmt, ops::Range, ops::RangeInclusive};

use bytes::{Buf, BufMut};

use crate::{
    coding::{BufExt, BufMutExt, UnexpectedEnd},
    transport_error::Error as TransportError,
    varint,
};

const ACK_FRAME_TYPE: u8 = 0x02;

/// Contents of an ACK frame
///
/// A snapshot of the acknowledged packet numbers of one packet number space, laid out the way
/// RFC 9000 §19.3 encodes them: the largest acknowledged packet number, the length of the first
/// (highest) contiguous range, then `(gap, range)` pairs descending towards smaller packet
/// numbers. As on the wire, every length is one less than the number of packets it describes.
#[derive(Clone, Eq, PartialEq)]
pub struct Ack {
    /// Largest packet number being acknowledged
    pub largest: u64,
    /// Time since the largest packet was received, in units of `2^ack_delay_exponent`
    /// microseconds
    pub delay: u64,
    /// Number of packets below `largest` that are acknowledged contiguously with it
    pub first_range: u64,
    /// `(gap, range)` pairs, from the most recent to the oldest
    pub ranges: Vec<(u64, u64)>,
}

impl Ack {
    /// Encoded size of an ACK frame without any additional ranges
    pub(crate) fn minimal_size(largest: u64, delay: u64, first_range: u64) -> usize {
        1 + varint::size_of(largest)
            + varint::size_of(delay)
            + varint::size_of(0)
            + varint::size_of(first_range)
    }

    /// Number of bytes this frame occupies once encoded
    pub fn size(&self) -> usize {
        let ranges = self
            .ranges
            .iter()
            .map(|&(gap, len)| varint::size_of(gap) + varint::size_of(len))
            .sum::<usize>();
        1 + varint::size_of(self.largest)
            + varint::size_of(self.delay)
            + varint::size_of(self.ranges.len() as u64)
            + varint::size_of(self.first_range)
            + ranges
    }

    /// Smallest packet number covered by this frame, or an error if the ranges underflow
    pub fn smallest(&self) -> Result<u64, TransportError> {
        let mut smallest = self
            .largest
            .checked_sub(self.first_range)
            .ok_or_else(|| malformed("first ACK range exceeds largest acknowledged"))?;
        for &(gap, len) in &self.ranges {
            smallest = smallest
                .checked_sub(gap)
                .and_then(|x| x.checked_sub(2))
                .and_then(|x| x.checked_sub(len))
                .ok_or_else(|| malformed("ACK range below packet number 0"))?;
        }
        Ok(smallest)
    }

    /// Iterate over the acknowledged ranges, from the largest to the smallest packet numbers
    pub fn iter(&self) -> AckIter<'_> {
        self.into_iter()
    }

    /// Append the encoding of this frame to `buf`
    pub fn encode<W: BufMut>(&self, buf: &mut W) {
        buf.put_u8(ACK_FRAME_TYPE);
        buf.write_var(self.largest);
        buf.write_var(self.delay);
        buf.write_var(self.ranges.len() as u64);
        buf.write_var(self.first_range);
        for &(gap, len) in &self.ranges {
            buf.write_var(gap);
            buf.write_var(len);
        }
    }

    /// Decode an ACK frame, including its type byte
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        if buf.get_byte()? != ACK_FRAME_TYPE {
            return Err(UnexpectedEnd);
        }
        let largest = buf.get_var()?;
        let delay = buf.get_var()?;
        let count = buf.get_var()?;
        let first_range = buf.get_var()?;
        // Each pair needs at least two bytes, which bounds the allocation
        if count > buf.remaining() as u64 / 2 {
            return Err(UnexpectedEnd);
        }
        let mut ranges = Vec::with_capacity(count as usize);
        for _ in 0..count {
            ranges.push((buf.get_var()?, buf.get_var()?));
        }
        Ok(Self {
            largest,
            delay,
            first_range,
            ranges,
        })
    }
}

fn malformed(reason: &str) -> TransportError {
    TransportError {
        frame: Some(ACK_FRAME_TYPE.into()),
        ..TransportError::FRAME_ENCODING_ERROR(reason)
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ack")
            .field("largest", &self.largest)
            .field("delay", &self.delay)
            .field("ranges", &self.iter().collect::<Vec<_>>())
            .finish()
    }
}

impl<'a> IntoIterator for &'a Ack {
    type Item = RangeInclusive<u64>;
    type IntoIter = AckIter<'a>;

    fn into_iter(self) -> AckIter<'a> {
        AckIter {
            next: Some((self.largest, self.first_range)),
            ranges: self.ranges.iter(),
        }
    }
}

/// Iterator over the packet number ranges of an [`Ack`], largest first
///
/// Iteration stops early if a range would extend below packet number 0.
pub struct AckIter<'a> {
    next: Option<(u64, u64)>,
    ranges: std::slice::Iter<'a, (u64, u64)>,
}

impl Iterator for AckIter<'_> {
    type Item = RangeInclusive<u64>;
    fn next(&mut self) -> Option<RangeInclusive<u64>> {
        let (largest, len) = self.next.take()?;
        let smallest = largest.checked_sub(len)?;
        self.next = self.ranges.next().and_then(|&(gap, len)| {
            let largest = smallest.checked_sub(gap)?.checked_sub(2)?;
            Some((largest, len))
        });
        Some(smallest..=largest)
    }
}

/// Frames whose delivery is tracked by the recovery logic
///
/// Only the information needed to retransmit or release a frame is kept; payload bytes remain
/// with the connection's send buffers.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    /// Padding, which makes a packet count towards bytes in flight without eliciting an ACK
    Padding,
    /// A PING frame
    Ping,
    /// An ACK frame with the given largest acknowledged packet number
    Ack {
        /// Largest packet number acknowledged by the frame
        largest: u64,
    },
    /// CRYPTO frame data
    Crypto {
        /// Offset in the crypto stream
        offset: u64,
        /// Number of bytes carried
        len: u64,
    },
    /// STREAM frame data
    Stream(StreamMeta),
    /// Connection-level flow control credit
    MaxData(u64),
    /// HANDSHAKE_DONE
    HandshakeDone,
}

impl Frame {
    /// Whether the frame obliges the peer to send an acknowledgement
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(self, Self::Padding | Self::Ack { .. })
    }

    /// Whether the frame must be sent again if the packet carrying it is lost
    pub fn is_retransmittable(&self) -> bool {
        !matches!(self, Self::Padding | Self::Ping | Self::Ack { .. })
    }
}

/// Location of stream data carried by a STREAM frame
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StreamMeta {
    /// Stream identifier
    pub id: u64,
    /// Byte range of the stream carried
    pub offsets: Range<u64>,
    /// Whether the frame carries the end of the stream
    pub fin: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn ack_coding() {
        // Acknowledges 0..=1 and 3..=4
        let ack = Ack {
            largest: 4,
            delay: 42,
            first_range: 1,
            ranges: vec![(0, 1)],
        };
        let mut buf = Vec::new();
        ack.encode(&mut buf);
        assert_eq!(buf, [0x02, 4, 42, 1, 1, 0, 1]);
        assert_eq!(buf.len(), ack.size());

        let decoded = Ack::decode(&mut &buf[..]).unwrap();
        assert_eq!(decoded, ack);
        assert_eq!(decoded.iter().collect::<Vec<_>>(), [3..=4, 0..=1]);
        assert_eq!(decoded.smallest(), Ok(0));
    }

    #[test]
    fn underflowing_ranges_are_rejected() {
        let ack = Ack {
            largest: 4,
            delay: 0,
            first_range: 1,
            ranges: vec![(1, 1)],
        };
        let err = ack.smallest().unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::FRAME_ENCODING_ERROR);
        // The iterator never wraps around
        assert_eq!(ack.iter().collect::<Vec<_>>(), [3..=4]);

        let ack = Ack {
            largest: 2,
            delay: 0,
            first_range: 3,
            ranges: vec![],
        };
        assert!(ack.smallest().is_err());
    }

    #[test]
    fn truncated_frame() {
        let buf = [0x02, 4, 42, 5, 1, 0];
        assert_matches!(Ack::decode(&mut &buf[..]), Err(UnexpectedEnd));
    }

    #[test]
    fn ack_eliciting_frames() {
        assert!(!Frame::Padding.is_ack_eliciting());
        assert!(!Frame::Ack { largest: 3 }.is_ack_eliciting());
        assert!(Frame::Ping.is_ack_eliciting());
        assert!(!Frame::Ping.is_retransmittable());
        assert!(Frame::MaxData(10).is_retransmittable());
    }
}
