//! QUIC variable-length integers (RFC 9000 §16)
//!
//! Packet numbers, ACK delays and range lengths travel as varints, so their encoded sizes decide
//! how many ranges fit into an ACK frame of a given size.

use bytes::{Buf, BufMut};

use crate::coding::UnexpectedEnd;

/// The largest value a varint can carry, 2^62 - 1
pub(crate) const MAX: u64 = (1 << 62) - 1;

/// Number of bytes needed to encode `x`
///
/// Values that cannot be represented are reported with the maximum size.
pub(crate) const fn size_of(x: u64) -> usize {
    if x < 1 << 6 {
        1
    } else if x < 1 << 14 {
        2
    } else if x < 1 << 30 {
        4
    } else {
        8
    }
}

/// Read one varint, whose two most significant bits give its length
pub(crate) fn decode<B: Buf>(r: &mut B) -> Result<u64, UnexpectedEnd> {
    if !r.has_remaining() {
        return Err(UnexpectedEnd);
    }
    let first = r.get_u8();
    let len = 1usize << (first >> 6);
    if r.remaining() < len - 1 {
        return Err(UnexpectedEnd);
    }
    let mut x = u64::from(first & 0b0011_1111);
    for _ in 1..len {
        x = (x << 8) | u64::from(r.get_u8());
    }
    Ok(x)
}

/// Write `x` using the shortest encoding, clamping it to [`MAX`]
pub(crate) fn encode<B: BufMut>(x: u64, w: &mut B) {
    debug_assert!(x <= MAX, "varint overflow: {x}");
    let x = x.min(MAX);
    match size_of(x) {
        1 => w.put_u8(x as u8),
        2 => w.put_u16((0b01 << 14) | x as u16),
        4 => w.put_u32((0b10 << 30) | x as u32),
        _ => w.put_u64((0b11 << 62) | x),
    }
}
