//! Checked reads and writes of the primitives making up an ACK frame

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::varint;

/// Error indicating that the provided buffer was too small
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
#[error("unexpected end of buffer")]
pub struct UnexpectedEnd;

pub(crate) type Result<T> = ::std::result::Result<T, UnexpectedEnd>;

/// Reads that fail on a short buffer instead of panicking
pub(crate) trait BufExt {
    fn get_byte(&mut self) -> Result<u8>;
    fn get_var(&mut self) -> Result<u64>;
}

impl<T: Buf> BufExt for T {
    fn get_byte(&mut self) -> Result<u8> {
        if !self.has_remaining() {
            return Err(UnexpectedEnd);
        }
        Ok(self.get_u8())
    }

    fn get_var(&mut self) -> Result<u64> {
        varint::decode(self)
    }
}

pub(crate) trait BufMutExt {
    fn write_var(&mut self, x: u64);
}

impl<T: BufMut> BufMutExt for T {
    fn write_var(&mut self, x: u64) {
        varint::encode(x, self);
    }
}
