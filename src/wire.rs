//! Checked cursor for decoding wire frames.
//!
//! Encoding goes straight through `bytes::BufMut` (big-endian); decoding uses
//! this reader so that a truncated or garbled frame surfaces as an error
//! instead of a panic.

use bytes::Bytes;

use crate::error::CausalError;

pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> WireReader<'a> {
        WireReader { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, nbytes: usize) -> Result<&'a [u8], CausalError> {
        if self.remaining() < nbytes {
            return Err(CausalError::Truncated(self.pos));
        }
        let s = &self.buf[self.pos..self.pos + nbytes];
        self.pos += nbytes;
        Ok(s)
    }

    pub fn read_u8(&mut self) -> Result<u8, CausalError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CausalError> {
        let s = self.take(2)?;
        Ok(u16::from_be_bytes([s[0], s[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, CausalError> {
        let s = self.take(4)?;
        Ok(u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, CausalError> {
        let s = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(s);
        Ok(u64::from_be_bytes(a))
    }

    pub fn read_uuid(&mut self) -> Result<uuid::Uuid, CausalError> {
        let s = self.take(16)?;
        let mut a = [0u8; 16];
        a.copy_from_slice(s);
        Ok(uuid::Uuid::from_bytes(a))
    }

    /// Copies `nbytes` out of the frame.
    pub fn read_bytes(&mut self, nbytes: usize) -> Result<Bytes, CausalError> {
        Ok(Bytes::copy_from_slice(self.take(nbytes)?))
    }
}
