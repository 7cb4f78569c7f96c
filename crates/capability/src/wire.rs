//! Wire codec for capability sets.
//!
//! Layout, all length prefixes little-endian:
//!
//! ```text
//! set        := count:u32 capability*
//! capability := id:u64 bit_count:u32 packed_bits
//! ```
//!
//! `packed_bits` is `ceil(bit_count / 8)` bytes, bits packed MSB-first
//! so bit 0 of the vector is the high bit of the first byte. Trailing
//! pad bits are zero.

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::{Capability, CapabilityError, CapabilitySet};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated capability payload, needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

impl Capability {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.id);
        buf.put_u32_le(self.bits.len() as u32);
        let mut byte = 0u8;
        for (i, bit) in self.bits.iter().enumerate() {
            if *bit {
                byte |= 0x80 >> (i % 8);
            }
            if i % 8 == 7 {
                buf.put_u8(byte);
                byte = 0;
            }
        }
        if self.bits.len() % 8 != 0 {
            buf.put_u8(byte);
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        ensure(buf, 12)?;
        let id = buf.get_u64_le();
        let bit_count = buf.get_u32_le() as usize;
        let byte_count = bit_count.div_ceil(8);
        ensure(buf, byte_count)?;
        let mut bits = Vec::with_capacity(bit_count);
        let mut byte = 0u8;
        for i in 0..bit_count {
            if i % 8 == 0 {
                byte = buf.get_u8();
            }
            bits.push(byte & (0x80 >> (i % 8)) != 0);
        }
        Ok(Self { id, bits })
    }

    pub fn encoded_len(&self) -> usize {
        8 + 4 + self.bits.len().div_ceil(8)
    }
}

impl CapabilitySet {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.caps.len() as u32);
        for cap in &self.caps {
            cap.encode(buf);
        }
    }

    /// Decodes a set, rebuilding the id lookup as it goes. Duplicate
    /// ids on the wire are rejected.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, WireError> {
        ensure(buf, 4)?;
        let count = buf.get_u32_le() as usize;
        let mut set = Self::new();
        for _ in 0..count {
            set.add(Capability::decode(buf)?)?;
        }
        Ok(set)
    }

    pub fn encoded_len(&self) -> usize {
        4 + self.caps.iter().map(Capability::encoded_len).sum::<usize>()
    }
}

fn ensure<B: Buf>(buf: &B, len: usize) -> Result<(), WireError> {
    if buf.remaining() < len {
        return Err(WireError::Truncated {
            needed: len - buf.remaining(),
        });
    }
    Ok(())
}
