use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use alloy_primitives::U256;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proximity;

/// Byte width of an overlay address.
pub const ADDRESS_LENGTH: usize = 32;

/// Bit width of an overlay address.
pub const BIT_LENGTH: usize = ADDRESS_LENGTH * 8;

/// Maximum proximity order. Equal addresses saturate here.
pub const MAX_PO: u8 = 255;

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("invalid address length {0}, expected {ADDRESS_LENGTH}")]
    InvalidLength(usize),
    #[error("invalid hex address: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Fixed-width overlay address, the routing key in the DHT.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct OverlayAddress([u8; ADDRESS_LENGTH]);

impl OverlayAddress {
    pub const fn new(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, AddressError> {
        let bytes: [u8; ADDRESS_LENGTH] = slice
            .try_into()
            .map_err(|_| AddressError::InvalidLength(slice.len()))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Proximity order to `other`: the count of leading shared bits,
    /// capped at [`MAX_PO`]. `a.proximity(&a) == MAX_PO`.
    pub fn proximity(&self, other: &Self) -> u8 {
        match proximity::leading_equal_bits(&self.0, &other.0) {
            Some(bit) => bit.min(MAX_PO as usize) as u8,
            None => MAX_PO,
        }
    }

    /// Proximity order counted from bit `offset`, uncapped.
    ///
    /// Returns the absolute index of the first differing bit at or after
    /// `offset`, and whether the addresses are equal over the compared
    /// range (in which case the order is the full [`BIT_LENGTH`]).
    pub fn proximity_from(&self, other: &Self, offset: usize) -> (usize, bool) {
        match proximity::leading_equal_bits_from(&self.0, &other.0, offset) {
            Some(bit) => (bit, false),
            None => (BIT_LENGTH, true),
        }
    }

    /// XOR distance to `other` as a big-endian integer.
    pub fn distance(&self, other: &Self) -> U256 {
        let mut xored = [0u8; ADDRESS_LENGTH];
        for (r, (a, b)) in xored.iter_mut().zip(self.0.iter().zip(other.0.iter())) {
            *r = a ^ b;
        }
        U256::from_be_slice(&xored)
    }

    /// Compares the distances `x -> self` and `y -> self`, with `self`
    /// as the pivot. `Less` means `x` is closer. `Equal` implies
    /// `x == y`.
    pub fn distance_cmp(&self, x: &Self, y: &Self) -> Ordering {
        for ((p, a), b) in self.0.iter().zip(x.0.iter()).zip(y.0.iter()) {
            let dx = a ^ p;
            let dy = b ^ p;
            if dx != dy {
                return if dx < dy {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
            }
        }
        Ordering::Equal
    }

    /// A uniformly random address.
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; ADDRESS_LENGTH];
        rng.fill(&mut bytes[..]);
        Self(bytes)
    }

    /// A random address at exactly proximity order `po` to `base`:
    /// the first `po` bits are copied from `base`, bit `po` is flipped,
    /// the remainder is random.
    pub fn random_at<R: Rng>(rng: &mut R, base: &Self, po: u8) -> Self {
        let mut addr = Self::random(rng);
        let split = po as usize;
        for bit in 0..split {
            addr.assign_bit(bit, base.bit(bit));
        }
        addr.assign_bit(split, !base.bit(split));
        addr
    }

    fn bit(&self, idx: usize) -> bool {
        let byte = self.0.get(idx / 8).copied().unwrap_or(0);
        (byte >> (7 - idx % 8)) & 1 != 0
    }

    fn assign_bit(&mut self, idx: usize, value: bool) {
        if let Some(byte) = self.0.get_mut(idx / 8) {
            let mask = 1u8 << (7 - idx % 8);
            if value {
                *byte |= mask;
            } else {
                *byte &= !mask;
            }
        }
    }
}

impl From<[u8; ADDRESS_LENGTH]> for OverlayAddress {
    fn from(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for OverlayAddress {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for OverlayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for OverlayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // short form: first four bytes are enough to tell peers apart in logs
        let short: &[u8] = self.0.get(..4).unwrap_or(&self.0);
        write!(f, "OverlayAddress({}..)", hex::encode(short))
    }
}

impl FromStr for OverlayAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim_start_matches("0x"))?;
        Self::from_slice(&bytes)
    }
}
