//! Bit-level proximity over raw byte slices.
//!
//! [`crate::OverlayAddress`] wraps these for the fixed-width case; the
//! slice forms exist for callers that carry addresses as plain bytes
//! and must surface length mismatches as errors.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProximityError {
    #[error("address length mismatch: {left} vs {right}")]
    LengthMismatch { left: usize, right: usize },
}

/// Index of the first differing bit, or `None` when equal.
pub(crate) fn leading_equal_bits(a: &[u8], b: &[u8]) -> Option<usize> {
    leading_equal_bits_from(a, b, 0)
}

/// Index of the first differing bit at or after `offset`, or `None`
/// when the slices agree over the compared range.
pub(crate) fn leading_equal_bits_from(a: &[u8], b: &[u8], offset: usize) -> Option<usize> {
    let start = offset / 8;
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate().skip(start) {
        let mut oxo = x ^ y;
        if i == start {
            // mask off bits before the offset within the first byte
            oxo &= 0xffu8.checked_shr((offset % 8) as u32).unwrap_or(0);
        }
        if oxo != 0 {
            return Some(i * 8 + oxo.leading_zeros() as usize);
        }
    }
    None
}

/// Proximity order of two equal-length byte strings, counted from bit
/// `offset`. Errors on length mismatch.
pub fn proximity_slices(a: &[u8], b: &[u8], offset: usize) -> Result<(usize, bool), ProximityError> {
    if a.len() != b.len() {
        return Err(ProximityError::LengthMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    Ok(match leading_equal_bits_from(a, b, offset) {
        Some(bit) => (bit, false),
        None => (a.len() * 8, true),
    })
}
