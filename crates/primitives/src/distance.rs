//! XOR distance over raw byte slices.

use std::cmp::Ordering;

use alloy_primitives::U256;

use crate::proximity::ProximityError;

/// Distance between two equal-length byte strings: the big-endian
/// integer cast of their XOR. Errors on length mismatch.
pub fn distance_between(x: &[u8], y: &[u8]) -> Result<U256, ProximityError> {
    if x.len() != y.len() {
        return Err(ProximityError::LengthMismatch {
            left: x.len(),
            right: y.len(),
        });
    }
    let xored: Vec<u8> = x.iter().zip(y.iter()).map(|(a, b)| a ^ b).collect();
    Ok(U256::from_be_slice(&xored))
}

/// Compares the distances `x -> pivot` and `y -> pivot`. `Less` means
/// `x` is closer to the pivot. Errors on length mismatch.
pub fn distance_cmp_slices(pivot: &[u8], x: &[u8], y: &[u8]) -> Result<Ordering, ProximityError> {
    if pivot.len() != x.len() || pivot.len() != y.len() {
        return Err(ProximityError::LengthMismatch {
            left: x.len(),
            right: y.len(),
        });
    }
    for ((p, a), b) in pivot.iter().zip(x.iter()).zip(y.iter()) {
        let dx = a ^ p;
        let dy = b ^ p;
        if dx != dy {
            return Ok(if dx < dy {
                Ordering::Less
            } else {
                Ordering::Greater
            });
        }
    }
    Ok(Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_of_known_bytes() {
        let x = [0x91u8, 0x00];
        let y = [0x82u8, 0x01];
        assert_eq!(distance_between(&x, &y), Ok(U256::from(0x1301u16)));
    }

    #[test]
    fn cmp_matches_distance_order() {
        let pivot = [0x91u8];
        let near = [0x82u8];
        let far = [0x12u8];
        assert_eq!(distance_cmp_slices(&pivot, &near, &far), Ok(Ordering::Less));
        assert_eq!(distance_cmp_slices(&pivot, &far, &near), Ok(Ordering::Greater));
    }

    #[test]
    fn length_mismatch_is_an_error() {
        assert!(distance_between(&[0u8; 2], &[0u8; 3]).is_err());
        assert!(distance_cmp_slices(&[0u8; 2], &[0u8; 2], &[0u8; 3]).is_err());
    }
}
