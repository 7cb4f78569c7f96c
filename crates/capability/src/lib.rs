//! Capability flag vectors attached to peer addresses.
//!
//! A capability is a bit vector of feature flags scoped to a capability
//! family (its id). A peer advertises a [`CapabilitySet`] — at most one
//! capability per family — and consumers select peers by matching a
//! query set against it: every bit set in the query must be set by the
//! peer.

mod wire;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use wire::WireError;

/// Identifies a capability family. Bit vectors are only comparable
/// within the same family.
pub type CapabilityId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("bit index {idx} out of bounds (len={len})")]
    OutOfRange { idx: usize, len: usize },
    #[error("capability id {0} already registered")]
    DuplicateId(CapabilityId),
}

/// A bit vector of flags for one capability family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    id: CapabilityId,
    bits: Vec<bool>,
}

impl Capability {
    /// A capability with `bit_count` cleared bits.
    pub fn new(id: CapabilityId, bit_count: usize) -> Self {
        Self {
            id,
            bits: vec![false; bit_count],
        }
    }

    pub fn id(&self) -> CapabilityId {
        self.id
    }

    pub fn bit_count(&self) -> usize {
        self.bits.len()
    }

    /// Switches the bit at `idx` on.
    pub fn set(&mut self, idx: usize) -> Result<(), CapabilityError> {
        let len = self.bits.len();
        let bit = self
            .bits
            .get_mut(idx)
            .ok_or(CapabilityError::OutOfRange { idx, len })?;
        *bit = true;
        Ok(())
    }

    /// Switches the bit at `idx` off.
    pub fn unset(&mut self, idx: usize) -> Result<(), CapabilityError> {
        let len = self.bits.len();
        let bit = self
            .bits
            .get_mut(idx)
            .ok_or(CapabilityError::OutOfRange { idx, len })?;
        *bit = false;
        Ok(())
    }

    pub fn is_set(&self, idx: usize) -> bool {
        self.bits.get(idx).copied().unwrap_or(false)
    }

    /// Bit-for-bit equality of the flag vectors; the id is ignored.
    pub fn same_as(&self, other: &Self) -> bool {
        self.bits == other.bits
    }

    /// True iff every bit set in `query` is also set in the receiver.
    /// Vectors of different lengths never match.
    pub fn matches(&self, query: &Self) -> bool {
        if self.bits.len() != query.bits.len() {
            return false;
        }
        query
            .bits
            .iter()
            .zip(self.bits.iter())
            .all(|(wanted, have)| !wanted || *have)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.id)?;
        for bit in &self.bits {
            f.write_str(if *bit { "1" } else { "0" })?;
        }
        Ok(())
    }
}

/// Ordered collection of capabilities, at most one per family id.
///
/// Serializes as the plain capability list; the id→index map is
/// rebuilt on deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Capability>", into = "Vec<Capability>")]
pub struct CapabilitySet {
    caps: Vec<Capability>,
    index: HashMap<CapabilityId, usize>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a capability; fails if the family id is already present.
    pub fn add(&mut self, cap: Capability) -> Result<(), CapabilityError> {
        if self.index.contains_key(&cap.id) {
            return Err(CapabilityError::DuplicateId(cap.id));
        }
        self.index.insert(cap.id, self.caps.len());
        self.caps.push(cap);
        Ok(())
    }

    pub fn get(&self, id: CapabilityId) -> Option<&Capability> {
        self.index.get(&id).and_then(|&i| self.caps.get(i))
    }

    /// True iff every capability in `query` is present here and its
    /// flags are matched.
    pub fn match_all(&self, query: &Self) -> bool {
        query.caps.iter().all(|wanted| {
            self.get(wanted.id)
                .is_some_and(|have| have.matches(wanted))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.caps.iter()
    }

    pub fn len(&self) -> usize {
        self.caps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }
}

impl From<Vec<Capability>> for CapabilitySet {
    fn from(caps: Vec<Capability>) -> Self {
        let mut set = Self::new();
        for cap in caps {
            // first occurrence wins on duplicate ids in the raw list
            let _ = set.add(cap);
        }
        set
    }
}

impl From<CapabilitySet> for Vec<Capability> {
    fn from(set: CapabilitySet) -> Self {
        set.caps
    }
}

impl PartialEq for CapabilitySet {
    fn eq(&self, other: &Self) -> bool {
        self.caps == other.caps
    }
}

impl Eq for CapabilitySet {}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, cap) in self.caps.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{cap}")?;
        }
        Ok(())
    }
}
