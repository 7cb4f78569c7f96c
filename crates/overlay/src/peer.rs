use std::fmt;

use serde::{Deserialize, Serialize};
use waggle_capability::CapabilitySet;
use waggle_primitives::OverlayAddress;

/// A peer's full address: routing key, transport bytes and advertised
/// capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr {
    pub overlay: OverlayAddress,
    /// Opaque transport address, handed to the dialer as-is.
    pub underlay: Vec<u8>,
    pub capabilities: CapabilitySet,
}

impl PeerAddr {
    pub fn new(overlay: OverlayAddress, underlay: Vec<u8>, capabilities: CapabilitySet) -> Self {
        Self {
            overlay,
            underlay,
            capabilities,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.overlay)
    }
}
