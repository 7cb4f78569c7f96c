//! Typed topology notifications.

use crate::peer::PeerAddr;

/// Peer and depth changes, published in mutation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    /// A peer moved into the live pot.
    PeerAdded { peer: PeerAddr, po: u8 },
    /// A peer left the live pot.
    PeerRemoved { peer: PeerAddr },
    /// The neighbourhood depth moved.
    DepthChanged { old: u8, new: u8 },
}

/// One neighbourhood depth transition, delivered non-coalescing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthChange {
    pub old: u8,
    pub new: u8,
}
