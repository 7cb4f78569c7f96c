//! Capability-indexed Kademlia overlay.
//!
//! The [`Overlay`] keeps two pots of peers keyed by proximity order to
//! the local base address: every address it has ever been told about
//! (known) and the subset it is currently connected to (live). On top
//! of that it maintains capability sub-indices, computes the
//! neighbourhood depth, suggests the next address to dial and fans out
//! typed [`TopologyEvent`]s.

mod config;
mod events;
mod kademlia;
mod peer;

use thiserror::Error;

pub use config::OverlayConfig;
pub use events::{DepthChange, TopologyEvent};
pub use kademlia::{Health, Overlay, SuggestedPeer};
pub use peer::PeerAddr;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OverlayError {
    #[error("refusing to register the base address")]
    SelfRegistration,
    #[error("no capability index named {0:?}")]
    UnknownIndex(String),
    #[error("capability index {0:?} already registered")]
    DuplicateIndex(String),
}
