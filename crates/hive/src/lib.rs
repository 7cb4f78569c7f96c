//! The hive keeps the overlay populated.
//!
//! It drives a periodic suggest-and-dial loop, exchanges the two
//! topology gossip messages (`peers` and `subPeers`) with connected
//! peers and carries known addresses across restarts through a
//! [`waggle_store::StateStore`].

mod hive;
mod message;

use auto_impl::auto_impl;
use thiserror::Error;
use waggle_overlay::OverlayError;
use waggle_primitives::OverlayAddress;
use waggle_store::StoreError;

pub use hive::{Hive, HiveConfig};
pub use message::{HiveMessage, MessageError};

/// Outbound connection attempts. Dialing is fire-and-forget: success
/// shows up later as a [`Hive::connected`] call from the transport.
#[auto_impl(&, Arc)]
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self, underlay: &[u8]);
}

/// Outbound gossip. Send failures are the transport's problem; an
/// unreachable peer will be reported disconnected soon enough.
#[auto_impl(&, Arc)]
pub trait PeerSender: Send + Sync + 'static {
    fn send(&self, to: &OverlayAddress, msg: HiveMessage);
}

#[derive(Debug, Error)]
pub enum HiveError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("overlay: {0}")]
    Overlay(#[from] OverlayError),
    #[error("message: {0}")]
    Message(#[from] MessageError),
}
