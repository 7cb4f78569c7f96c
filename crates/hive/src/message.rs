//! Gossip wire format.
//!
//! Every frame starts with a one-byte message tag. Length prefixes are
//! little-endian `u32`.
//!
//! ```text
//! frame    := 0x00 peers | 0x01 sub_peers
//! peers    := count:u32 peer*
//! peer     := len:u32 overlay len:u32 underlay capability_set
//! sub_peers := depth:u8
//! ```

use bytes::{Buf, BufMut};
use thiserror::Error;
use waggle_capability::{CapabilitySet, WireError};
use waggle_overlay::PeerAddr;
use waggle_primitives::OverlayAddress;

const TAG_PEERS: u8 = 0;
const TAG_SUB_PEERS: u8 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("truncated message, needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("bad overlay address length {0}")]
    BadAddress(usize),
    #[error("capabilities: {0}")]
    Capabilities(#[from] WireError),
}

/// Topology gossip between connected peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HiveMessage {
    /// Known peer addresses worth dialing.
    Peers(Vec<PeerAddr>),
    /// The sender's neighbourhood depth.
    SubPeers { depth: u8 },
}

impl HiveMessage {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            Self::Peers(peers) => {
                buf.put_u8(TAG_PEERS);
                buf.put_u32_le(peers.len() as u32);
                for peer in peers {
                    encode_peer(peer, buf);
                }
            }
            Self::SubPeers { depth } => {
                buf.put_u8(TAG_SUB_PEERS);
                buf.put_u8(*depth);
            }
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, MessageError> {
        ensure(buf, 1)?;
        match buf.get_u8() {
            TAG_PEERS => {
                ensure(buf, 4)?;
                let count = buf.get_u32_le() as usize;
                let mut peers = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    peers.push(decode_peer(buf)?);
                }
                Ok(Self::Peers(peers))
            }
            TAG_SUB_PEERS => {
                ensure(buf, 1)?;
                Ok(Self::SubPeers {
                    depth: buf.get_u8(),
                })
            }
            tag => Err(MessageError::UnknownTag(tag)),
        }
    }
}

fn encode_peer<B: BufMut>(peer: &PeerAddr, buf: &mut B) {
    let overlay = peer.overlay.as_bytes();
    buf.put_u32_le(overlay.len() as u32);
    buf.put_slice(overlay);
    buf.put_u32_le(peer.underlay.len() as u32);
    buf.put_slice(&peer.underlay);
    peer.capabilities.encode(buf);
}

fn decode_peer<B: Buf>(buf: &mut B) -> Result<PeerAddr, MessageError> {
    let overlay_bytes = get_prefixed(buf)?;
    let overlay = OverlayAddress::from_slice(&overlay_bytes)
        .map_err(|_| MessageError::BadAddress(overlay_bytes.len()))?;
    let underlay = get_prefixed(buf)?;
    let capabilities = CapabilitySet::decode(buf)?;
    Ok(PeerAddr::new(overlay, underlay, capabilities))
}

fn get_prefixed<B: Buf>(buf: &mut B) -> Result<Vec<u8>, MessageError> {
    ensure(buf, 4)?;
    let len = buf.get_u32_le() as usize;
    ensure(buf, len)?;
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    Ok(bytes)
}

fn ensure<B: Buf>(buf: &B, len: usize) -> Result<(), MessageError> {
    if buf.remaining() < len {
        return Err(MessageError::Truncated {
            needed: len - buf.remaining(),
        });
    }
    Ok(())
}
