//! Connection handshake
//!
//! The first exchange on every connection: a fixed 32-byte frame carrying
//! an 18-byte header, 10 zero bytes, and the sender's 4-byte peer id. The
//! state machine is only handed the stream after both sides validated it.

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tracing::{error, trace};

use crate::error::ExchangeError;
use crate::peer::PeerId;

/// Handshake header string
pub const HANDSHAKE_HEADER: &str = "P2PFILESHARINGPROJ";

/// Total handshake length in bytes: header + 10 zero bytes + peer id
pub const HANDSHAKE_LENGTH: usize = 32;

/// Connection handshake frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Sender's peer id
    pub peer_id: PeerId,
}

impl Handshake {
    /// Create a handshake carrying our peer id
    pub fn new(peer_id: PeerId) -> Self {
        Self { peer_id }
    }

    /// Serialize the handshake to its 32-byte wire form
    pub fn serialize(&self) -> Vec<u8> {
        trace!("Serializing handshake for peer {}", self.peer_id);
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LENGTH);
        buf.put_slice(HANDSHAKE_HEADER.as_bytes());
        buf.put_slice(&[0u8; 10]);
        buf.put_u32(self.peer_id);
        buf.to_vec()
    }

    /// Deserialize and validate a 32-byte handshake frame
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < HANDSHAKE_LENGTH {
            error!("Handshake too short: expected {} bytes, got {}", HANDSHAKE_LENGTH, data.len());
            return Err(ExchangeError::protocol_error_with_source(
                "Handshake too short",
                format!("expected {} bytes, got {}", HANDSHAKE_LENGTH, data.len()),
            )
            .into());
        }

        if &data[..18] != HANDSHAKE_HEADER.as_bytes() {
            error!("Invalid handshake header");
            return Err(ExchangeError::protocol_error("Invalid handshake header").into());
        }

        let peer_id = u32::from_be_bytes([data[28], data[29], data[30], data[31]]);
        trace!("Deserialized handshake from peer {}", peer_id);
        Ok(Self { peer_id })
    }
}
