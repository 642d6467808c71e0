//! Piece-exchange protocol module
//!
//! Wire codec and handshake for the peer-to-peer piece exchange.

pub mod handshake;
pub mod message;
pub mod wire;

// Re-export main types
pub use handshake::{Handshake, HANDSHAKE_HEADER, HANDSHAKE_LENGTH};
pub use message::{Message, MessageId};
pub use wire::{ExchangeWire, SpeedSample, WireProtocol};
