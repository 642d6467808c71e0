//! piece-exchange
//!
//! A cooperative peer-to-peer piece-exchange node: peers reconstruct a
//! shared file by trading fixed-size pieces, granting upload permission
//! to their fastest interested neighbours and rotating one optimistic
//! unchoke slot.

pub mod cli;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod storage;

pub use error::ExchangeError;

pub use cli::{CliArgs, CommonConfig, Config, PeerEntry};
pub use peer::{
    Bitfield, ChokeScheduler, ConnectionHandler, CooperativeState, LocalPeer, NeighbourRegistry,
    NeighbourSummary, PeerId, ProtocolState,
};
pub use protocol::{ExchangeWire, Handshake, Message, MessageId, SpeedSample, WireProtocol};
pub use session::Session;
pub use storage::{FilePieceStore, MemoryPieceStore, PieceStore};
