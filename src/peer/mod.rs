//! Peer management module
//!
//! Neighbour state, piece ownership tracking, the per-connection
//! protocol state machine, and the choke scheduler.

pub mod bitfield;
pub mod choker;
pub mod handler;
pub mod local;
pub mod machine;
pub mod registry;
pub mod selection;
pub mod state;

// Re-export main types
pub use bitfield::Bitfield;
pub use choker::ChokeScheduler;
pub use handler::ConnectionHandler;
pub use local::LocalPeer;
pub use machine::{ConnectionContext, ProtocolState};
pub use registry::{NeighbourRegistry, NeighbourSummary};
pub use state::{CooperativeState, Neighbour, PeerId};
