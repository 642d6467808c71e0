//! Neighbour state module
//!
//! Per-neighbour cooperative state and the mutable record every
//! connection handler reads and writes through the registry.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::peer::machine::ProtocolState;
use crate::peer::Bitfield;

/// Peer identity, fixed at handshake time
pub type PeerId = u32;

/// A neighbour's cooperative state, from our perspective
///
/// "Choked" means we currently refuse to upload to them; "interested"
/// means they signalled wanting a piece we have. Only interested
/// neighbours are ever eligible for an unchoke decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooperativeState {
    /// No interest signal seen yet
    Unknown,
    /// Withholding upload, they want a piece
    ChokedAndInterested,
    /// Withholding upload, they want nothing we have
    ChokedAndNotInterested,
    /// Uploading permitted, they want a piece
    UnchokedAndInterested,
    /// Terminal; the connection was torn down
    Shutdown,
}

impl CooperativeState {
    /// True for both interested variants
    pub fn is_interested(&self) -> bool {
        matches!(self, CooperativeState::ChokedAndInterested | CooperativeState::UnchokedAndInterested)
    }

    /// True when upload to this neighbour is currently permitted
    pub fn is_unchoked(&self) -> bool {
        matches!(self, CooperativeState::UnchokedAndInterested)
    }

    /// True once the record reached the terminal state
    pub fn is_shutdown(&self) -> bool {
        matches!(self, CooperativeState::Shutdown)
    }

    /// Promote to the interested variant of the current choke status
    ///
    /// Already-interested states are unchanged; `Shutdown` rejects the
    /// transition.
    pub fn promote_interested(self) -> CooperativeState {
        match self {
            CooperativeState::Unknown | CooperativeState::ChokedAndNotInterested => {
                CooperativeState::ChokedAndInterested
            }
            other => other,
        }
    }

    /// Demote to choked-and-not-interested from any non-terminal state
    pub fn demote_not_interested(self) -> CooperativeState {
        match self {
            CooperativeState::Shutdown => CooperativeState::Shutdown,
            _ => CooperativeState::ChokedAndNotInterested,
        }
    }

    /// Apply a choke-scheduler decision
    ///
    /// Only interested neighbours move; an unchoke for an uninterested
    /// or terminal record is a no-op.
    pub fn apply_choke_decision(self, choke: bool) -> CooperativeState {
        match (self, choke) {
            (CooperativeState::ChokedAndInterested, false) => CooperativeState::UnchokedAndInterested,
            (CooperativeState::UnchokedAndInterested, true) => CooperativeState::ChokedAndInterested,
            (other, _) => other,
        }
    }
}

impl Default for CooperativeState {
    fn default() -> Self {
        CooperativeState::Unknown
    }
}

/// Per-neighbour mutable state
///
/// Created when a connection is established, mutated only through the
/// registry's compound operations, forced to `Shutdown` on teardown and
/// then left in the map for accounting.
#[derive(Debug)]
pub struct Neighbour {
    /// Neighbour identity
    pub peer_id: PeerId,
    /// Pieces they are known to have
    pub bitfield: Bitfield,
    /// Cooperative state from our perspective
    pub state: CooperativeState,
    /// Last-measured download throughput, bytes per second
    pub download_speed: f64,
    /// Piece most recently requested from this neighbour, if in flight
    pub requested_piece: Option<u32>,
    /// Whether the terminating bitfield handshake acknowledgment was seen
    pub received_bitfield_ack: bool,
    /// Inbound transition queue of this neighbour's connection handler
    transitions: mpsc::UnboundedSender<ProtocolState>,
}

impl Neighbour {
    /// Create a record for a freshly established connection
    pub fn new(peer_id: PeerId, num_pieces: usize, transitions: mpsc::UnboundedSender<ProtocolState>) -> Self {
        Self {
            peer_id,
            bitfield: Bitfield::new(num_pieces),
            state: CooperativeState::Unknown,
            download_speed: 0.0,
            requested_piece: None,
            received_bitfield_ack: false,
            transitions,
        }
    }

    /// Queue a transition for this neighbour's own connection handler
    ///
    /// Producers must never write to another connection's socket; the
    /// handler applies the transition at its next safe point.
    pub fn enqueue_transition(&self, state: ProtocolState) {
        if self.state.is_shutdown() {
            debug!("Dropping transition for shut-down peer {}", self.peer_id);
            return;
        }
        if self.transitions.send(state).is_err() {
            warn!("Handler for peer {} is gone; transition dropped", self.peer_id);
        }
    }
}
