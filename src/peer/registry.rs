//! Neighbour registry
//!
//! The shared map of neighbour records, keyed by peer id and mutated by
//! every connection's task. Each entry point performs its whole
//! read-modify-write under one lock; callers never look a record up and
//! mutate it in a second step. Cross-connection effects (HAVE fan-out,
//! forced choke transitions) go through each record's handler queue,
//! never through another connection's socket.

use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use crate::peer::machine::ProtocolState;
use crate::peer::state::{CooperativeState, Neighbour};
use crate::peer::{Bitfield, PeerId};
use crate::protocol::SpeedSample;

/// Read-only view of one neighbour for the choke scheduler
#[derive(Debug, Clone, Copy)]
pub struct NeighbourSummary {
    pub peer_id: PeerId,
    pub state: CooperativeState,
    pub download_speed: f64,
}

/// Shared map of neighbour records
#[derive(Debug)]
pub struct NeighbourRegistry {
    num_pieces: usize,
    neighbours: RwLock<HashMap<PeerId, Neighbour>>,
}

impl NeighbourRegistry {
    /// Create an empty registry for a session with `num_pieces` pieces
    pub fn new(num_pieces: usize) -> Self {
        Self {
            num_pieces,
            neighbours: RwLock::new(HashMap::new()),
        }
    }

    /// Register a freshly connected neighbour
    ///
    /// `transitions` is the sending side of that connection handler's
    /// queue. A reconnecting peer id replaces the old record.
    pub async fn register(&self, peer_id: PeerId, transitions: mpsc::UnboundedSender<ProtocolState>) {
        let mut neighbours = self.neighbours.write().await;
        if neighbours.contains_key(&peer_id) {
            warn!("Replacing existing record for peer {}", peer_id);
        }
        neighbours.insert(peer_id, Neighbour::new(peer_id, self.num_pieces, transitions));
        info!("Registered neighbour {} (total: {})", peer_id, neighbours.len());
    }

    /// Force a record into the terminal state on connection teardown
    ///
    /// The record stays in the map for accounting; it accepts no
    /// further transitions.
    pub async fn mark_shutdown(&self, peer_id: PeerId) {
        let mut neighbours = self.neighbours.write().await;
        if let Some(neighbour) = neighbours.get_mut(&peer_id) {
            neighbour.state = CooperativeState::Shutdown;
            info!("Neighbour {} shut down", peer_id);
        }
    }

    /// Apply an INTERESTED signal from a neighbour
    pub async fn promote_interested(&self, peer_id: PeerId) -> Option<CooperativeState> {
        let mut neighbours = self.neighbours.write().await;
        let neighbour = neighbours.get_mut(&peer_id)?;
        neighbour.state = neighbour.state.promote_interested();
        debug!("Peer {} is now {:?}", peer_id, neighbour.state);
        Some(neighbour.state)
    }

    /// Apply a NOT_INTERESTED signal from a neighbour
    pub async fn demote_not_interested(&self, peer_id: PeerId) -> Option<CooperativeState> {
        let mut neighbours = self.neighbours.write().await;
        let neighbour = neighbours.get_mut(&peer_id)?;
        neighbour.state = neighbour.state.demote_not_interested();
        debug!("Peer {} is now {:?}", peer_id, neighbour.state);
        Some(neighbour.state)
    }

    /// Apply a choke-scheduler decision; returns the resulting state
    pub async fn apply_choke_decision(&self, peer_id: PeerId, choke: bool) -> Option<CooperativeState> {
        let mut neighbours = self.neighbours.write().await;
        let neighbour = neighbours.get_mut(&peer_id)?;
        neighbour.state = neighbour.state.apply_choke_decision(choke);
        debug!("Peer {} is now {:?}", peer_id, neighbour.state);
        Some(neighbour.state)
    }

    /// Record a HAVE announcement; returns the updated bitfield snapshot
    pub async fn set_have(&self, peer_id: PeerId, piece_index: u32) -> Option<Bitfield> {
        let mut neighbours = self.neighbours.write().await;
        let neighbour = neighbours.get_mut(&peer_id)?;
        neighbour.bitfield.set(piece_index as usize);
        Some(neighbour.bitfield.clone())
    }

    /// Replace a neighbour's bitfield from a BITFIELD message
    ///
    /// Marks the bitfield handshake acknowledgment as seen. Returns the
    /// stored snapshot.
    pub async fn replace_bitfield(&self, peer_id: PeerId, bitfield: Bitfield) -> Option<Bitfield> {
        let mut neighbours = self.neighbours.write().await;
        let neighbour = neighbours.get_mut(&peer_id)?;
        neighbour.bitfield = bitfield;
        neighbour.received_bitfield_ack = true;
        Some(neighbour.bitfield.clone())
    }

    /// Snapshot of a neighbour's bitfield
    pub async fn bitfield_of(&self, peer_id: PeerId) -> Option<Bitfield> {
        self.neighbours.read().await.get(&peer_id).map(|n| n.bitfield.clone())
    }

    /// Record an instantaneous download-speed sample for a neighbour
    pub async fn record_speed(&self, peer_id: PeerId, sample: SpeedSample) {
        // Empty payloads and zero-duration reads carry no sample
        let Some(speed) = sample.bytes_per_sec() else {
            return;
        };
        let mut neighbours = self.neighbours.write().await;
        if let Some(neighbour) = neighbours.get_mut(&peer_id) {
            neighbour.download_speed = speed;
            trace!("Peer {} download speed: {:.0} B/s", peer_id, speed);
        }
    }

    /// Track the piece currently requested from a neighbour
    pub async fn set_requested_piece(&self, peer_id: PeerId, piece_index: Option<u32>) {
        let mut neighbours = self.neighbours.write().await;
        if let Some(neighbour) = neighbours.get_mut(&peer_id) {
            neighbour.requested_piece = piece_index;
        }
    }

    /// Piece currently requested from a neighbour, if any
    pub async fn requested_piece(&self, peer_id: PeerId) -> Option<u32> {
        self.neighbours.read().await.get(&peer_id).and_then(|n| n.requested_piece)
    }

    /// Whether upload to this neighbour is currently permitted
    pub async fn is_unchoked(&self, peer_id: PeerId) -> bool {
        self.neighbours
            .read()
            .await
            .get(&peer_id)
            .map(|n| n.state.is_unchoked())
            .unwrap_or(false)
    }

    /// Current cooperative state of a neighbour
    pub async fn state_of(&self, peer_id: PeerId) -> Option<CooperativeState> {
        self.neighbours.read().await.get(&peer_id).map(|n| n.state)
    }

    /// Queue a transition onto one neighbour's connection handler
    ///
    /// Entry point for the choke scheduler; the handler applies it at
    /// its next safe point.
    pub async fn force_transition(&self, peer_id: PeerId, state: ProtocolState) {
        if let Some(neighbour) = self.neighbours.read().await.get(&peer_id) {
            neighbour.enqueue_transition(state);
        }
    }

    /// Queue a HAVE announcement onto every live neighbour's handler
    pub async fn broadcast_have(&self, piece_index: u32) {
        let neighbours = self.neighbours.read().await;
        debug!("Broadcasting HAVE({}) to {} neighbours", piece_index, neighbours.len());
        for neighbour in neighbours.values() {
            neighbour.enqueue_transition(ProtocolState::SendHave { piece_index });
        }
    }

    /// Summaries for the choke scheduler
    pub async fn summaries(&self) -> Vec<NeighbourSummary> {
        self.neighbours
            .read()
            .await
            .values()
            .map(|n| NeighbourSummary {
                peer_id: n.peer_id,
                state: n.state,
                download_speed: n.download_speed,
            })
            .collect()
    }

    /// Number of registered neighbours, shut-down records included
    pub async fn len(&self) -> usize {
        self.neighbours.read().await.len()
    }

    /// True when no neighbour has ever registered
    pub async fn is_empty(&self) -> bool {
        self.neighbours.read().await.is_empty()
    }
}
