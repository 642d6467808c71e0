//! Local peer record
//!
//! Our own bitfield plus the in-flight request set, shared by every
//! connection handler. All mutation goes through compound operations
//! that hold the lock for the whole read-modify-write; callers never
//! get a bare reference to mutate.

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::peer::{selection, Bitfield, PeerId};

#[derive(Debug)]
struct LocalPeerInner {
    /// Pieces fully received
    bitfield: Bitfield,
    /// Pieces requested but not yet received
    in_flight: Bitfield,
}

/// This peer's own shared record
#[derive(Debug, Clone)]
pub struct LocalPeer {
    peer_id: PeerId,
    num_pieces: usize,
    inner: Arc<RwLock<LocalPeerInner>>,
}

impl LocalPeer {
    /// Create the local record; `has_file` seeds a full bitfield
    pub fn new(peer_id: PeerId, num_pieces: usize, has_file: bool) -> Self {
        let bitfield = if has_file {
            Bitfield::full(num_pieces)
        } else {
            Bitfield::new(num_pieces)
        };
        Self {
            peer_id,
            num_pieces,
            inner: Arc::new(RwLock::new(LocalPeerInner {
                bitfield,
                in_flight: Bitfield::new(num_pieces),
            })),
        }
    }

    /// Our peer id
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Number of pieces in the session
    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    /// Check whether we have a piece
    pub async fn has_piece(&self, index: u32) -> bool {
        self.inner.read().await.bitfield.has(index as usize)
    }

    /// Snapshot of our bitfield
    pub async fn bitfield(&self) -> Bitfield {
        self.inner.read().await.bitfield.clone()
    }

    /// True once every piece is present
    pub async fn is_complete(&self) -> bool {
        self.inner.read().await.bitfield.is_full()
    }

    /// Count of completed pieces
    pub async fn completed_pieces(&self) -> usize {
        self.inner.read().await.bitfield.count()
    }

    /// Pick a piece to request from a neighbour and mark it in flight
    ///
    /// Selection and the in-flight mark happen under one write lock so
    /// two connections can never pick the same piece. Returns None when
    /// the neighbour has nothing we still need.
    pub async fn select_and_mark_in_flight(&self, theirs: &Bitfield) -> Option<u32> {
        let mut inner = self.inner.write().await;
        let pick = selection::select_piece(&inner.bitfield, theirs, &inner.in_flight)?;
        inner.in_flight.set(pick as usize);
        debug!("Marked piece {} in flight", pick);
        Some(pick)
    }

    /// Drop the in-flight mark for a piece that will not arrive
    pub async fn clear_in_flight(&self, index: u32) {
        self.inner.write().await.in_flight.clear(index as usize);
    }

    /// Record a fully received piece
    ///
    /// Sets the bit idempotently and clears the in-flight mark; returns
    /// true only on the first completion, which is what gates the HAVE
    /// fan-out.
    pub async fn complete_piece(&self, index: u32) -> bool {
        let mut inner = self.inner.write().await;
        inner.in_flight.clear(index as usize);
        let newly_set = inner.bitfield.set(index as usize);
        if newly_set {
            info!(
                "Piece {} complete ({}/{} pieces)",
                index,
                inner.bitfield.count(),
                self.num_pieces
            );
        } else {
            debug!("Duplicate piece {} ignored", index);
        }
        newly_set
    }

    /// Decide interest against a neighbour's bitfield
    pub async fn is_interested_in(&self, theirs: &Bitfield) -> bool {
        selection::is_interesting(&self.inner.read().await.bitfield, theirs)
    }
}
