//! Connection handler
//!
//! Drives one connection's state machine from handshake completion to
//! teardown. The handler owns the socket halves and the connection's
//! transition queue; it is the only writer to its socket.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::peer::local::LocalPeer;
use crate::peer::machine::{ConnectionContext, ProtocolState};
use crate::peer::registry::NeighbourRegistry;
use crate::peer::PeerId;
use crate::storage::PieceStore;

/// Runs the protocol state machine for one established connection
pub struct ConnectionHandler<R, W> {
    ctx: ConnectionContext<R, W>,
    state: Option<ProtocolState>,
}

impl<R, W> ConnectionHandler<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Build a handler for a connection that completed its handshake
    ///
    /// Registers the neighbour record and hands its transition-queue
    /// sender to the registry so other connections and the choke
    /// scheduler can reach this handler.
    pub async fn establish(
        peer_id: PeerId,
        local: LocalPeer,
        registry: Arc<NeighbourRegistry>,
        store: Arc<dyn PieceStore>,
        reader: R,
        writer: W,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(peer_id, tx).await;
        let ctx = ConnectionContext::new(peer_id, local, registry, store, reader, writer, rx);
        Self {
            ctx,
            state: Some(ProtocolState::WaitForAnyMessage),
        }
    }

    /// The remote peer's id
    pub fn peer_id(&self) -> PeerId {
        self.ctx.peer_id
    }

    /// Run the state machine until the connection finishes
    ///
    /// Transport and protocol errors are fatal to this connection only:
    /// the neighbour record is forced to its terminal state and the
    /// error is logged, never propagated into other connections.
    pub async fn run(mut self) -> Result<()> {
        let peer_id = self.ctx.peer_id;
        info!("Connection handler for peer {} started", peer_id);

        while let Some(state) = self.state.take() {
            match state.handle(&mut self.ctx).await {
                Ok(next) => self.state = next,
                Err(e) => {
                    warn!("Connection to peer {} failed: {}", peer_id, e);
                    self.ctx.registry.mark_shutdown(peer_id).await;
                    return Ok(());
                }
            }
        }

        self.ctx.registry.mark_shutdown(peer_id).await;
        info!("Connection handler for peer {} finished", peer_id);
        Ok(())
    }
}
