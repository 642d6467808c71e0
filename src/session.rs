//! Session orchestration
//!
//! Wires one peer process together: listens for peers that start later,
//! dials every peer listed earlier in the roster, performs the
//! handshake and bitfield exchange on each connection, and runs the
//! choke scheduler. Each established connection gets its own handler
//! task; the session only watches for completion.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::cli::Config;
use crate::error::ExchangeError;
use crate::peer::{ChokeScheduler, ConnectionHandler, LocalPeer, NeighbourRegistry, PeerId};
use crate::protocol::{ExchangeWire, Handshake, Message, WireProtocol};
use crate::storage::PieceStore;

const DIAL_ATTEMPTS: u32 = 10;
const DIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const COMPLETION_POLL: Duration = Duration::from_millis(500);

/// One running peer process
pub struct Session {
    peer_id: PeerId,
    config: Config,
    local: LocalPeer,
    registry: Arc<NeighbourRegistry>,
    store: Arc<dyn PieceStore>,
}

impl Session {
    /// Build a session for `peer_id` from the shared configuration
    pub fn new(peer_id: PeerId, config: Config, store: Arc<dyn PieceStore>) -> Result<Self> {
        let entry = config.entry_for(peer_id).ok_or_else(|| {
            ExchangeError::config_error(format!("Peer {} is not in the roster", peer_id))
        })?;
        let num_pieces = config.common.num_pieces();
        let local = LocalPeer::new(peer_id, num_pieces, entry.has_file);
        let registry = Arc::new(NeighbourRegistry::new(num_pieces));
        Ok(Self {
            peer_id,
            config,
            local,
            registry,
            store,
        })
    }

    /// The shared neighbour registry, for inspection in tests
    pub fn registry(&self) -> Arc<NeighbourRegistry> {
        self.registry.clone()
    }

    /// This process's piece ownership
    pub fn local(&self) -> LocalPeer {
        self.local.clone()
    }

    /// Run the session until every roster peer has the complete file
    pub async fn run(self) -> Result<()> {
        let entry = self
            .config
            .entry_for(self.peer_id)
            .cloned()
            .ok_or_else(|| ExchangeError::config_error("Roster entry vanished"))?;
        info!(
            "Peer {} starting on port {} ({} pieces, has file: {})",
            self.peer_id,
            entry.port,
            self.config.common.num_pieces(),
            entry.has_file
        );

        let listener = TcpListener::bind(("0.0.0.0", entry.port))
            .await
            .with_context(|| format!("Failed to bind port {}", entry.port))?;

        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.peer_id,
            self.config.clone(),
            self.local.clone(),
            self.registry.clone(),
            self.store.clone(),
        ));

        for target in self.config.peers_before(self.peer_id) {
            tokio::spawn(dial_peer(
                target.peer_id,
                target.addr(),
                self.peer_id,
                self.local.clone(),
                self.registry.clone(),
                self.store.clone(),
            ));
        }

        let scheduler = ChokeScheduler::new(
            self.registry.clone(),
            self.config.common.number_of_preferred_neighbors,
            self.config.common.unchoke_interval(),
            self.config.common.optimistic_interval(),
        );
        let scheduler_task = tokio::spawn(scheduler.run());

        self.wait_for_completion().await;

        scheduler_task.abort();
        accept_task.abort();
        info!("Peer {} session complete", self.peer_id);
        Ok(())
    }

    /// Block until we and every other roster peer hold every piece
    ///
    /// Other peers' progress is known from their bitfields, kept fresh
    /// by their HAVE announcements.
    async fn wait_for_completion(&self) {
        let others: Vec<PeerId> = self
            .config
            .peers
            .iter()
            .map(|p| p.peer_id)
            .filter(|&id| id != self.peer_id)
            .collect();

        loop {
            tokio::time::sleep(COMPLETION_POLL).await;
            if !self.local.is_complete().await {
                continue;
            }
            let mut all_done = true;
            for &peer_id in &others {
                match self.registry.bitfield_of(peer_id).await {
                    Some(bits) if bits.is_full() => {}
                    _ => {
                        all_done = false;
                        break;
                    }
                }
            }
            if all_done {
                debug!("All {} roster peers are complete", others.len() + 1);
                return;
            }
        }
    }
}

/// Accept connections from peers that start after us
async fn accept_loop(
    listener: TcpListener,
    our_id: PeerId,
    config: Config,
    local: LocalPeer,
    registry: Arc<NeighbourRegistry>,
    store: Arc<dyn PieceStore>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {}", e);
                continue;
            }
        };
        debug!("Incoming connection from {}", addr);

        let config = config.clone();
        let local = local.clone();
        let registry = registry.clone();
        let store = store.clone();
        tokio::spawn(async move {
            match establish(stream, our_id, None, local, registry, store).await {
                Ok(handler) => {
                    let remote_id = handler.peer_id();
                    if config.entry_for(remote_id).is_none() {
                        warn!("Dropping connection from unknown peer {}", remote_id);
                        return;
                    }
                    if let Err(e) = handler.run().await {
                        error!("Handler for peer {} failed: {}", remote_id, e);
                    }
                }
                Err(e) => warn!("Handshake with {} failed: {}", addr, e),
            }
        });
    }
}

/// Dial one earlier roster peer, retrying while it starts up
async fn dial_peer(
    remote_id: PeerId,
    addr: String,
    our_id: PeerId,
    local: LocalPeer,
    registry: Arc<NeighbourRegistry>,
    store: Arc<dyn PieceStore>,
) {
    for attempt in 1..=DIAL_ATTEMPTS {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                info!("Connected to peer {} at {}", remote_id, addr);
                match establish(stream, our_id, Some(remote_id), local, registry, store).await {
                    Ok(handler) => {
                        if let Err(e) = handler.run().await {
                            error!("Handler for peer {} failed: {}", remote_id, e);
                        }
                    }
                    Err(e) => error!("Handshake with peer {} failed: {}", remote_id, e),
                }
                return;
            }
            Err(e) => {
                debug!(
                    "Dial attempt {}/{} to peer {} failed: {}",
                    attempt, DIAL_ATTEMPTS, remote_id, e
                );
                tokio::time::sleep(DIAL_RETRY_DELAY).await;
            }
        }
    }
    warn!("Giving up on peer {} at {}", remote_id, addr);
}

/// Exchange handshakes and bitfields, then build the connection handler
///
/// When dialing, `expected` pins the id the remote must present. Our
/// own bitfield always goes out first so the remote can make its
/// interest decision immediately.
async fn establish(
    stream: TcpStream,
    our_id: PeerId,
    expected: Option<PeerId>,
    local: LocalPeer,
    registry: Arc<NeighbourRegistry>,
    store: Arc<dyn PieceStore>,
) -> Result<ConnectionHandler<tokio::net::tcp::OwnedReadHalf, tokio::net::tcp::OwnedWriteHalf>> {
    let (mut reader, mut writer) = stream.into_split();
    let mut wire = ExchangeWire;

    wire.write_handshake(&mut writer, &Handshake::new(our_id)).await?;
    let theirs = wire.read_handshake(&mut reader).await?;

    if theirs.peer_id == our_id {
        return Err(ExchangeError::peer_error_with_peer(
            "Handshake presented our own id",
            theirs.peer_id.to_string(),
        )
        .into());
    }
    if let Some(expected) = expected {
        if theirs.peer_id != expected {
            return Err(ExchangeError::peer_error_with_peer(
                format!("Expected peer {} in handshake", expected),
                theirs.peer_id.to_string(),
            )
            .into());
        }
    }
    info!("Handshake complete with peer {}", theirs.peer_id);

    let our_bits = local.bitfield().await;
    wire.write_message(&mut writer, &Message::Bitfield { bitfield: our_bits.as_bytes().to_vec() })
        .await?;

    Ok(ConnectionHandler::establish(theirs.peer_id, local, registry, store, reader, writer).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryPieceStore;

    const COMMON: &str = "\
NumberOfPreferredNeighbors 1
UnchokingInterval 1
OptimisticUnchokingInterval 2
FileName TheFile.dat
FileSize 96
PieceSize 32
";

    fn two_peer_config(port_a: u16, port_b: u16) -> Config {
        let peers = format!("1001 127.0.0.1 {} 1\n1002 127.0.0.1 {} 0\n", port_a, port_b);
        let config = Config::parse(COMMON, &peers).unwrap();
        config.validate().unwrap();
        config
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_session_requires_roster_membership() {
        let config = two_peer_config(6001, 6002);
        let store: Arc<dyn PieceStore> = Arc::new(MemoryPieceStore::new(3));
        assert!(Session::new(1099, config, store).is_err());
    }

    #[tokio::test]
    async fn test_two_peer_exchange_runs_to_completion() {
        let port_a = free_port().await;
        let port_b = free_port().await;
        let config = two_peer_config(port_a, port_b);

        let data: Vec<u8> = (0..96u8).collect();
        let seed_store = Arc::new(MemoryPieceStore::seeded(&data, 32));
        let leech_store = Arc::new(MemoryPieceStore::new(3));

        let seed_dyn: Arc<dyn PieceStore> = seed_store.clone();
        let leech_dyn: Arc<dyn PieceStore> = leech_store.clone();
        let seed = Session::new(1001, config.clone(), seed_dyn).unwrap();
        let leech = Session::new(1002, config, leech_dyn).unwrap();
        let leech_local = leech.local();

        let seed_task = tokio::spawn(seed.run());
        let leech_task = tokio::spawn(leech.run());

        let both = async {
            leech_task.await.unwrap().unwrap();
            seed_task.await.unwrap().unwrap();
        };
        tokio::time::timeout(Duration::from_secs(30), both)
            .await
            .expect("exchange did not complete in time");

        assert!(leech_local.is_complete().await);
        assert_eq!(leech_store.assemble().await.unwrap(), data);
    }
}
