//! Protocol state machine
//!
//! The family of per-connection state values and the dispatch hub that
//! drives the piece exchange. Exactly one state value is live per
//! connection; every `handle` call consumes it and returns the next one
//! (or None when the connection is finished). State values are immutable
//! and carry only the data their one action needs, which keeps the
//! machine auditable while many connections mutate the shared records.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::peer::local::LocalPeer;
use crate::peer::registry::NeighbourRegistry;
use crate::peer::{Bitfield, PeerId};
use crate::protocol::wire::extract_frame;
use crate::protocol::{ExchangeWire, Message, SpeedSample, WireProtocol};
use crate::storage::PieceStore;

const READ_CHUNK: usize = 16 * 1024;

/// One connection's live protocol state
///
/// `WaitForAnyMessage` is the hub: it blocks until a full inbound frame
/// arrives (or a queued transition preempts the idle wait) and decides
/// what must happen next. Every other variant performs exactly one
/// outbound action and returns to the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolState {
    /// Passive receiver; dispatches one inbound message
    WaitForAnyMessage,
    /// Decide interest after a bitfield or HAVE update
    SendInterestedOrNotInterested { their_bits: Bitfield },
    /// Ask the neighbour for one specific piece
    SendRequest { piece_index: u32 },
    /// Fulfil a REQUEST; only permitted while the neighbour is unchoked
    SendPiece { piece_index: u32 },
    /// Announce a newly completed piece to this one neighbour
    SendHave { piece_index: u32 },
    /// Apply a choke-scheduler decision
    SendChokeOrUnchoke { choke: bool },
}

/// Everything one connection's state machine reads and writes
///
/// Owns the socket halves and the inbound transition queue; shares the
/// neighbour registry, the local record, and the piece store with every
/// other connection.
pub struct ConnectionContext<R, W> {
    /// The remote peer's id, fixed at handshake time
    pub peer_id: PeerId,
    pub local: LocalPeer,
    pub registry: Arc<NeighbourRegistry>,
    pub store: Arc<dyn PieceStore>,
    wire: ExchangeWire,
    reader: R,
    writer: W,
    transitions: mpsc::UnboundedReceiver<ProtocolState>,
    buf: BytesMut,
    frame_start: Option<Instant>,
    queue_open: bool,
}

impl<R, W> ConnectionContext<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        peer_id: PeerId,
        local: LocalPeer,
        registry: Arc<NeighbourRegistry>,
        store: Arc<dyn PieceStore>,
        reader: R,
        writer: W,
        transitions: mpsc::UnboundedReceiver<ProtocolState>,
    ) -> Self {
        Self {
            peer_id,
            local,
            registry,
            store,
            wire: ExchangeWire,
            reader,
            writer,
            transitions,
            buf: BytesMut::with_capacity(READ_CHUNK),
            frame_start: None,
            queue_open: true,
        }
    }
}

impl ProtocolState {
    /// Run this state to completion and return the next one
    ///
    /// None means the connection is closed; the caller must not call
    /// again. Errors are fatal to this connection only.
    pub async fn handle<R, W>(self, ctx: &mut ConnectionContext<R, W>) -> Result<Option<ProtocolState>>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        match self {
            ProtocolState::WaitForAnyMessage => wait_for_any_message(ctx).await,

            ProtocolState::SendInterestedOrNotInterested { their_bits } => {
                let message = if ctx.local.is_interested_in(&their_bits).await {
                    info!("Sent INTERESTED to peer {}", ctx.peer_id);
                    Message::Interested
                } else {
                    info!("Sent NOT_INTERESTED to peer {}", ctx.peer_id);
                    Message::NotInterested
                };
                ctx.wire.write_message(&mut ctx.writer, &message).await?;
                Ok(Some(ProtocolState::WaitForAnyMessage))
            }

            ProtocolState::SendRequest { piece_index } => {
                ctx.wire
                    .write_message(&mut ctx.writer, &Message::Request { piece_index })
                    .await?;
                info!("Sent REQUEST({}) to peer {}", piece_index, ctx.peer_id);
                Ok(Some(ProtocolState::WaitForAnyMessage))
            }

            ProtocolState::SendPiece { piece_index } => {
                // The neighbour may have been choked since the REQUEST was
                // dispatched; the drop stays silent either way.
                if !ctx.registry.is_unchoked(ctx.peer_id).await {
                    debug!("Peer {} choked before piece {} was sent; dropping", ctx.peer_id, piece_index);
                    return Ok(Some(ProtocolState::WaitForAnyMessage));
                }
                let data = ctx.store.read_piece(piece_index).await?;
                ctx.wire
                    .write_message(&mut ctx.writer, &Message::Piece { piece_index, data })
                    .await?;
                info!("Sent PIECE({}) to peer {}", piece_index, ctx.peer_id);
                Ok(Some(ProtocolState::WaitForAnyMessage))
            }

            ProtocolState::SendHave { piece_index } => {
                ctx.wire
                    .write_message(&mut ctx.writer, &Message::Have { piece_index })
                    .await?;
                info!("Sent HAVE({}) to peer {}", piece_index, ctx.peer_id);
                Ok(Some(ProtocolState::WaitForAnyMessage))
            }

            ProtocolState::SendChokeOrUnchoke { choke } => {
                let message = if choke { Message::Choke } else { Message::Unchoke };
                ctx.wire.write_message(&mut ctx.writer, &message).await?;
                ctx.registry.apply_choke_decision(ctx.peer_id, choke).await;
                info!("Sent {} to peer {}", if choke { "CHOKE" } else { "UNCHOKE" }, ctx.peer_id);
                Ok(Some(ProtocolState::WaitForAnyMessage))
            }
        }
    }
}

/// The dispatch hub
///
/// Loops until an inbound message demands an outbound action, a queued
/// transition preempts the idle wait, or the stream closes.
async fn wait_for_any_message<R, W>(ctx: &mut ConnectionContext<R, W>) -> Result<Option<ProtocolState>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    trace!("Waiting for any message from peer {}", ctx.peer_id);
    loop {
        // Each dispatch boundary is a safe point for queued transitions
        if ctx.queue_open {
            match ctx.transitions.try_recv() {
                Ok(state) => return Ok(Some(state)),
                Err(mpsc::error::TryRecvError::Empty) => {}
                Err(mpsc::error::TryRecvError::Disconnected) => ctx.queue_open = false,
            }
        }

        // Dispatch one buffered frame at a time
        if let Some((message, payload_len)) = extract_frame(&mut ctx.buf)? {
            let elapsed = ctx.frame_start.take().map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
            let sample = SpeedSample { bytes: payload_len, elapsed };
            if let Some(next) = dispatch(ctx, message, sample).await? {
                return Ok(Some(next));
            }
            continue;
        }

        // Payload-read timing starts once a frame's length prefix is in
        if ctx.buf.len() >= 4 {
            ctx.frame_start.get_or_insert_with(Instant::now);
        } else if ctx.buf.is_empty() {
            ctx.frame_start = None;
        }

        ctx.buf.reserve(READ_CHUNK);
        let ConnectionContext { reader, transitions, buf, queue_open, .. } = ctx;
        tokio::select! {
            biased;
            queued = transitions.recv(), if *queue_open => {
                match queued {
                    // The idle wait is a safe point; apply immediately
                    Some(state) => return Ok(Some(state)),
                    None => *queue_open = false,
                }
            }
            read = reader.read_buf(buf) => {
                if read? == 0 {
                    info!("Peer {} closed the connection", ctx.peer_id);
                    ctx.registry.mark_shutdown(ctx.peer_id).await;
                    return Ok(None);
                }
            }
        }
    }
}

/// Apply one inbound message to the shared records
///
/// Returns the outbound state it demands, or None to keep waiting.
async fn dispatch<R, W>(
    ctx: &mut ConnectionContext<R, W>,
    message: Message,
    sample: SpeedSample,
) -> Result<Option<ProtocolState>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match message {
        Message::Have { piece_index } => {
            info!("Got HAVE({}) from peer {}", piece_index, ctx.peer_id);
            let their_bits = ctx.registry.set_have(ctx.peer_id, piece_index).await;
            if let Some(their_bits) = their_bits {
                if !ctx.local.has_piece(piece_index).await {
                    return Ok(Some(ProtocolState::SendInterestedOrNotInterested { their_bits }));
                }
            }
            Ok(None)
        }

        Message::Bitfield { bitfield } => {
            info!("Got BITFIELD from peer {}", ctx.peer_id);
            let their_bits = Bitfield::from_bytes(&bitfield, ctx.local.num_pieces())?;
            ctx.registry.replace_bitfield(ctx.peer_id, their_bits.clone()).await;
            Ok(Some(ProtocolState::SendInterestedOrNotInterested { their_bits }))
        }

        Message::Piece { piece_index, data } => {
            info!("Got PIECE({}) from peer {} ({} bytes)", piece_index, ctx.peer_id, data.len());
            ctx.registry.record_speed(ctx.peer_id, sample).await;
            ctx.store.write_piece(piece_index, &data).await?;
            ctx.registry.set_requested_piece(ctx.peer_id, None).await;
            let newly_complete = ctx.local.complete_piece(piece_index).await;
            if newly_complete {
                // Fan out through each neighbour's own handler queue; this
                // task must never write to another connection's socket.
                ctx.registry.broadcast_have(piece_index).await;
            }
            // Keep the download going: request the next piece this
            // neighbour can serve. If they choked us meanwhile they drop
            // the request and their CHOKE releases the in-flight mark.
            let Some(their_bits) = ctx.registry.bitfield_of(ctx.peer_id).await else {
                return Ok(None);
            };
            match ctx.local.select_and_mark_in_flight(&their_bits).await {
                Some(next_piece) => {
                    ctx.registry.set_requested_piece(ctx.peer_id, Some(next_piece)).await;
                    Ok(Some(ProtocolState::SendRequest { piece_index: next_piece }))
                }
                None => Ok(None),
            }
        }

        Message::Request { piece_index } => {
            info!("Got REQUEST({}) from peer {}", piece_index, ctx.peer_id);
            if ctx.registry.is_unchoked(ctx.peer_id).await {
                Ok(Some(ProtocolState::SendPiece { piece_index }))
            } else {
                // Intentional policy: a request from a choked neighbour is
                // dropped without an error or a reply.
                debug!("Dropping REQUEST({}) from choked peer {}", piece_index, ctx.peer_id);
                Ok(None)
            }
        }

        Message::Choke => {
            info!("Got CHOKE from peer {}", ctx.peer_id);
            // No protocol reply, but a request this neighbour swallowed
            // must not pin its piece; release it for other connections.
            if let Some(pending) = ctx.registry.requested_piece(ctx.peer_id).await {
                debug!("Releasing in-flight piece {} after CHOKE from peer {}", pending, ctx.peer_id);
                ctx.local.clear_in_flight(pending).await;
                ctx.registry.set_requested_piece(ctx.peer_id, None).await;
            }
            Ok(None)
        }

        Message::Unchoke => {
            info!("Got UNCHOKE from peer {}", ctx.peer_id);
            let Some(their_bits) = ctx.registry.bitfield_of(ctx.peer_id).await else {
                return Ok(None);
            };
            match ctx.local.select_and_mark_in_flight(&their_bits).await {
                Some(piece_index) => {
                    ctx.registry.set_requested_piece(ctx.peer_id, Some(piece_index)).await;
                    Ok(Some(ProtocolState::SendRequest { piece_index }))
                }
                // They have nothing we still need; the unchoke is a no-op
                None => Ok(None),
            }
        }

        Message::Interested => {
            info!("Got INTERESTED from peer {}", ctx.peer_id);
            ctx.registry.promote_interested(ctx.peer_id).await;
            Ok(None)
        }

        Message::NotInterested => {
            info!("Got NOT_INTERESTED from peer {}", ctx.peer_id);
            ctx.registry.demote_not_interested(ctx.peer_id).await;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::state::CooperativeState;
    use crate::storage::MemoryPieceStore;
    use tokio::io::{duplex, DuplexStream, ReadHalf, WriteHalf};

    struct Harness {
        ctx: ConnectionContext<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>,
        // Whole stream, not halves: dropping it is what makes the
        // handler's reads hit EOF
        remote: Option<DuplexStream>,
        registry: Arc<NeighbourRegistry>,
        local: LocalPeer,
        store: Arc<MemoryPieceStore>,
    }

    const PEER: PeerId = 1002;

    async fn harness(num_pieces: usize) -> Harness {
        let (ours, theirs) = duplex(64 * 1024);
        let (our_read, our_write) = tokio::io::split(ours);

        let local = LocalPeer::new(1001, num_pieces, false);
        let registry = Arc::new(NeighbourRegistry::new(num_pieces));
        let store = Arc::new(MemoryPieceStore::new(num_pieces));

        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(PEER, tx).await;

        let ctx = ConnectionContext::new(
            PEER,
            local.clone(),
            registry.clone(),
            store.clone(),
            our_read,
            our_write,
            rx,
        );

        Harness { ctx, remote: Some(theirs), registry, local, store }
    }

    impl Harness {
        async fn remote_sends(&mut self, message: &Message) {
            let mut wire = ExchangeWire;
            wire.write_message(self.remote.as_mut().unwrap(), message).await.unwrap();
        }

        /// Drop the remote end so a waiting handler sees EOF
        fn remote_hangs_up(&mut self) {
            self.remote = None;
        }

        async fn frame_from_us(&mut self) -> Message {
            let mut wire = ExchangeWire;
            let (message, _) = wire.read_message(self.remote.as_mut().unwrap()).await.unwrap();
            message
        }
    }

    #[tokio::test]
    async fn test_interested_promotes_state() {
        let mut h = harness(4).await;
        h.remote_sends(&Message::Interested).await;
        h.remote_hangs_up();

        let next = ProtocolState::WaitForAnyMessage.handle(&mut h.ctx).await.unwrap();
        assert!(next.is_none());
        assert_eq!(h.registry.state_of(PEER).await, Some(CooperativeState::Shutdown));
        // The promotion happened before the shutdown was recorded
    }

    #[tokio::test]
    async fn test_interested_then_not_interested() {
        let mut h = harness(4).await;

        // A trailing BITFIELD makes the handler return after it has
        // dispatched the interest signal in front of it
        h.remote_sends(&Message::Interested).await;
        h.remote_sends(&Message::Bitfield { bitfield: vec![0] }).await;
        let next = ProtocolState::WaitForAnyMessage.handle(&mut h.ctx).await.unwrap();
        assert!(matches!(next, Some(ProtocolState::SendInterestedOrNotInterested { .. })));
        assert_eq!(h.registry.state_of(PEER).await, Some(CooperativeState::ChokedAndInterested));

        h.remote_sends(&Message::NotInterested).await;
        h.remote_sends(&Message::Bitfield { bitfield: vec![0] }).await;
        ProtocolState::WaitForAnyMessage.handle(&mut h.ctx).await.unwrap();
        assert_eq!(h.registry.state_of(PEER).await, Some(CooperativeState::ChokedAndNotInterested));
    }

    #[tokio::test]
    async fn test_bitfield_triggers_interest_decision() {
        let mut h = harness(4).await;
        h.remote_sends(&Message::Bitfield { bitfield: vec![0b1010_0000] }).await;

        let next = ProtocolState::WaitForAnyMessage.handle(&mut h.ctx).await.unwrap().unwrap();
        let ProtocolState::SendInterestedOrNotInterested { ref their_bits } = next else {
            panic!("expected interest decision, got {:?}", next);
        };
        assert!(their_bits.has(0));

        let after = next.handle(&mut h.ctx).await.unwrap();
        assert_eq!(after, Some(ProtocolState::WaitForAnyMessage));
        assert_eq!(h.frame_from_us().await, Message::Interested);
    }

    #[tokio::test]
    async fn test_bitfield_we_already_cover_sends_not_interested() {
        let mut h = harness(4).await;
        h.local.complete_piece(0).await;
        h.local.complete_piece(2).await;
        h.remote_sends(&Message::Bitfield { bitfield: vec![0b1010_0000] }).await;

        let next = ProtocolState::WaitForAnyMessage.handle(&mut h.ctx).await.unwrap().unwrap();
        next.handle(&mut h.ctx).await.unwrap();
        assert_eq!(h.frame_from_us().await, Message::NotInterested);
    }

    #[tokio::test]
    async fn test_have_for_missing_piece_decides_interest() {
        let mut h = harness(4).await;
        h.remote_sends(&Message::Have { piece_index: 2 }).await;

        let next = ProtocolState::WaitForAnyMessage.handle(&mut h.ctx).await.unwrap().unwrap();
        assert!(matches!(next, ProtocolState::SendInterestedOrNotInterested { .. }));
        assert!(h.registry.bitfield_of(PEER).await.unwrap().has(2));
    }

    #[tokio::test]
    async fn test_have_for_owned_piece_is_record_only() {
        let mut h = harness(4).await;
        h.local.complete_piece(2).await;
        h.remote_sends(&Message::Have { piece_index: 2 }).await;
        h.remote_hangs_up();

        let next = ProtocolState::WaitForAnyMessage.handle(&mut h.ctx).await.unwrap();
        assert!(next.is_none());
        assert!(h.registry.bitfield_of(PEER).await.unwrap().has(2));
    }

    #[tokio::test]
    async fn test_request_from_choked_peer_is_dropped() {
        let mut h = harness(4).await;
        h.store.write_piece(1, &[5; 8]).await.unwrap();
        h.remote_sends(&Message::Request { piece_index: 1 }).await;
        h.remote_hangs_up();

        let next = ProtocolState::WaitForAnyMessage.handle(&mut h.ctx).await.unwrap();
        // No SendPiece transition and no change to our own bitfield
        assert!(next.is_none());
        assert_eq!(h.local.completed_pieces().await, 0);
    }

    #[tokio::test]
    async fn test_request_from_unchoked_peer_serves_piece() {
        let mut h = harness(4).await;
        h.store.write_piece(1, &[5; 8]).await.unwrap();
        h.registry.promote_interested(PEER).await;
        h.registry.apply_choke_decision(PEER, false).await;

        h.remote_sends(&Message::Request { piece_index: 1 }).await;
        let next = ProtocolState::WaitForAnyMessage.handle(&mut h.ctx).await.unwrap().unwrap();
        assert_eq!(next, ProtocolState::SendPiece { piece_index: 1 });

        next.handle(&mut h.ctx).await.unwrap();
        assert_eq!(h.frame_from_us().await, Message::Piece { piece_index: 1, data: vec![5; 8] });
    }

    #[tokio::test]
    async fn test_send_piece_rechecks_choke_state() {
        let mut h = harness(4).await;
        h.store.write_piece(1, &[5; 8]).await.unwrap();

        // Choked at send time: nothing goes out
        let next = ProtocolState::SendPiece { piece_index: 1 }.handle(&mut h.ctx).await.unwrap();
        assert_eq!(next, Some(ProtocolState::WaitForAnyMessage));

        h.registry.promote_interested(PEER).await;
        h.registry.apply_choke_decision(PEER, false).await;
        ProtocolState::SendHave { piece_index: 0 }.handle(&mut h.ctx).await.unwrap();
        // The first frame on the wire is the HAVE, not a stale PIECE
        assert_eq!(h.frame_from_us().await, Message::Have { piece_index: 0 });
    }

    #[tokio::test]
    async fn test_unchoke_selects_and_requests() {
        let mut h = harness(4).await;
        h.remote_sends(&Message::Bitfield { bitfield: vec![0b1010_0000] }).await;
        let decide = ProtocolState::WaitForAnyMessage.handle(&mut h.ctx).await.unwrap().unwrap();
        decide.handle(&mut h.ctx).await.unwrap();
        assert_eq!(h.frame_from_us().await, Message::Interested);

        h.remote_sends(&Message::Unchoke).await;
        let next = ProtocolState::WaitForAnyMessage.handle(&mut h.ctx).await.unwrap().unwrap();
        let ProtocolState::SendRequest { piece_index } = next else {
            panic!("expected request, got {:?}", next);
        };
        assert!(piece_index == 0 || piece_index == 2);
        assert_eq!(h.registry.requested_piece(PEER).await, Some(piece_index));

        next.handle(&mut h.ctx).await.unwrap();
        assert_eq!(h.frame_from_us().await, Message::Request { piece_index });
    }

    #[tokio::test]
    async fn test_unchoke_with_nothing_to_request_is_noop() {
        let mut h = harness(4).await;
        h.remote_sends(&Message::Unchoke).await;
        h.remote_hangs_up();

        // Their bitfield is still empty; no request goes out
        let next = ProtocolState::WaitForAnyMessage.handle(&mut h.ctx).await.unwrap();
        assert!(next.is_none());
        assert_eq!(h.registry.requested_piece(PEER).await, None);
    }

    #[tokio::test]
    async fn test_piece_completes_and_fans_out() {
        let mut h = harness(4).await;

        // A second neighbour should also get the HAVE
        let (tx_other, mut rx_other) = mpsc::unbounded_channel();
        h.registry.register(1003, tx_other).await;

        h.remote_sends(&Message::Piece { piece_index: 2, data: vec![7; 16] }).await;
        h.remote_hangs_up();
        ProtocolState::WaitForAnyMessage.handle(&mut h.ctx).await.unwrap();

        assert!(h.local.has_piece(2).await);
        assert_eq!(h.store.read_piece(2).await.unwrap(), vec![7; 16]);
        assert_eq!(rx_other.try_recv().unwrap(), ProtocolState::SendHave { piece_index: 2 });
    }

    #[tokio::test]
    async fn test_duplicate_piece_fans_out_once() {
        let mut h = harness(4).await;
        let (tx_other, mut rx_other) = mpsc::unbounded_channel();
        h.registry.register(1003, tx_other).await;

        h.remote_sends(&Message::Piece { piece_index: 2, data: vec![7; 16] }).await;
        h.remote_sends(&Message::Piece { piece_index: 2, data: vec![7; 16] }).await;
        h.remote_hangs_up();
        ProtocolState::WaitForAnyMessage.handle(&mut h.ctx).await.unwrap();

        assert!(h.local.has_piece(2).await);
        assert_eq!(rx_other.try_recv().unwrap(), ProtocolState::SendHave { piece_index: 2 });
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_piece_records_download_speed() {
        let mut h = harness(4).await;
        h.remote_sends(&Message::Piece { piece_index: 0, data: vec![1; 4096] }).await;
        h.remote_hangs_up();
        ProtocolState::WaitForAnyMessage.handle(&mut h.ctx).await.unwrap();

        let summaries = h.registry.summaries().await;
        let me = summaries.iter().find(|s| s.peer_id == PEER).unwrap();
        // A sample may be skipped when the frame arrived in one chunk,
        // but it must never go negative
        assert!(me.download_speed >= 0.0);
    }

    #[tokio::test]
    async fn test_piece_triggers_next_request() {
        let mut h = harness(4).await;
        let their_bits = Bitfield::from_bytes(&[0b1100_0000], 4).unwrap();
        h.registry.replace_bitfield(PEER, their_bits).await;

        // Piece 0 is the one in flight to this neighbour
        let only_zero = Bitfield::from_bytes(&[0b1000_0000], 4).unwrap();
        assert_eq!(h.local.select_and_mark_in_flight(&only_zero).await, Some(0));
        h.registry.set_requested_piece(PEER, Some(0)).await;

        h.remote_sends(&Message::Piece { piece_index: 0, data: vec![7; 16] }).await;
        let next = ProtocolState::WaitForAnyMessage.handle(&mut h.ctx).await.unwrap();

        // Piece 1 is the only remaining candidate they hold
        assert_eq!(next, Some(ProtocolState::SendRequest { piece_index: 1 }));
        assert_eq!(h.registry.requested_piece(PEER).await, Some(1));
    }

    #[tokio::test]
    async fn test_piece_with_no_further_candidates_sends_no_request() {
        let mut h = harness(4).await;
        let only_zero = Bitfield::from_bytes(&[0b1000_0000], 4).unwrap();
        h.registry.replace_bitfield(PEER, only_zero.clone()).await;
        assert_eq!(h.local.select_and_mark_in_flight(&only_zero).await, Some(0));

        h.remote_sends(&Message::Piece { piece_index: 0, data: vec![7; 16] }).await;
        let next = ProtocolState::WaitForAnyMessage.handle(&mut h.ctx).await.unwrap();
        // No request: the HAVE fan-out reaches the sender's own queue
        // and surfaces at the next safe point instead
        assert_eq!(next, Some(ProtocolState::SendHave { piece_index: 0 }));
        assert_eq!(h.registry.requested_piece(PEER).await, None);
    }

    #[tokio::test]
    async fn test_choke_is_record_only() {
        let mut h = harness(4).await;
        h.remote_sends(&Message::Choke).await;
        h.remote_hangs_up();

        let next = ProtocolState::WaitForAnyMessage.handle(&mut h.ctx).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_choke_releases_the_in_flight_piece() {
        let mut h = harness(4).await;
        let only_one = Bitfield::from_bytes(&[0b0100_0000], 4).unwrap();
        assert_eq!(h.local.select_and_mark_in_flight(&only_one).await, Some(1));
        h.registry.set_requested_piece(PEER, Some(1)).await;

        h.remote_sends(&Message::Choke).await;
        h.remote_hangs_up();
        ProtocolState::WaitForAnyMessage.handle(&mut h.ctx).await.unwrap();

        assert_eq!(h.registry.requested_piece(PEER).await, None);
        // The piece is requestable again, from anyone
        assert_eq!(h.local.select_and_mark_in_flight(&only_one).await, Some(1));
    }

    #[tokio::test]
    async fn test_forced_transition_applied_when_idle() {
        let mut h = harness(4).await;
        h.registry.promote_interested(PEER).await;
        h.registry
            .force_transition(PEER, ProtocolState::SendChokeOrUnchoke { choke: false })
            .await;

        let next = ProtocolState::WaitForAnyMessage.handle(&mut h.ctx).await.unwrap().unwrap();
        assert_eq!(next, ProtocolState::SendChokeOrUnchoke { choke: false });

        next.handle(&mut h.ctx).await.unwrap();
        assert_eq!(h.frame_from_us().await, Message::Unchoke);
        assert!(h.registry.is_unchoked(PEER).await);
    }

    #[tokio::test]
    async fn test_eof_forces_shutdown() {
        let mut h = harness(4).await;
        h.remote_hangs_up();

        let next = ProtocolState::WaitForAnyMessage.handle(&mut h.ctx).await.unwrap();
        assert!(next.is_none());
        assert_eq!(h.registry.state_of(PEER).await, Some(CooperativeState::Shutdown));
    }

    #[tokio::test]
    async fn test_malformed_bitfield_is_fatal() {
        let mut h = harness(4).await;
        // 4-piece session needs exactly one bitfield byte
        h.remote_sends(&Message::Bitfield { bitfield: vec![0, 0, 0] }).await;

        assert!(ProtocolState::WaitForAnyMessage.handle(&mut h.ctx).await.is_err());
    }
}
