//! Wire protocol utilities
//!
//! Frame-level reads and writes for the piece-exchange protocol, generic
//! over the stream so connections can be exercised in-memory in tests.
//!
//! Reading a frame times the payload read and reports it as an
//! instantaneous download-speed sample for the sending peer; the choke
//! scheduler ranks neighbours by these samples.

use anyhow::Result;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{Handshake, Message, MessageId, HANDSHAKE_LENGTH};

/// Instantaneous download-speed sample taken while reading one frame
#[derive(Debug, Clone, Copy)]
pub struct SpeedSample {
    /// Payload bytes read
    pub bytes: usize,
    /// Wall time spent reading them
    pub elapsed: Duration,
}

impl SpeedSample {
    /// Bytes per second, or None for empty payloads and zero-duration reads
    pub fn bytes_per_sec(&self) -> Option<f64> {
        if self.bytes == 0 || self.elapsed.is_zero() {
            return None;
        }
        Some(self.bytes as f64 / self.elapsed.as_secs_f64())
    }
}

/// Frame-level protocol operations
pub trait WireProtocol {
    /// Read one complete message, timing the payload read
    async fn read_message<R: AsyncReadExt + Unpin>(
        &mut self,
        reader: &mut R,
    ) -> Result<(Message, Option<SpeedSample>)>;

    /// Write one message and flush it
    async fn write_message<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()>;

    /// Read the fixed-size handshake
    async fn read_handshake<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Handshake>;

    /// Write the handshake and flush it
    async fn write_handshake<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()>;
}

/// Default implementation of WireProtocol
pub struct ExchangeWire;

impl WireProtocol for ExchangeWire {
    async fn read_message<R: AsyncReadExt + Unpin>(
        &mut self,
        reader: &mut R,
    ) -> Result<(Message, Option<SpeedSample>)> {
        // Length prefix covers the type byte plus payload
        let mut length_buf = [0u8; 4];
        reader.read_exact(&mut length_buf).await?;
        let length = u32::from_be_bytes(length_buf) as usize;

        let mut type_buf = [0u8; 1];
        reader.read_exact(&mut type_buf).await?;
        let message_id = MessageId::try_from(type_buf[0])?;

        let payload_len = length.saturating_sub(1);
        let mut payload = vec![0u8; payload_len];
        let start = Instant::now();
        reader.read_exact(&mut payload).await?;
        let elapsed = start.elapsed();

        let sample = if payload_len > 0 {
            Some(SpeedSample { bytes: payload_len, elapsed })
        } else {
            None
        };

        let message = Message::parse_payload(message_id, &payload)?;
        Ok((message, sample))
    }

    async fn write_message<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()> {
        let serialized = message.serialize();
        writer.write_all(&serialized).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_handshake<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Handshake> {
        let mut buf = [0u8; HANDSHAKE_LENGTH];
        reader.read_exact(&mut buf).await?;
        Handshake::deserialize(&buf)
    }

    async fn write_handshake<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()> {
        let serialized = handshake.serialize();
        writer.write_all(&serialized).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Extract one complete frame from a read buffer
///
/// Returns the parsed message and its payload byte count, or None while
/// the buffer holds less than a full frame. The wait-state read loop
/// accumulates bytes with cancel-safe reads and peels frames off here.
pub fn extract_frame(buf: &mut bytes::BytesMut) -> Result<Option<(Message, usize)>> {
    use bytes::Buf;

    if buf.len() < 4 {
        return Ok(None);
    }
    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length == 0 {
        return Err(crate::error::ExchangeError::protocol_error("Zero-length frame").into());
    }
    if buf.len() < 4 + length {
        return Ok(None);
    }

    let frame = buf[..4 + length].to_vec();
    buf.advance(4 + length);
    let message = Message::deserialize(&frame)?;
    Ok(Some((message, length - 1)))
}
