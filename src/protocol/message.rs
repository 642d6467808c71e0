//! Piece-exchange protocol messages
//!
//! Defines all message types used between peers. The wire form is
//! `[4-byte big-endian length][1-byte type][payload]` where the length
//! covers the type byte plus the payload.

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use tracing::{error, trace};

use crate::error::ExchangeError;

/// Piece-exchange message ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            _ => {
                error!("Invalid message id: {}", value);
                Err(ExchangeError::protocol_error_with_source(
                    "Invalid message id",
                    format!("value: {}", value),
                )
                .into())
            }
        }
    }
}

/// Piece-exchange protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request { piece_index: u32 },
    Piece { piece_index: u32, data: Vec<u8> },
}

impl Message {
    /// Get the message id
    pub fn message_id(&self) -> MessageId {
        match self {
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::NotInterested => MessageId::NotInterested,
            Message::Have { .. } => MessageId::Have,
            Message::Bitfield { .. } => MessageId::Bitfield,
            Message::Request { .. } => MessageId::Request,
            Message::Piece { .. } => MessageId::Piece,
        }
    }

    /// Get the message length (excluding the 4-byte length prefix)
    pub fn length(&self) -> u32 {
        match self {
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } | Message::Request { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Piece { data, .. } => 5 + data.len() as u32,
        }
    }

    /// Serialize the message to bytes (including the length prefix)
    pub fn serialize(&self) -> Vec<u8> {
        trace!("Serializing message: {:?}", self.message_id());
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);

        buf.put_u32(self.length());
        buf.put_u8(self.message_id() as u8);

        match self {
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {}
            Message::Have { piece_index } => {
                buf.put_u32(*piece_index);
            }
            Message::Bitfield { bitfield } => {
                buf.put_slice(bitfield);
            }
            Message::Request { piece_index } => {
                buf.put_u32(*piece_index);
            }
            Message::Piece { piece_index, data } => {
                buf.put_u32(*piece_index);
                buf.put_slice(data);
            }
        }

        buf.to_vec()
    }

    /// Deserialize a message from bytes (including the length prefix)
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        trace!("Deserializing message from {} bytes", data.len());
        let mut buf = BytesMut::from(data);

        if buf.remaining() < 4 {
            return Err(ExchangeError::protocol_error("Message shorter than length prefix").into());
        }
        let length = buf.get_u32() as usize;

        if length == 0 || buf.remaining() < length {
            error!("Truncated message: declared {} bytes, got {}", length, buf.remaining());
            return Err(ExchangeError::protocol_error_with_source(
                "Truncated message",
                format!("declared {} bytes, got {}", length, buf.remaining()),
            )
            .into());
        }

        let message_id = MessageId::try_from(buf.get_u8())?;
        Self::parse_payload(message_id, &buf[..length - 1])
    }

    /// Parse a message payload for a known message id
    pub fn parse_payload(message_id: MessageId, payload: &[u8]) -> Result<Self> {
        let mut buf = BytesMut::from(payload);
        match message_id {
            MessageId::Choke => Ok(Message::Choke),
            MessageId::Unchoke => Ok(Message::Unchoke),
            MessageId::Interested => Ok(Message::Interested),
            MessageId::NotInterested => Ok(Message::NotInterested),
            MessageId::Have => {
                if buf.remaining() < 4 {
                    return Err(ExchangeError::protocol_error_with_source(
                        "Have payload too short",
                        format!("expected 4 bytes, got {}", buf.remaining()),
                    )
                    .into());
                }
                Ok(Message::Have { piece_index: buf.get_u32() })
            }
            MessageId::Bitfield => Ok(Message::Bitfield { bitfield: buf.to_vec() }),
            MessageId::Request => {
                if buf.remaining() < 4 {
                    return Err(ExchangeError::protocol_error_with_source(
                        "Request payload too short",
                        format!("expected 4 bytes, got {}", buf.remaining()),
                    )
                    .into());
                }
                Ok(Message::Request { piece_index: buf.get_u32() })
            }
            MessageId::Piece => {
                if buf.remaining() < 4 {
                    return Err(ExchangeError::protocol_error_with_source(
                        "Piece payload too short",
                        format!("expected at least 4 bytes, got {}", buf.remaining()),
                    )
                    .into());
                }
                let piece_index = buf.get_u32();
                Ok(Message::Piece { piece_index, data: buf.to_vec() })
            }
        }
    }
}
