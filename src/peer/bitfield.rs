//! Piece bitfield
//!
//! Fixed-length bit vector tracking which pieces an endpoint possesses.
//! Bits are numbered from the high bit of the first byte (MSB-first),
//! matching the wire encoding of the BITFIELD message.

use crate::error::ExchangeError;
use anyhow::Result;

/// A fixed-length bit vector of piece-possession flags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    num_pieces: usize,
}

impl Bitfield {
    /// Create a new empty bitfield for the given number of pieces
    pub fn new(num_pieces: usize) -> Self {
        Self {
            bits: vec![0; num_pieces.div_ceil(8)],
            num_pieces,
        }
    }

    /// Create a full bitfield (all pieces present)
    pub fn full(num_pieces: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; num_pieces.div_ceil(8)],
            num_pieces,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Create a bitfield from wire bytes
    ///
    /// Fails if the byte count does not match the session's piece count.
    pub fn from_bytes(bytes: &[u8], num_pieces: usize) -> Result<Self> {
        if bytes.len() != num_pieces.div_ceil(8) {
            return Err(ExchangeError::protocol_error_with_source(
                "Bitfield length mismatch",
                format!("expected {} bytes for {} pieces, got {}", num_pieces.div_ceil(8), num_pieces, bytes.len()),
            )
            .into());
        }
        let mut bf = Self {
            bits: bytes.to_vec(),
            num_pieces,
        };
        bf.clear_spare_bits();
        Ok(bf)
    }

    /// Get the raw MSB-first bytes for the wire
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Number of pieces tracked by this bitfield
    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    /// Check whether the piece at `index` is present
    pub fn has(&self, index: usize) -> bool {
        if index >= self.num_pieces {
            return false;
        }
        let byte_index = index / 8;
        let bit_index = 7 - (index % 8);
        (self.bits[byte_index] >> bit_index) & 1 == 1
    }

    /// Set the bit for the piece at `index`
    ///
    /// Idempotent; returns true when the bit was newly set.
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.num_pieces {
            return false;
        }
        let byte_index = index / 8;
        let bit_index = 7 - (index % 8);
        let was_set = (self.bits[byte_index] >> bit_index) & 1 == 1;
        self.bits[byte_index] |= 1 << bit_index;
        !was_set
    }

    /// Clear the bit for the piece at `index`
    pub fn clear(&mut self, index: usize) {
        if index >= self.num_pieces {
            return;
        }
        let byte_index = index / 8;
        let bit_index = 7 - (index % 8);
        self.bits[byte_index] &= !(1 << bit_index);
    }

    /// Count of set bits
    pub fn count(&self) -> usize {
        self.bits.iter().map(|byte| byte.count_ones() as usize).sum()
    }

    /// True when no bit is set
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|byte| *byte == 0)
    }

    /// True when every piece is present
    pub fn is_full(&self) -> bool {
        self.count() == self.num_pieces
    }

    /// Bitwise XOR with another bitfield of the same length
    pub fn xor(&self, other: &Bitfield) -> Bitfield {
        debug_assert_eq!(self.num_pieces, other.num_pieces);
        let bits = self.bits.iter().zip(&other.bits).map(|(a, b)| a ^ b).collect();
        Bitfield { bits, num_pieces: self.num_pieces }
    }

    /// Bitwise AND with another bitfield of the same length
    pub fn and(&self, other: &Bitfield) -> Bitfield {
        debug_assert_eq!(self.num_pieces, other.num_pieces);
        let bits = self.bits.iter().zip(&other.bits).map(|(a, b)| a & b).collect();
        Bitfield { bits, num_pieces: self.num_pieces }
    }

    /// Bitwise AND-NOT: bits set here and not set in `other`
    pub fn and_not(&self, other: &Bitfield) -> Bitfield {
        debug_assert_eq!(self.num_pieces, other.num_pieces);
        let bits = self.bits.iter().zip(&other.bits).map(|(a, b)| a & !b).collect();
        Bitfield { bits, num_pieces: self.num_pieces }
    }

    /// Iterate over the indices of set bits in ascending order
    pub fn set_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_pieces).filter(move |i| self.has(*i))
    }

    // Bits past num_pieces in the last byte carry no meaning and must stay zero
    // so count()/is_empty() stay exact.
    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.num_pieces;
        if spare > 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= 0xFFu8 << spare;
            }
        }
    }
}
