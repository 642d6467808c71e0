//! In-memory piece store
//!
//! Backs seeded peers in tests and small sessions where the whole file
//! fits comfortably in memory.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use crate::error::ExchangeError;
use crate::storage::PieceStore;

/// Piece store holding every piece in memory
#[derive(Debug)]
pub struct MemoryPieceStore {
    pieces: RwLock<Vec<Option<Vec<u8>>>>,
}

impl MemoryPieceStore {
    /// Create an empty store for `num_pieces` pieces
    pub fn new(num_pieces: usize) -> Self {
        Self {
            pieces: RwLock::new(vec![None; num_pieces]),
        }
    }

    /// Create a store pre-filled by splitting `data` into pieces
    pub fn seeded(data: &[u8], piece_size: usize) -> Self {
        let pieces = data
            .chunks(piece_size)
            .map(|chunk| Some(chunk.to_vec()))
            .collect();
        Self {
            pieces: RwLock::new(pieces),
        }
    }

    /// Number of piece slots
    pub async fn num_pieces(&self) -> usize {
        self.pieces.read().await.len()
    }

    /// Concatenate all stored pieces; None while any piece is missing
    pub async fn assemble(&self) -> Option<Vec<u8>> {
        let pieces = self.pieces.read().await;
        let mut out = Vec::new();
        for piece in pieces.iter() {
            out.extend_from_slice(piece.as_deref()?);
        }
        Some(out)
    }
}

#[async_trait]
impl PieceStore for MemoryPieceStore {
    async fn read_piece(&self, index: u32) -> Result<Vec<u8>> {
        let pieces = self.pieces.read().await;
        pieces
            .get(index as usize)
            .and_then(|p| p.clone())
            .ok_or_else(|| {
                ExchangeError::storage_error(format!("Piece {} not available", index)).into()
            })
    }

    async fn write_piece(&self, index: u32, data: &[u8]) -> Result<()> {
        let mut pieces = self.pieces.write().await;
        let slot = pieces.get_mut(index as usize).ok_or_else(|| {
            anyhow::Error::from(ExchangeError::storage_error(format!(
                "Piece index {} out of range",
                index
            )))
        })?;
        trace!("Storing piece {} ({} bytes)", index, data.len());
        *slot = Some(data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read() {
        let store = MemoryPieceStore::new(4);
        store.write_piece(2, &[1, 2, 3]).await.unwrap();
        assert_eq!(store.read_piece(2).await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_read_missing_piece() {
        let store = MemoryPieceStore::new(4);
        assert!(store.read_piece(0).await.is_err());
        assert!(store.read_piece(99).await.is_err());
    }

    #[tokio::test]
    async fn test_write_out_of_range() {
        let store = MemoryPieceStore::new(2);
        assert!(store.write_piece(2, &[0]).await.is_err());
    }

    #[tokio::test]
    async fn test_seeded_store() {
        let store = MemoryPieceStore::seeded(&[1, 2, 3, 4, 5], 2);
        assert_eq!(store.num_pieces().await, 3);
        assert_eq!(store.read_piece(0).await.unwrap(), vec![1, 2]);
        assert_eq!(store.read_piece(2).await.unwrap(), vec![5]);
    }

    #[tokio::test]
    async fn test_assemble() {
        let store = MemoryPieceStore::new(2);
        assert!(store.assemble().await.is_none());
        store.write_piece(0, &[1, 2]).await.unwrap();
        store.write_piece(1, &[3]).await.unwrap();
        assert_eq!(store.assemble().await.unwrap(), vec![1, 2, 3]);
    }
}
