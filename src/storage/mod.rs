//! Piece storage module
//!
//! Storage collaborator consumed by the state machine: pieces are read
//! when serving a REQUEST and written when a PIECE arrives. The trait
//! keeps the machine independent of where the bytes live.

pub mod file;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

pub use file::FilePieceStore;
pub use memory::MemoryPieceStore;

/// Piece storage collaborator
#[async_trait]
pub trait PieceStore: Send + Sync + 'static {
    /// Read the bytes of a stored piece
    async fn read_piece(&self, index: u32) -> Result<Vec<u8>>;

    /// Store the bytes of a received piece
    async fn write_piece(&self, index: u32, data: &[u8]) -> Result<()>;
}
