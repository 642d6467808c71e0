//! File-backed piece store
//!
//! Stores piece `i` at byte offset `i * piece_size` of a single file,
//! pre-sized to the session's file size. Seek-read and seek-write pairs
//! are kept atomic by holding the file behind one async mutex.

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::ExchangeError;
use crate::storage::PieceStore;

/// Piece store backed by a single on-disk file
#[derive(Debug)]
pub struct FilePieceStore {
    path: PathBuf,
    file: Mutex<File>,
    file_size: u64,
    piece_size: u64,
}

impl FilePieceStore {
    /// Open (or create and pre-size) the backing file
    pub async fn open(path: impl AsRef<Path>, file_size: u64, piece_size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .await
            .map_err(|e| {
                ExchangeError::storage_error_full("Failed to open backing file", path.display().to_string(), e.to_string())
            })?;
        file.set_len(file_size).await.map_err(|e| {
            ExchangeError::storage_error_full("Failed to size backing file", path.display().to_string(), e.to_string())
        })?;
        info!("Opened piece store at {} ({} bytes, {}-byte pieces)", path.display(), file_size, piece_size);
        Ok(Self {
            path,
            file: Mutex::new(file),
            file_size,
            piece_size,
        })
    }

    /// Number of pieces the file splits into
    pub fn num_pieces(&self) -> usize {
        self.file_size.div_ceil(self.piece_size) as usize
    }

    /// Byte length of a piece; the final piece may be short
    pub fn piece_len(&self, index: u32) -> Option<usize> {
        let offset = index as u64 * self.piece_size;
        if offset >= self.file_size {
            return None;
        }
        Some(self.piece_size.min(self.file_size - offset) as usize)
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PieceStore for FilePieceStore {
    async fn read_piece(&self, index: u32) -> Result<Vec<u8>> {
        let len = self.piece_len(index).ok_or_else(|| {
            anyhow::Error::from(ExchangeError::storage_error(format!("Piece index {} out of range", index)))
        })?;
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(index as u64 * self.piece_size)).await?;
        let mut data = vec![0u8; len];
        file.read_exact(&mut data).await.map_err(|e| {
            ExchangeError::storage_error_full("Short read", self.path.display().to_string(), e.to_string())
        })?;
        debug!("Read piece {} ({} bytes)", index, len);
        Ok(data)
    }

    async fn write_piece(&self, index: u32, data: &[u8]) -> Result<()> {
        let len = self.piece_len(index).ok_or_else(|| {
            anyhow::Error::from(ExchangeError::storage_error(format!("Piece index {} out of range", index)))
        })?;
        if data.len() != len {
            return Err(ExchangeError::storage_error_full(
                "Piece length mismatch",
                self.path.display().to_string(),
                format!("piece {}: expected {} bytes, got {}", index, len, data.len()),
            )
            .into());
        }
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(index as u64 * self.piece_size)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        debug!("Wrote piece {} ({} bytes)", index, data.len());
        Ok(())
    }
}
