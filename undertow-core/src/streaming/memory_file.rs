//! Piece-addressable view over the library's memory storage.

use std::io::SeekFrom;
use std::sync::Arc;

use super::ReaderError;
use crate::backend::{MemoryStorage, PieceRead};
use crate::torrent::File;

/// Fixed-size view of one file held in memory storage.
///
/// The cache is owned by the torrent; closing a `MemoryFile` releases nothing.
pub struct MemoryFile {
    storage: Arc<dyn MemoryStorage>,
    file: Arc<File>,
    position: u64,
}

impl MemoryFile {
    pub fn new(storage: Arc<dyn MemoryStorage>, file: Arc<File>) -> Self {
        Self {
            storage,
            file,
            position: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.file.size
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Copies from `piece` at `offset` into `buf`.
    ///
    /// `PieceRead::ShortBuffer` means the piece is not cached; retry later.
    ///
    /// # Errors
    /// - `ReaderError::Torrent` - `piece` is outside the torrent
    pub fn read_piece(&self, buf: &mut [u8], piece: u32, offset: u64) -> Result<PieceRead, ReaderError> {
        Ok(self.storage.read_piece(buf, piece, offset)?)
    }

    /// Reads at the current position, never crossing a piece boundary.
    /// Returns `Read(0)` at end of file.
    ///
    /// # Errors
    /// - `ReaderError::Torrent` - the cache rejected the piece index
    pub fn read(&mut self, buf: &mut [u8], piece_length: u64) -> Result<PieceRead, ReaderError> {
        if self.position >= self.file.size || buf.is_empty() {
            return Ok(PieceRead::Read(0));
        }
        let (piece, offset) = self.file.piece_from_offset(self.position);
        let in_piece = (piece_length - offset).min(self.file.size - self.position);
        let len = (buf.len() as u64).min(in_piece) as usize;
        let result = self.read_piece(&mut buf[..len], piece, offset)?;
        if let PieceRead::Read(n) = result {
            self.position += n as u64;
        }
        Ok(result)
    }

    /// # Errors
    /// - `ReaderError::OutOfBounds` - target is negative or past the end of the file
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64, ReaderError> {
        let target = resolve_seek(pos, self.position, self.file.size)?;
        self.position = target;
        Ok(target)
    }

    /// Nothing to release; the torrent owns the cache.
    pub fn close(&mut self) {}
}

/// Absolute position for `pos`; targets past `size` are rejected.
pub(crate) fn resolve_seek(pos: SeekFrom, current: u64, size: u64) -> Result<u64, ReaderError> {
    let target = match pos {
        SeekFrom::Start(offset) => i128::from(offset),
        SeekFrom::Current(delta) => i128::from(current) + i128::from(delta),
        SeekFrom::End(delta) => i128::from(size) + i128::from(delta),
    };
    if target < 0 || target > i128::from(size) {
        return Err(ReaderError::OutOfBounds {
            position: target,
            size,
        });
    }
    Ok(target as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BtTorrent;
    use crate::backend::StorageMode;
    use crate::torrent::creation::content_byte;
    use crate::torrent::fixture::{Fixture, FixtureOptions, PIECE_LENGTH};

    #[test]
    fn test_resolve_seek() {
        assert_eq!(resolve_seek(SeekFrom::Start(5), 0, 10).unwrap(), 5);
        assert_eq!(resolve_seek(SeekFrom::Current(-2), 5, 10).unwrap(), 3);
        assert_eq!(resolve_seek(SeekFrom::End(0), 5, 10).unwrap(), 10);
        assert!(resolve_seek(SeekFrom::End(1), 5, 10).is_err());
        assert!(resolve_seek(SeekFrom::Current(-6), 5, 10).is_err());
    }

    #[tokio::test]
    async fn test_reads_cached_pieces_and_reports_misses() {
        let fixture = Fixture::new(FixtureOptions {
            storage: StorageMode::Memory,
            ..FixtureOptions::default()
        })
        .await;
        let file = fixture.torrent.files()[0].clone();
        let storage = fixture.sim.memory_storage().unwrap();
        let mut memory = MemoryFile::new(storage, file);
        let piece_length = u64::from(PIECE_LENGTH);

        let mut buf = vec![0u8; 100];
        assert_eq!(memory.read(&mut buf, piece_length).unwrap(), PieceRead::ShortBuffer);
        assert_eq!(memory.position(), 0);

        fixture.sim.complete_piece(1);
        memory.seek(SeekFrom::Start(piece_length - 10)).unwrap();
        assert_eq!(memory.read(&mut buf, piece_length).unwrap(), PieceRead::ShortBuffer);
        memory.seek(SeekFrom::Start(piece_length + 10)).unwrap();
        assert_eq!(memory.read(&mut buf, piece_length).unwrap(), PieceRead::Read(100));
        assert_eq!(buf[0], content_byte(piece_length + 10));

        memory.seek(SeekFrom::End(0)).unwrap();
        assert_eq!(memory.read(&mut buf, piece_length).unwrap(), PieceRead::Read(0));
        assert!(memory.seek(SeekFrom::End(1)).is_err());
    }
}
