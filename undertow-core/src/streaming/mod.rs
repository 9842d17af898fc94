//! Random-access readers over torrent pieces.
//!
//! `TorrentFs` resolves a path to a torrent file and opens an `FsEntry`
//! over it. Reads block piece by piece until the data is downloaded, so a
//! player can start while the torrent is still in progress. Memory storage
//! reads go through `MemoryFile`.

pub mod entry;
pub mod fs;
pub mod memory_file;

use std::path::PathBuf;
use std::time::Duration;

pub use entry::FsEntry;
pub use fs::TorrentFs;
pub use memory_file::MemoryFile;

use crate::backend::BackendError;
use crate::torrent::TorrentError;

/// How often a blocked read re-checks for its piece.
pub const PIECE_WAIT_INTERVAL: Duration = Duration::from_millis(350);
/// Back-off after the memory cache reports a short buffer.
pub const SHORT_BUFFER_RETRY: Duration = Duration::from_millis(500);

/// Errors surfaced by reader I/O.
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("Reader is closed")]
    Closed,

    #[error("Read interrupted by seek")]
    Seeked,

    #[error("Position {position} is outside the file ({size} bytes)")]
    OutOfBounds { position: i128, size: u64 },

    #[error("No torrent file at {path}")]
    NotFound { path: PathBuf },

    #[error("Torrent error")]
    Torrent(#[from] TorrentError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl From<BackendError> for ReaderError {
    fn from(error: BackendError) -> Self {
        ReaderError::Torrent(TorrentError::Backend(error))
    }
}
