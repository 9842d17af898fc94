//! Seam to the BitTorrent library.
//!
//! The engine never speaks the wire protocol itself. Everything it needs from
//! the library is expressed by `BtSession`, `BtTorrent` and `MemoryStorage`;
//! a production build plugs a native binding in here, tests use the
//! deterministic `simulated` backend.

pub mod alerts;
pub mod settings;
#[cfg(any(test, feature = "test-utils"))]
pub mod simulated;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use alerts::{Alert, AlertCategory, AlertKind};
pub use settings::{ListenEndpoint, SettingValue, SettingsPack};

use crate::torrent::{InfoHash, TorrentMetadata};

/// Where piece data lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Pieces are written to files under the download directory.
    #[default]
    File,
    /// Pieces live in a bounded in-memory cache and are evicted.
    Memory,
}

/// Errors reported by the library seam.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Torrent handle is no longer valid")]
    InvalidHandle,

    #[error("Torrent {info_hash} is already in the session")]
    DuplicateTorrent { info_hash: InfoHash },

    #[error("Session is closed")]
    SessionClosed,

    #[error("{operation} failed: {reason}")]
    Operation { operation: String, reason: String },

    #[error("Storage I/O error")]
    Io(#[from] std::io::Error),
}

/// What the library should start the torrent from.
#[derive(Debug, Clone)]
pub enum TorrentSource {
    /// Metadata will be fetched from peers.
    Magnet(String),
    /// Complete bencoded metainfo.
    Metainfo(Bytes),
}

/// Parameters for adding a torrent to the session.
#[derive(Debug, Clone)]
pub struct AddTorrentParams {
    pub info_hash: InfoHash,
    pub name: String,
    pub save_path: PathBuf,
    pub source: TorrentSource,
    pub trackers: Vec<String>,
    pub resume_data: Option<Bytes>,
    pub storage: StorageMode,
    /// Cache capacity in bytes when `storage` is memory.
    pub memory_size: u64,
    pub paused: bool,
    pub auto_managed: bool,
}

/// Library-level torrent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TorrentState {
    #[default]
    CheckingFiles,
    DownloadingMetadata,
    Downloading,
    Finished,
    Seeding,
    Allocating,
    CheckingResumeData,
}

impl TorrentState {
    /// States in which piece data cannot be queried yet.
    pub fn is_preparing(self) -> bool {
        matches!(
            self,
            TorrentState::CheckingFiles
                | TorrentState::DownloadingMetadata
                | TorrentState::Allocating
                | TorrentState::CheckingResumeData
        )
    }

    pub fn is_complete(self) -> bool {
        matches!(self, TorrentState::Finished | TorrentState::Seeding)
    }
}

/// Point-in-time status snapshot of one torrent.
#[derive(Debug, Clone, Default)]
pub struct TorrentStatus {
    pub state: TorrentState,
    pub paused: bool,
    pub auto_managed: bool,
    pub has_metadata: bool,
    pub need_save_resume: bool,
    /// Fraction in `[0, 1]` of wanted bytes.
    pub progress: f32,
    pub total_wanted: u64,
    pub total_wanted_done: u64,
    pub total_done: u64,
    pub all_time_download: u64,
    pub all_time_upload: u64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub num_peers: u32,
    pub num_seeds: u32,
    pub active_time: Duration,
    pub seeding_time: Duration,
}

/// One file in the torrent's concatenated layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the save path, including the torrent directory for
    /// multi-file torrents.
    pub path: PathBuf,
    pub offset: u64,
    pub size: u64,
}

/// Metadata as the library exposes it once known.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentInfo {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u64,
    pub num_pieces: u32,
    pub total_size: u64,
    pub files: Vec<FileEntry>,
    pub private: bool,
    pub trackers: Vec<String>,
    /// Bencoded metainfo the library can reproduce.
    pub metainfo: Option<Bytes>,
}

impl TorrentInfo {
    /// Lays files out back to back in metadata order.
    pub fn from_metadata(metadata: &TorrentMetadata, metainfo: Option<Bytes>) -> Self {
        let single = metadata.files.len() == 1 && metadata.files[0].path.len() == 1
            && metadata.files[0].path[0] == metadata.name;
        let mut offset = 0u64;
        let files = metadata
            .files
            .iter()
            .map(|file| {
                let mut path = PathBuf::new();
                if !single {
                    path.push(&metadata.name);
                }
                for component in &file.path {
                    path.push(component);
                }
                let entry = FileEntry {
                    path,
                    offset,
                    size: file.length,
                };
                offset += file.length;
                entry
            })
            .collect();

        Self {
            info_hash: metadata.info_hash,
            name: metadata.name.clone(),
            piece_length: u64::from(metadata.piece_length),
            num_pieces: metadata.piece_hashes.len() as u32,
            total_size: metadata.total_length,
            files,
            private: metadata.private,
            trackers: metadata.announce_urls.clone(),
            metainfo,
        }
    }
}

/// Download progress of one block inside a partially downloaded piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub bytes_progress: u32,
    pub block_size: u32,
}

/// A piece currently being downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialPiece {
    pub piece: u32,
    pub blocks: Vec<BlockInfo>,
}

/// Result of a memory cache read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceRead {
    Read(usize),
    /// The piece is not (or no longer) cached; retry later.
    ShortBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortProtocol {
    Tcp,
    Udp,
}

/// Bounded in-memory piece cache owned by the library.
pub trait MemoryStorage: Send + Sync {
    /// Copies piece bytes starting at `offset` within the piece into `buf`.
    ///
    /// # Errors
    /// - `BackendError::Operation` - `piece` is outside the torrent
    fn read_piece(&self, buf: &mut [u8], piece: u32, offset: u64) -> Result<PieceRead, BackendError>;

    /// Pieces readers are about to consume; evicted last.
    fn set_reader_pieces(&self, pieces: Vec<u32>);

    /// Pieces that must never be evicted.
    fn set_reserved_pieces(&self, pieces: Vec<u32>);

    fn capacity(&self) -> u64;

    fn set_capacity(&self, bytes: u64);
}

/// Handle to one torrent inside the library session.
pub trait BtTorrent: Send + Sync {
    fn info_hash(&self) -> InfoHash;

    /// False once the torrent was removed from the session.
    fn is_valid(&self) -> bool;

    /// # Errors
    /// - `BackendError::InvalidHandle` - torrent was removed
    fn status(&self) -> Result<TorrentStatus, BackendError>;

    /// `None` until metadata is known.
    fn torrent_info(&self) -> Option<Arc<TorrentInfo>>;

    /// # Errors
    /// - `BackendError::InvalidHandle` - torrent was removed
    fn pause(&self) -> Result<(), BackendError>;

    /// # Errors
    /// - `BackendError::InvalidHandle` - torrent was removed
    fn resume(&self) -> Result<(), BackendError>;

    /// # Errors
    /// - `BackendError::InvalidHandle` - torrent was removed
    fn set_auto_managed(&self, auto_managed: bool) -> Result<(), BackendError>;

    /// Replaces the whole piece priority vector.
    ///
    /// # Errors
    /// - `BackendError::InvalidHandle` - torrent was removed
    /// - `BackendError::Operation` - vector length differs from the piece count
    fn prioritize_pieces(&self, priorities: &[u8]) -> Result<(), BackendError>;

    fn piece_priorities(&self) -> Vec<u8>;

    /// # Errors
    /// - `BackendError::InvalidHandle` - torrent was removed
    /// - `BackendError::Operation` - vector length differs from the file count
    fn prioritize_files(&self, priorities: &[u8]) -> Result<(), BackendError>;

    fn file_priorities(&self) -> Vec<u8>;

    /// # Errors
    /// - `BackendError::InvalidHandle` - torrent was removed
    fn set_piece_deadline(&self, piece: u32, deadline_ms: u32) -> Result<(), BackendError>;

    fn clear_piece_deadlines(&self);

    /// Packed have-bitfield, most significant bit first.
    ///
    /// # Errors
    /// - `BackendError::InvalidHandle` - torrent was removed
    fn piece_bitfield(&self) -> Result<Vec<u8>, BackendError>;

    fn download_queue(&self) -> Vec<PartialPiece>;

    fn force_reannounce(&self);

    fn force_dht_announce(&self);

    /// Requests resume data; it arrives later as a `SaveResumeData` alert.
    ///
    /// # Errors
    /// - `BackendError::InvalidHandle` - torrent was removed
    fn save_resume_data(&self) -> Result<(), BackendError>;

    /// Present only for memory storage.
    fn memory_storage(&self) -> Option<Arc<dyn MemoryStorage>>;

    fn save_path(&self) -> PathBuf;
}

/// The library session.
#[async_trait]
pub trait BtSession: Send + Sync {
    /// # Errors
    /// - `BackendError::DuplicateTorrent` - info hash already in session
    /// - `BackendError::SessionClosed` - session was closed
    async fn add_torrent(&self, params: AddTorrentParams)
    -> Result<Arc<dyn BtTorrent>, BackendError>;

    /// # Errors
    /// - `BackendError::InvalidHandle` - no such torrent
    async fn remove_torrent(
        &self,
        info_hash: &InfoHash,
        delete_files: bool,
    ) -> Result<(), BackendError>;

    fn find_torrent(&self, info_hash: &InfoHash) -> Option<Arc<dyn BtTorrent>>;

    /// Applies every key in `pack`; keys not in the pack keep their value.
    ///
    /// # Errors
    /// - `BackendError::SessionClosed` - session was closed
    fn apply_settings(&self, pack: &SettingsPack) -> Result<(), BackendError>;

    /// Returns a mapping id.
    ///
    /// # Errors
    /// - `BackendError::Operation` - mapping rejected
    fn add_port_mapping(
        &self,
        protocol: PortProtocol,
        external_port: u16,
        local_port: u16,
    ) -> Result<i32, BackendError>;

    /// True when alerts are ready before `timeout` elapses.
    async fn wait_for_alert(&self, timeout: Duration) -> bool;

    fn pop_alerts(&self) -> Vec<Alert>;

    /// # Errors
    /// - `BackendError::Operation` - library failed to shut down cleanly
    async fn close(&self) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::parsing::types::TorrentFile;

    fn metadata(files: Vec<TorrentFile>, name: &str) -> TorrentMetadata {
        let total_length = files.iter().map(|f| f.length).sum();
        TorrentMetadata {
            info_hash: InfoHash::new([7; 20]),
            name: name.to_string(),
            piece_length: 1024,
            piece_hashes: vec![[0; 20]; 3],
            total_length,
            files,
            announce_urls: Vec::new(),
            private: false,
        }
    }

    #[test]
    fn test_info_lays_out_files_back_to_back() {
        let meta = metadata(
            vec![
                TorrentFile {
                    path: vec!["a.mkv".to_string()],
                    length: 1500,
                },
                TorrentFile {
                    path: vec!["Subs".to_string(), "a.srt".to_string()],
                    length: 200,
                },
            ],
            "Show",
        );
        let info = TorrentInfo::from_metadata(&meta, None);

        assert_eq!(info.files[0].path, PathBuf::from("Show/a.mkv"));
        assert_eq!(info.files[1].path, PathBuf::from("Show/Subs/a.srt"));
        assert_eq!(info.files[1].offset, 1500);
        assert_eq!(info.total_size, 1700);
        assert_eq!(info.num_pieces, 3);
    }

    #[test]
    fn test_single_file_has_no_directory() {
        let meta = metadata(
            vec![TorrentFile {
                path: vec!["movie.mp4".to_string()],
                length: 10,
            }],
            "movie.mp4",
        );
        let info = TorrentInfo::from_metadata(&meta, None);
        assert_eq!(info.files[0].path, PathBuf::from("movie.mp4"));
    }

    #[test]
    fn test_preparing_states() {
        assert!(TorrentState::DownloadingMetadata.is_preparing());
        assert!(TorrentState::CheckingResumeData.is_preparing());
        assert!(!TorrentState::Downloading.is_preparing());
        assert!(TorrentState::Seeding.is_complete());
    }
}
