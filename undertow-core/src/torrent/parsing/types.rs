//! Core types produced by torrent parsing.

use super::super::InfoHash;

/// Complete metadata extracted from a bencoded torrent.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentMetadata {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub total_length: u64,
    pub files: Vec<TorrentFile>,
    /// Primary announce URL first, then the announce-list tiers flattened.
    pub announce_urls: Vec<String>,
    pub private: bool,
}

impl TorrentMetadata {
    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }
}

/// Individual file within a torrent.
///
/// `path` holds the components below the torrent directory; single-file
/// torrents use the torrent name as the only component.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentFile {
    pub path: Vec<String>,
    pub length: u64,
}
