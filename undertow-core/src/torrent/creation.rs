//! Builds `.torrent` files in memory.
//!
//! Piece hashes are computed over the synthetic content produced by
//! [`content_byte`], so a backend serving the same pattern yields verifiable
//! pieces. Used by fixtures and the simulated backend.

use std::collections::BTreeMap;

use bytes::Bytes;
use sha1::{Digest, Sha1};

use super::TorrentError;
use super::parsing::{Bencode, BencodeParser, TorrentFile, TorrentMetadata};

/// Standard BitTorrent piece size (256KB)
pub const DEFAULT_PIECE_SIZE: u32 = 262_144;

/// Byte stored at absolute torrent `offset` in synthetic content.
pub fn content_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

/// Fills `buf` with synthetic content starting at absolute `offset`.
pub fn fill_content(offset: u64, buf: &mut [u8]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte = content_byte(offset + i as u64);
    }
}

/// Encoded torrent plus its decoded metadata.
#[derive(Debug, Clone)]
pub struct BuiltTorrent {
    pub metadata: TorrentMetadata,
    pub bytes: Bytes,
}

#[derive(Debug, Clone)]
pub struct TorrentBuilder {
    name: String,
    piece_length: u32,
    files: Vec<TorrentFile>,
    trackers: Vec<String>,
    private: bool,
}

impl TorrentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            piece_length: DEFAULT_PIECE_SIZE,
            files: Vec::new(),
            trackers: Vec::new(),
            private: false,
        }
    }

    pub fn piece_length(mut self, piece_length: u32) -> Self {
        self.piece_length = piece_length.max(1);
        self
    }

    /// Adds a file below the torrent directory. A single file whose only
    /// component equals the torrent name produces a single-file torrent.
    pub fn file(mut self, path: &[&str], length: u64) -> Self {
        self.files.push(TorrentFile {
            path: path.iter().map(|c| (*c).to_string()).collect(),
            length,
        });
        self
    }

    pub fn tracker(mut self, url: impl Into<String>) -> Self {
        self.trackers.push(url.into());
        self
    }

    pub fn private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    fn is_single_file(&self) -> bool {
        self.files.len() == 1 && self.files[0].path == [self.name.clone()]
    }

    fn piece_hashes(&self, total_length: u64) -> Vec<u8> {
        let piece_length = u64::from(self.piece_length);
        let piece_count = total_length.div_ceil(piece_length).max(1);
        let mut pieces = Vec::with_capacity(piece_count as usize * 20);
        let mut buf = vec![0u8; self.piece_length as usize];

        for piece in 0..piece_count {
            let start = piece * piece_length;
            let len = piece_length.min(total_length.saturating_sub(start)) as usize;
            fill_content(start, &mut buf[..len]);
            pieces.extend_from_slice(&Sha1::digest(&buf[..len]));
        }
        pieces
    }

    fn info_dictionary(&self, total_length: u64) -> Bencode {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Bencode::string(&self.name));
        info.insert(
            b"piece length".to_vec(),
            Bencode::Integer(i64::from(self.piece_length)),
        );
        info.insert(
            b"pieces".to_vec(),
            Bencode::Bytes(self.piece_hashes(total_length)),
        );
        if self.private {
            info.insert(b"private".to_vec(), Bencode::Integer(1));
        }

        if self.is_single_file() {
            info.insert(b"length".to_vec(), Bencode::Integer(total_length as i64));
        } else {
            let files = self
                .files
                .iter()
                .map(|file| {
                    let mut entry = BTreeMap::new();
                    entry.insert(b"length".to_vec(), Bencode::Integer(file.length as i64));
                    entry.insert(
                        b"path".to_vec(),
                        Bencode::List(file.path.iter().map(|c| Bencode::string(c)).collect()),
                    );
                    Bencode::Dictionary(entry)
                })
                .collect();
            info.insert(b"files".to_vec(), Bencode::List(files));
        }
        Bencode::Dictionary(info)
    }

    /// Encodes the torrent and decodes it back into metadata.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - no files or an unusable file path
    pub fn build(self) -> Result<BuiltTorrent, TorrentError> {
        if self.files.is_empty() {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Torrent lists no files".to_string(),
            });
        }
        let total_length: u64 = self.files.iter().map(|f| f.length).sum();

        let mut root = BTreeMap::new();
        if let Some(first) = self.trackers.first() {
            root.insert(b"announce".to_vec(), Bencode::string(first));
            root.insert(
                b"announce-list".to_vec(),
                Bencode::List(
                    self.trackers
                        .iter()
                        .map(|t| Bencode::List(vec![Bencode::string(t)]))
                        .collect(),
                ),
            );
        }
        root.insert(b"info".to_vec(), self.info_dictionary(total_length));
        let bytes = Bencode::Dictionary(root).encode();

        let metadata = BencodeParser::parse_bencode_data(&bytes)?;
        Ok(BuiltTorrent {
            metadata,
            bytes: Bytes::from(bytes),
        })
    }
}
