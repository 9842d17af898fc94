//! Per-torrent state: identity, metadata records, piece policy and lifecycle.

pub mod bitfield;
pub mod buffer;
pub mod creation;
pub mod file;
#[cfg(test)]
pub(crate) mod fixture;
pub mod handle;
pub mod lifecycle;
pub mod parsing;
pub mod priority;
pub mod queue;
pub mod readers;
pub mod selection;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use bitfield::{BitField, PieceBitfield};
pub use buffer::{BufferEvent, BufferRange, BufferSnapshot, buffer_ranges};
pub use creation::TorrentBuilder;
pub use file::File;
pub use handle::{Torrent, TorrentLayout};
pub use lifecycle::LifecycleState;
pub use parsing::{MagnetLink, MediaHints, TorrentDescriptor, TorrentMetadata, TrackerPolicy};
pub use priority::{PriorityPlan, distance_priority};
pub use queue::{Queue, QueueItem};
pub use readers::{ReaderState, readahead_split};
pub use selection::{EpisodeHint, choose_file, episode_regex};

use crate::backend::BackendError;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary. Displayed and persisted as
/// 40 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Parses a 40 character hex string.
    ///
    /// # Errors
    /// - `TorrentError::MalformedMagnet` - Wrong length or non-hex characters
    pub fn from_hex(hex_str: &str) -> Result<Self, TorrentError> {
        if hex_str.len() != 40 {
            return Err(TorrentError::MalformedMagnet {
                reason: format!("Invalid hash length: {} (expected 40)", hex_str.len()),
            });
        }
        let bytes = hex::decode(hex_str).map_err(|e| TorrentError::MalformedMagnet {
            reason: format!("Invalid hex in hash {hex_str}: {e}"),
        })?;
        Self::from_slice(&bytes)
    }

    /// Creates InfoHash from a byte slice that must be exactly 20 bytes long.
    ///
    /// # Errors
    /// - `TorrentError::MalformedMagnet` - Slice is not 20 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TorrentError> {
        let hash: [u8; 20] = bytes.try_into().map_err(|_| TorrentError::MalformedMagnet {
            reason: format!("Invalid hash length: {} bytes (expected 20)", bytes.len()),
        })?;
        Ok(Self(hash))
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase 40 character hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for InfoHash {
    type Err = TorrentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(&s.to_ascii_lowercase())
    }
}

impl Serialize for InfoHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for InfoHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Errors that can occur during torrent operations.
///
/// Grouped by meaning: lookups that miss known state, malformed input,
/// remote fetch failures, state violations, exhausted budgets, and
/// cancellation of pending waits.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Torrent {info_hash} not found")]
    TorrentNotFound { info_hash: InfoHash },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Piece {index} out of range (piece count {piece_count})")]
    PieceOutOfRange { index: u32, piece_count: u32 },

    #[error("Malformed magnet link: {reason}")]
    MalformedMagnet { reason: String },

    #[error("Failed to parse torrent file: {reason}")]
    InvalidTorrentFile { reason: String },

    #[error("Invalid value for {key}: {reason}")]
    InvalidConfigValue { key: String, reason: String },

    #[error("HTTP status {status} fetching {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("HTTP error")]
    Http(#[from] reqwest::Error),

    #[error("Invalid state: {reason}")]
    InvalidState { reason: String },

    #[error("Insufficient disk space: need {needed} bytes, have {available}")]
    NotEnoughSpace { needed: u64, available: u64 },

    #[error("No playable file chosen for torrent {info_hash}")]
    FileNotChosen { info_hash: InfoHash },

    #[error("Memory budget exhausted: need {needed} bytes, have {available}")]
    MemoryExhausted { needed: u64, available: u64 },

    #[error("Torrent closed")]
    Closed,

    #[error("Pending read invalidated by seek")]
    Seeked,

    #[error("Timed out waiting for {operation}")]
    Timeout { operation: String },

    #[error("Backend error")]
    Backend(#[from] BackendError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl TorrentError {
    /// True for errors caused by malformed caller input.
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            TorrentError::MalformedMagnet { .. }
                | TorrentError::InvalidTorrentFile { .. }
                | TorrentError::InvalidConfigValue { .. }
        )
    }
}
