//! Piece availability bits.

use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

use super::TorrentError;
use crate::backend::BtTorrent;

/// Minimum interval between two library bitfield reads.
pub const BITFIELD_REFRESH_INTERVAL: Duration = Duration::from_millis(350);

/// Packed bit array addressed by piece index, most significant bit first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BitField {
    bytes: Vec<u8>,
    len: u32,
}

impl BitField {
    /// All bits cleared.
    pub fn new(len: u32) -> Self {
        Self {
            bytes: vec![0; (len as usize).div_ceil(8)],
            len,
        }
    }

    /// Wraps raw bytes. Missing bytes read as zero, surplus bytes and the
    /// spare bits of the last byte are ignored.
    pub fn from_bytes(len: u32, mut bytes: Vec<u8>) -> Self {
        bytes.resize((len as usize).div_ceil(8), 0);
        Self { bytes, len }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bit `index`; out of range reads as false.
    pub fn get_bit(&self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        let byte = self.bytes[(index / 8) as usize];
        byte & (0x80 >> (index % 8)) != 0
    }

    pub fn set_bit(&mut self, index: u32, value: bool) {
        if index >= self.len {
            return;
        }
        let mask = 0x80 >> (index % 8);
        let byte = &mut self.bytes[(index / 8) as usize];
        if value {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }

    pub fn count_ones(&self) -> u32 {
        (0..self.len).filter(|&i| self.get_bit(i)).count() as u32
    }

    pub fn all(&self) -> bool {
        self.count_ones() == self.len
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

struct CachedBits {
    bits: BitField,
    refreshed_at: Option<Instant>,
}

/// Library bitfield cached behind a read-write lock.
///
/// Readers take the read lock and may observe a view up to
/// `BITFIELD_REFRESH_INTERVAL` old. The refresher takes the write lock.
pub struct PieceBitfield {
    inner: RwLock<CachedBits>,
}

impl PieceBitfield {
    pub fn new(piece_count: u32) -> Self {
        Self {
            inner: RwLock::new(CachedBits {
                bits: BitField::new(piece_count),
                refreshed_at: None,
            }),
        }
    }

    /// Re-sizes after metadata arrival; the cached bits are dropped.
    pub fn reset(&self, piece_count: u32) {
        let mut inner = self.inner.write();
        inner.bits = BitField::new(piece_count);
        inner.refreshed_at = None;
    }

    /// Pulls the bitfield from the library unless the cached copy is fresh.
    ///
    /// # Errors
    /// - `TorrentError::InvalidState` - handle removed or torrent not downloading yet
    pub fn refresh(&self, handle: &dyn BtTorrent) -> Result<(), TorrentError> {
        if let Some(at) = self.inner.read().refreshed_at
            && at.elapsed() < BITFIELD_REFRESH_INTERVAL
        {
            return Ok(());
        }
        self.force_refresh(handle)
    }

    /// Pulls the bitfield regardless of the debounce window.
    ///
    /// # Errors
    /// - `TorrentError::InvalidState` - handle removed or torrent not downloading yet
    pub fn force_refresh(&self, handle: &dyn BtTorrent) -> Result<(), TorrentError> {
        if !handle.is_valid() {
            return Err(TorrentError::InvalidState {
                reason: "torrent handle is no longer valid".to_string(),
            });
        }
        let status = handle.status()?;
        if status.state.is_preparing() {
            return Err(TorrentError::InvalidState {
                reason: format!("torrent is not downloading ({:?})", status.state),
            });
        }
        let bytes = handle.piece_bitfield()?;

        let mut inner = self.inner.write();
        let len = inner.bits.len();
        inner.bits = BitField::from_bytes(len, bytes);
        inner.refreshed_at = Some(Instant::now());
        Ok(())
    }

    pub fn has_piece(&self, piece: u32) -> bool {
        self.inner.read().bits.get_bit(piece)
    }

    pub fn snapshot(&self) -> BitField {
        self.inner.read().bits.clone()
    }

    pub fn piece_count(&self) -> u32 {
        self.inner.read().bits.len()
    }
}
