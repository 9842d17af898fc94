//! Reader bookkeeping: registration, readahead budgets and awaited pieces.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::priority::PRIORITY_HIGHEST;
use super::{File, Torrent, TorrentError};
use crate::backend::StorageMode;
use crate::config::MIB;

/// Readers used within this window count as active.
pub const ACTIVE_WINDOW: Duration = Duration::from_secs(60);
/// Readahead budget for disk storage.
pub const DISK_READAHEAD: u64 = 50 * MIB;
/// Share of the budget given to idle readers when both kinds exist.
const IDLE_SHARE: f64 = 0.33;

static NEXT_READER_ID: AtomicU64 = AtomicU64::new(1);

/// Position and budget of one open reader.
#[derive(Debug)]
pub struct ReaderState {
    pub id: u64,
    pub file: Arc<File>,
    position: AtomicU64,
    readahead: AtomicU64,
    active: AtomicBool,
    last_used: Mutex<Instant>,
}

impl ReaderState {
    fn new(file: Arc<File>) -> Self {
        Self {
            id: NEXT_READER_ID.fetch_add(1, Ordering::Relaxed),
            file,
            position: AtomicU64::new(0),
            readahead: AtomicU64::new(0),
            active: AtomicBool::new(true),
            last_used: Mutex::new(Instant::now()),
        }
    }

    /// Byte position relative to the file start.
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::SeqCst)
    }

    pub fn set_position(&self, position: u64) {
        self.position.store(position, Ordering::SeqCst);
    }

    pub fn readahead(&self) -> u64 {
        self.readahead.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && self.last_used.lock().elapsed() < ACTIVE_WINDOW
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }
}

/// Per-reader readahead for `active` and `idle` reader counts out of `budget`.
///
/// Returns `(per active reader, per idle reader)`.
pub fn readahead_split(budget: u64, active: usize, idle: usize) -> (u64, u64) {
    let (active_total, idle_total) = match (active.min(2), idle.min(2)) {
        (0, 0) => (0, 0),
        (0, _) => (0, budget),
        (_, 0) => (budget, 0),
        _ => {
            let idle_total = (budget as f64 * IDLE_SHARE).floor() as u64;
            (budget - idle_total, idle_total)
        }
    };
    (
        active_total / active.max(1) as u64,
        idle_total / idle.max(1) as u64,
    )
}

impl Torrent {
    /// Registers a reader over `file` and re-balances readaheads.
    pub fn register_reader(&self, file: Arc<File>) -> Arc<ReaderState> {
        let reader = Arc::new(ReaderState::new(file));
        self.readers.lock().insert(reader.id, reader.clone());
        debug!("Reader {} opened {}", reader.id, reader.file.path.display());
        self.resume_playback();
        self.reset_readers();
        reader
    }

    /// Playback ends with the last reader.
    pub fn unregister_reader(&self, id: u64) {
        let (removed, remaining) = {
            let mut readers = self.readers.lock();
            (readers.remove(&id).is_some(), readers.len())
        };
        if removed {
            debug!("Reader {} closed", id);
            self.reset_readers();
            if remaining == 0 {
                self.finish_playback();
            }
        }
    }

    pub fn reader_count(&self) -> usize {
        self.readers.lock().len()
    }

    pub(crate) fn reader_snapshot(&self) -> Vec<Arc<ReaderState>> {
        let mut readers: Vec<_> = self.readers.lock().values().cloned().collect();
        readers.sort_by_key(|reader| reader.id);
        readers
    }

    /// Total readahead budget shared by all readers.
    pub fn readahead_size(&self) -> u64 {
        match self.storage {
            StorageMode::File => DISK_READAHEAD,
            StorageMode::Memory => {
                let piece_length = self.layout().map_or(0, |layout| layout.piece_length);
                let reserved = self.reserved.read().len() as u64;
                self.memory_size()
                    .saturating_sub((reserved + 1) * piece_length)
            }
        }
    }

    /// Redistributes the readahead budget across readers.
    pub fn reset_readers(&self) {
        let readers = self.reader_snapshot();
        let (active, idle): (Vec<_>, Vec<_>) =
            readers.iter().partition(|reader| reader.is_active());
        let budget = self.readahead_size();
        let (active_size, idle_size) = readahead_split(budget, active.len(), idle.len());
        for reader in &active {
            reader.readahead.store(active_size, Ordering::SeqCst);
        }
        for reader in &idle {
            reader.readahead.store(idle_size, Ordering::SeqCst);
        }
        if !readers.is_empty() {
            debug!(
                "Readahead for {}: {} active x {}, {} idle x {}",
                self.info_hash,
                active.len(),
                active_size,
                idle.len(),
                idle_size
            );
        }
    }

    /// Marks a reader used now. Re-balances when it was idle.
    pub fn set_reader_active(&self, reader: &ReaderState, active: bool) {
        if !active {
            reader.active.store(false, Ordering::SeqCst);
            return;
        }
        let was_active = reader.is_active();
        reader.active.store(true, Ordering::SeqCst);
        reader.touch();
        if !was_active {
            self.reset_readers();
        }
    }

    /// Every reader except `keep` becomes idle.
    pub fn mark_other_readers_inactive(&self, keep: u64) {
        for reader in self.reader_snapshot() {
            if reader.id != keep {
                reader.active.store(false, Ordering::SeqCst);
            }
        }
        self.reset_readers();
    }

    /// Inclusive piece range a reader wants next: its position plus readahead,
    /// clamped to its file.
    pub fn reader_pieces_range(&self, reader: &ReaderState) -> (u32, u32) {
        let file = &reader.file;
        let position = reader.position().min(file.size.saturating_sub(1));
        let (begin, _) = file.piece_from_offset(position);
        let last = (position + reader.readahead().max(1) - 1).min(file.size.saturating_sub(1));
        let (end, _) = file.piece_from_offset(last);
        (begin, end.max(begin))
    }

    /// Asks for `piece` right now: highest priority and an immediate deadline.
    ///
    /// # Errors
    /// - `TorrentError::PieceOutOfRange` - `piece` is beyond the torrent
    /// - `TorrentError::Backend` - the library rejected the request
    pub fn request_piece(&self, piece: u32) -> Result<(), TorrentError> {
        let piece_count = self.layout().map_or(0, |layout| layout.piece_count);
        if piece >= piece_count {
            return Err(TorrentError::PieceOutOfRange { index: piece, piece_count });
        }
        self.awaiting.lock().insert(piece);
        let mut priorities = self.handle.piece_priorities();
        if let Some(slot) = priorities.get_mut(piece as usize)
            && *slot != PRIORITY_HIGHEST
        {
            *slot = PRIORITY_HIGHEST;
            self.handle.prioritize_pieces(&priorities)?;
        }
        self.handle.set_piece_deadline(piece, 0)?;
        Ok(())
    }

    pub fn release_piece(&self, piece: u32) {
        self.awaiting.lock().remove(&piece);
    }

    pub fn awaiting_pieces(&self) -> Vec<u32> {
        self.awaiting.lock().iter().copied().collect()
    }
}
