//! Pre-buffering: head and tail piece ranges, memory sizing, progress.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::handle::TorrentLayout;
use super::lifecycle::LifecycleState;
use super::priority::{PRIORITY_HIGHEST, PRIORITY_NORMAL, PRIORITY_OFF};
use super::{File, Torrent, TorrentError};
use crate::backend::{PartialPiece, StorageMode};

/// Multiples of the piece length tried when growing memory storage.
const AUTO_MEMORY_STEPS: [u64; 4] = [25, 20, 15, 10];
/// Memory storage never holds fewer pieces than this.
const MIN_MEMORY_PIECES: u64 = 10;

/// A contiguous, piece-aligned span reserved for prefetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRange {
    pub start_piece: u32,
    pub end_piece: u32,
    /// Byte position of `start_piece` in the torrent.
    pub offset: u64,
    /// Bytes covered by the pieces, trimmed at the torrent end.
    pub size: u64,
}

impl BufferRange {
    /// Pieces covering `[start, start + len)`, clamped to the torrent.
    pub fn covering(layout: &TorrentLayout, start: u64, len: u64) -> Self {
        let piece_length = layout.piece_length.max(1);
        let last_piece = layout.piece_count.saturating_sub(1);
        let start_piece = ((start / piece_length) as u32).min(last_piece);
        let last_byte = (start + len.max(1) - 1).min(layout.total_length.saturating_sub(1));
        let end_piece = ((last_byte / piece_length) as u32)
            .min(last_piece)
            .max(start_piece);
        let offset = u64::from(start_piece) * piece_length;
        let end = (u64::from(end_piece) + 1) * piece_length;
        Self {
            start_piece,
            end_piece,
            offset,
            size: end.min(layout.total_length) - offset,
        }
    }

    pub fn pieces(&self) -> RangeInclusive<u32> {
        self.start_piece..=self.end_piece
    }

    pub fn contains(&self, piece: u32) -> bool {
        self.pieces().contains(&piece)
    }
}

/// Head range over the first `buffer_size` bytes of `file` and a disjoint
/// tail range over its last `end_buffer_size` bytes.
pub fn buffer_ranges(
    layout: &TorrentLayout,
    file: &File,
    buffer_size: u64,
    end_buffer_size: u64,
) -> Vec<BufferRange> {
    let head = BufferRange::covering(layout, file.offset, buffer_size.min(file.size));
    let mut ranges = vec![head];
    if file.size > buffer_size && end_buffer_size > 0 {
        let tail_len = end_buffer_size.min(file.size);
        let tail = BufferRange::covering(layout, file.offset + file.size - tail_len, tail_len);
        if tail.end_piece > head.end_piece {
            let start_piece = tail.start_piece.max(head.end_piece + 1);
            let offset = u64::from(start_piece) * layout.piece_length;
            ranges.push(BufferRange {
                start_piece,
                end_piece: tail.end_piece,
                offset,
                size: tail.offset + tail.size - offset,
            });
        }
    }
    ranges
}

#[derive(Debug, Clone, PartialEq)]
pub enum BufferEvent {
    /// Overall progress in percent.
    Progress(f64),
    Finished,
    Failed { reason: String },
    NotEnoughSpace { needed: u64, available: u64 },
}

/// Read-only view of the current buffering session.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferSnapshot {
    pub file_index: Option<usize>,
    pub ranges: Vec<BufferRange>,
    /// Sum of range sizes.
    pub pieces_length: u64,
    pub progress: f64,
    pub finished: bool,
}

#[derive(Debug, Default)]
pub(crate) struct BufferState {
    file_index: Option<usize>,
    ranges: Vec<BufferRange>,
    pieces_progress: BTreeMap<u32, f64>,
    progress: f64,
}

impl Torrent {
    /// Starts buffering file `file_index`, or the automatically chosen file.
    ///
    /// Waits for metadata first. Returns once the buffer pieces are
    /// requested; completion is reported through `subscribe_buffer` and
    /// `wait_for_buffer`.
    ///
    /// # Errors
    /// - `TorrentError::Closed` - torrent dropped while waiting for metadata
    /// - `TorrentError::FileNotChosen` - nothing playable in the torrent
    /// - `TorrentError::InvalidState` - torrent was removed
    pub async fn buffer(&self, file_index: Option<usize>) -> Result<BufferSnapshot, TorrentError> {
        let layout = self.wait_for_metadata().await?;
        let file = match file_index {
            Some(index) => self.select_file(index)?,
            None => self.choose_file()?,
        };
        self.resume()?;
        self.lifecycle.lock().transition(LifecycleState::Buffering)?;
        self.set_buffering_finished(false);

        let config = self.ctx.config();
        let ranges = buffer_ranges(
            &layout,
            &file,
            config.storage.buffer_size,
            config.storage.end_buffer_size,
        );
        let pieces_length: u64 = ranges.iter().map(|range| range.size).sum();
        if self.storage == StorageMode::Memory {
            self.adjust_memory_size(&layout, pieces_length, config.storage.auto_memory_size);
        }

        let buffer_pieces: Vec<u32> = ranges.iter().flat_map(BufferRange::pieces).collect();
        {
            let mut reserved = self.reserved.write();
            reserved.clear();
            reserved.extend(buffer_pieces.iter().copied());
        }
        {
            let mut state = self.buffer.lock();
            state.file_index = Some(file.index);
            state.ranges = ranges.clone();
            state.pieces_progress = buffer_pieces.iter().map(|piece| (*piece, 0.0)).collect();
            state.progress = 0.0;
        }

        let rest = match self.storage {
            StorageMode::File => PRIORITY_NORMAL,
            StorageMode::Memory => PRIORITY_OFF,
        };
        let mut priorities = vec![rest; layout.piece_count as usize];
        for piece in &buffer_pieces {
            priorities[*piece as usize] = PRIORITY_HIGHEST;
        }
        self.handle.prioritize_pieces(&priorities)?;
        for piece in &buffer_pieces {
            self.handle.set_piece_deadline(*piece, 0)?;
        }
        if let Some(memory) = self.handle.memory_storage() {
            memory.set_reserved_pieces(buffer_pieces.clone());
        }

        if config.playback.pause_resume_hack {
            self.handle.pause()?;
            self.handle.resume()?;
        }
        self.handle.force_reannounce();
        if !config.network.disable_dht {
            self.handle.force_dht_announce();
        }

        if !self.holds_rate_slot.swap(true, Ordering::SeqCst) {
            self.ctx.buffering_started();
        }
        info!(
            "Buffering {} in {}: {} pieces, {} bytes",
            file.path.display(),
            self.info_hash,
            buffer_pieces.len(),
            pieces_length
        );
        Ok(self.buffer_snapshot())
    }

    /// Grows memory storage so the buffer fits.
    fn adjust_memory_size(&self, layout: &TorrentLayout, buffer_length: u64, auto_grow: bool) {
        let piece_length = layout.piece_length;
        let mut size = self.memory_size();
        if size < MIN_MEMORY_PIECES * piece_length {
            size = MIN_MEMORY_PIECES * piece_length;
        }
        if buffer_length > size {
            size = buffer_length + piece_length;
        }
        if auto_grow {
            let free = self.ctx.resources.free_memory();
            if let Some(grown) = AUTO_MEMORY_STEPS
                .iter()
                .map(|step| step * piece_length)
                .find(|candidate| *candidate > size && free >= 2 * (candidate - size))
            {
                size = grown;
            }
        }
        if size != self.memory_size() {
            debug!("Memory storage for {} set to {} bytes", self.info_hash, size);
        }
        self.memory_size.store(size, Ordering::SeqCst);
        if let Some(memory) = self.handle.memory_storage() {
            memory.set_capacity(size);
        }
    }

    pub fn buffer_snapshot(&self) -> BufferSnapshot {
        let state = self.buffer.lock();
        BufferSnapshot {
            file_index: state.file_index,
            ranges: state.ranges.clone(),
            pieces_length: state.ranges.iter().map(|range| range.size).sum(),
            progress: state.progress,
            finished: self.is_buffering_finished(),
        }
    }

    pub fn buffer_progress(&self) -> f64 {
        self.buffer.lock().progress
    }

    /// Samples per-piece progress and finishes buffering at 100%.
    pub fn update_buffer_progress(&self) {
        if !self.is_buffering() || self.is_buffering_finished() {
            return;
        }
        let queue: BTreeMap<u32, PartialPiece> = self
            .handle
            .download_queue()
            .into_iter()
            .map(|partial| (partial.piece, partial))
            .collect();

        let progress = {
            let mut state = self.buffer.lock();
            if state.pieces_progress.is_empty() {
                return;
            }
            for (piece, value) in state.pieces_progress.iter_mut() {
                let sample = if self.pieces.has_piece(*piece) {
                    1.0
                } else {
                    queue.get(piece).map_or(0.0, block_ratio)
                };
                *value = value.max(sample);
            }
            let mean = state.pieces_progress.values().sum::<f64>()
                / state.pieces_progress.len() as f64;
            state.progress = state.progress.max(100.0 * mean);
            state.progress
        };

        self.buffer_events.broadcast(BufferEvent::Progress(progress));
        if progress >= 100.0 {
            self.finish_buffering();
        }
    }

    fn finish_buffering(&self) {
        if self.set_buffering_finished(true) {
            return;
        }
        self.buffer.lock().pieces_progress.clear();
        self.release_rate_slot();
        if let Err(e) = self.lifecycle.lock().transition(LifecycleState::Playing) {
            warn!("Buffering finished for {} in odd state: {}", self.info_hash, e);
        }
        self.buffer_events.broadcast(BufferEvent::Finished);
        info!("Buffering finished for {}", self.info_hash);
    }

    /// Waits until buffering finishes.
    ///
    /// # Errors
    /// - `TorrentError::Timeout` - `timeout` elapsed first
    /// - `TorrentError::NotEnoughSpace` - disk space ran out
    /// - `TorrentError::InvalidState` - buffering failed
    /// - `TorrentError::Closed` - torrent dropped
    pub async fn wait_for_buffer(&self, timeout: Duration) -> Result<(), TorrentError> {
        let mut listener = self.subscribe_buffer();
        if self.is_buffering_finished() {
            return Ok(());
        }
        let wait = async {
            loop {
                match listener.recv().await {
                    Some(BufferEvent::Finished) => return Ok(()),
                    Some(BufferEvent::Progress(_)) => {}
                    Some(BufferEvent::Failed { reason }) => {
                        return Err(TorrentError::InvalidState { reason });
                    }
                    Some(BufferEvent::NotEnoughSpace { needed, available }) => {
                        return Err(TorrentError::NotEnoughSpace { needed, available });
                    }
                    None => return Err(TorrentError::Closed),
                }
            }
        };
        tokio::select! {
            result = tokio::time::timeout(timeout, wait) => result.unwrap_or(Err(TorrentError::Timeout {
                operation: "buffering".to_string(),
            })),
            _ = self.closer().wait() => Err(TorrentError::Closed),
        }
    }

    /// Fails every buffer waiter.
    pub fn fail_buffering(&self, reason: impl Into<String>) {
        self.buffer_events.broadcast(BufferEvent::Failed {
            reason: reason.into(),
        });
        self.release_rate_slot();
    }
}

fn block_ratio(partial: &PartialPiece) -> f64 {
    let (done, total) = partial.blocks.iter().fold((0u64, 0u64), |(done, total), block| {
        (
            done + u64::from(block.bytes_progress),
            total + u64::from(block.block_size),
        )
    });
    if total == 0 {
        0.0
    } else {
        (done as f64 / total as f64).min(1.0)
    }
}
