//! One open reader over a torrent file.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::memory_file::{MemoryFile, resolve_seek};
use super::{PIECE_WAIT_INTERVAL, ReaderError, SHORT_BUFFER_RETRY};
use crate::backend::PieceRead;
use crate::torrent::{File, ReaderState, Torrent};

enum Backing {
    /// Opened lazily; the library creates the file with its first piece.
    Disk {
        path: PathBuf,
        handle: Option<tokio::fs::File>,
    },
    Memory(MemoryFile),
}

impl Backing {
    fn close(&mut self) {
        match self {
            Backing::Disk { handle, .. } => *handle = None,
            Backing::Memory(memory) => memory.close(),
        }
    }
}

struct EntryState {
    backing: Backing,
    position: u64,
}

/// Random-access reader registered with its torrent.
///
/// `read` and `seek` are serialized by an internal lock. `seek` and `close`
/// interrupt a read that is waiting for a piece.
pub struct FsEntry {
    torrent: Arc<Torrent>,
    reader: Arc<ReaderState>,
    state: Mutex<EntryState>,
    seek_epoch: watch::Sender<u64>,
    closed: CancellationToken,
}

impl FsEntry {
    /// Registers a reader over `file`.
    ///
    /// # Errors
    /// - `TorrentError::InvalidState` - memory storage without a cache handle
    pub(super) fn open(torrent: Arc<Torrent>, file: Arc<File>) -> Result<Self, ReaderError> {
        let backing = match torrent.handle().memory_storage() {
            Some(storage) => Backing::Memory(MemoryFile::new(storage, file.clone())),
            None => Backing::Disk {
                path: torrent
                    .context()
                    .config()
                    .paths
                    .download_path
                    .join(&file.path),
                handle: None,
            },
        };
        file.set_selected(true);
        let reader = torrent.register_reader(file);
        let (seek_epoch, _) = watch::channel(0);
        Ok(Self {
            torrent,
            reader,
            state: Mutex::new(EntryState {
                backing,
                position: 0,
            }),
            seek_epoch,
            closed: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.reader.id
    }

    pub fn file(&self) -> &Arc<File> {
        &self.reader.file
    }

    pub fn torrent(&self) -> &Arc<Torrent> {
        &self.torrent
    }

    pub fn size(&self) -> u64 {
        self.reader.file.size
    }

    pub fn readahead(&self) -> u64 {
        self.reader.readahead()
    }

    /// Inclusive piece range this reader wants next.
    pub fn pieces_range(&self) -> (u32, u32) {
        self.torrent.reader_pieces_range(&self.reader)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Reads up to `buf.len()` bytes, waiting for missing pieces.
    ///
    /// Returns `Ok(0)` at end of file. Once some bytes are read, a missing
    /// piece ends the read early instead of waiting.
    ///
    /// # Errors
    /// - `ReaderError::Closed` - the entry or its torrent was closed
    /// - `ReaderError::Seeked` - a seek happened while waiting
    /// - `ReaderError::Io` - the downloaded file could not be read
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, ReaderError> {
        self.ensure_open()?;
        let epoch = *self.seek_epoch.borrow();
        let mut state = self.state.lock().await;
        self.ensure_open()?;
        if *self.seek_epoch.borrow() != epoch {
            return Err(ReaderError::Seeked);
        }
        self.torrent.set_reader_active(&self.reader, true);

        let file = self.reader.file.clone();
        let piece_length = self
            .torrent
            .layout()
            .map_or(1, |layout| layout.piece_length);
        let mut total = 0;
        while total < buf.len() && state.position < file.size {
            let (piece, offset) = file.piece_from_offset(state.position);
            if !self.torrent.has_piece(piece) {
                if total > 0 {
                    break;
                }
                self.wait_for_piece(piece, epoch).await?;
            }
            let in_piece = (piece_length - offset).min(file.size - state.position);
            let want = ((buf.len() - total) as u64).min(in_piece) as usize;
            let chunk = &mut buf[total..total + want];

            let position = state.position;
            let n = match &mut state.backing {
                Backing::Disk { path, handle } => read_disk(path, handle, position, chunk).await?,
                Backing::Memory(memory) => {
                    memory.seek(SeekFrom::Start(position))?;
                    match memory.read(chunk, piece_length)? {
                        PieceRead::Read(n) => n,
                        PieceRead::ShortBuffer => {
                            if total > 0 {
                                break;
                            }
                            debug!("Piece {} not in cache, retrying", piece);
                            self.retry_evicted(piece, epoch).await?;
                            continue;
                        }
                    }
                }
            };
            if n == 0 {
                break;
            }
            state.position += n as u64;
            total += n;
        }
        self.reader.set_position(state.position);
        Ok(total)
    }

    async fn wait_for_piece(&self, piece: u32, epoch: u64) -> Result<(), ReaderError> {
        self.torrent.request_piece(piece)?;
        let result = self.poll_piece(piece, epoch).await;
        self.torrent.release_piece(piece);
        result
    }

    async fn poll_piece(&self, piece: u32, epoch: u64) -> Result<(), ReaderError> {
        let mut seeks = self.seek_epoch.subscribe();
        let mut ticker = tokio::time::interval(PIECE_WAIT_INTERVAL);
        loop {
            if *seeks.borrow_and_update() != epoch {
                return Err(ReaderError::Seeked);
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if self.torrent.has_piece(piece) {
                        return Ok(());
                    }
                    // Priorities may have been rewritten by another reader.
                    self.torrent.request_piece(piece)?;
                }
                _ = seeks.changed() => {}
                _ = self.closed.cancelled() => return Err(ReaderError::Closed),
                _ = self.torrent.closer().wait() => return Err(ReaderError::Closed),
                _ = self.torrent.context().shutdown.cancelled() => return Err(ReaderError::Closed),
            }
        }
    }

    /// The bitfield may still list an evicted piece; request it again and
    /// back off instead of polling the stale view.
    async fn retry_evicted(&self, piece: u32, epoch: u64) -> Result<(), ReaderError> {
        self.torrent.request_piece(piece)?;
        let result = self.sleep_or_cancel(epoch).await;
        self.torrent.release_piece(piece);
        result
    }

    async fn sleep_or_cancel(&self, epoch: u64) -> Result<(), ReaderError> {
        let mut seeks = self.seek_epoch.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(SHORT_BUFFER_RETRY) => {}
            _ = self.closed.cancelled() => return Err(ReaderError::Closed),
            _ = self.torrent.closer().wait() => return Err(ReaderError::Closed),
            _ = self.torrent.context().shutdown.cancelled() => return Err(ReaderError::Closed),
            _ = seeks.wait_for(|current| *current != epoch) => return Err(ReaderError::Seeked),
        }
        Ok(())
    }

    /// Moves the position. `SeekFrom::Start` also makes every other reader of
    /// the torrent idle and re-prioritizes.
    ///
    /// # Errors
    /// - `ReaderError::Closed` - the entry was closed
    /// - `ReaderError::OutOfBounds` - target outside the file
    pub async fn seek(&self, pos: SeekFrom) -> Result<u64, ReaderError> {
        self.ensure_open()?;
        // Bump before locking so a read blocked on a piece lets go.
        self.seek_epoch.send_modify(|epoch| *epoch += 1);
        let mut state = self.state.lock().await;
        let target = resolve_seek(pos, state.position, self.reader.file.size)?;
        state.position = target;
        self.reader.set_position(target);
        drop(state);

        self.torrent.set_reader_active(&self.reader, true);
        if matches!(pos, SeekFrom::Start(_)) {
            self.torrent.mark_other_readers_inactive(self.reader.id);
            if let Err(e) = self.torrent.prioritize_pieces() {
                debug!("Prioritization after seek skipped: {}", e);
            }
        }
        Ok(target)
    }

    pub async fn position(&self) -> u64 {
        self.state.lock().await.position
    }

    /// Deregisters the reader. Pending reads fail with `Closed`.
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        // A read in flight still holds the state; it ends with `Closed`.
        if let Ok(mut state) = self.state.try_lock() {
            state.backing.close();
        }
        self.torrent.unregister_reader(self.reader.id);
    }

    fn ensure_open(&self) -> Result<(), ReaderError> {
        if self.closed.is_cancelled() || self.torrent.is_removed() {
            Err(ReaderError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for FsEntry {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_disk(
    path: &Path,
    handle: &mut Option<tokio::fs::File>,
    position: u64,
    buf: &mut [u8],
) -> Result<usize, ReaderError> {
    let file = match handle {
        Some(file) => file,
        None => handle.insert(tokio::fs::File::open(path).await.inspect_err(|e| {
            warn!("Failed to open {}: {}", path.display(), e);
        })?),
    };
    file.seek(SeekFrom::Start(position)).await?;
    Ok(file.read(buf).await?)
}
