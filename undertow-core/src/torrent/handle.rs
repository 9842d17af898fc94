//! The per-torrent object: identity, metadata, lifecycle and drop.
//!
//! Buffering, piece prioritization and reader bookkeeping live in sibling
//! modules as further `impl Torrent` blocks.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::buffer::{BufferEvent, BufferState};
use super::lifecycle::{Lifecycle, LifecycleState};
use super::parsing::{BencodeParser, TorrentDescriptor};
use super::readers::ReaderState;
use super::selection::{EpisodeHint, choose_file};
use super::{File, InfoHash, PieceBitfield, QueueItem, TorrentError};
use crate::backend::{BtTorrent, StorageMode, TorrentInfo, TorrentState, TorrentStatus};
use crate::context::EngineContext;
use crate::events::{Broadcaster, Event, Listener};

/// How often the watch loop samples buffer progress and re-prioritizes.
pub const WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Piece geometry and file records, fixed once metadata is known.
#[derive(Debug)]
pub struct TorrentLayout {
    pub piece_length: u64,
    pub piece_count: u32,
    pub total_length: u64,
    pub files: Vec<Arc<File>>,
}

impl TorrentLayout {
    pub fn from_info(info: &TorrentInfo) -> Self {
        let files = info
            .files
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                Arc::new(File::new(index, entry, info.piece_length, info.num_pieces))
            })
            .collect();
        Self {
            piece_length: info.piece_length,
            piece_count: info.num_pieces,
            total_length: info.total_size,
            files,
        }
    }

    pub fn file(&self, index: usize) -> Option<&Arc<File>> {
        self.files.get(index)
    }

    /// Length of `piece`; only the last piece can be short.
    pub fn piece_size(&self, piece: u32) -> u64 {
        let start = u64::from(piece) * self.piece_length;
        self.piece_length.min(self.total_length.saturating_sub(start))
    }
}

/// One torrent from add to drop.
pub struct Torrent {
    pub(super) info_hash: InfoHash,
    pub(super) uri: String,
    pub(super) name: RwLock<String>,
    pub(super) handle: Arc<dyn BtTorrent>,
    pub(super) ctx: Arc<EngineContext>,
    pub(super) storage: StorageMode,
    pub(super) memory_size: AtomicU64,
    pub(super) layout: RwLock<Option<Arc<TorrentLayout>>>,
    pub(super) chosen: RwLock<BTreeSet<usize>>,
    pub(super) reserved: RwLock<BTreeSet<u32>>,
    pub(super) awaiting: Mutex<BTreeSet<u32>>,
    pub(super) readers: Mutex<HashMap<u64, Arc<ReaderState>>>,
    pub(super) buffer: Mutex<BufferState>,
    pub(super) lifecycle: Mutex<Lifecycle>,
    pub(super) pieces: PieceBitfield,
    pub(super) buffer_events: Broadcaster<BufferEvent>,
    pub(super) holds_rate_slot: AtomicBool,
    buffering_finished: AtomicBool,
    next_episode: AtomicBool,
    rar_archive: AtomicBool,
    not_enough_space: AtomicBool,
    space_checked: AtomicBool,
    seeded: AtomicBool,
    episode: RwLock<Option<EpisodeHint>>,
    got_metainfo: Event,
    closer: Event,
}

impl Torrent {
    pub fn new(
        descriptor: &TorrentDescriptor,
        handle: Arc<dyn BtTorrent>,
        ctx: Arc<EngineContext>,
        storage: StorageMode,
        memory_size: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            info_hash: descriptor.info_hash,
            uri: descriptor.uri.clone(),
            name: RwLock::new(descriptor.name.clone()),
            handle,
            ctx,
            storage,
            memory_size: AtomicU64::new(memory_size),
            layout: RwLock::new(None),
            chosen: RwLock::new(BTreeSet::new()),
            reserved: RwLock::new(BTreeSet::new()),
            awaiting: Mutex::new(BTreeSet::new()),
            readers: Mutex::new(HashMap::new()),
            buffer: Mutex::new(BufferState::default()),
            lifecycle: Mutex::new(Lifecycle::new()),
            pieces: PieceBitfield::new(0),
            buffer_events: Broadcaster::new(),
            holds_rate_slot: AtomicBool::new(false),
            buffering_finished: AtomicBool::new(false),
            next_episode: AtomicBool::new(false),
            rar_archive: AtomicBool::new(false),
            not_enough_space: AtomicBool::new(false),
            space_checked: AtomicBool::new(false),
            seeded: AtomicBool::new(false),
            episode: RwLock::new(None),
            got_metainfo: Event::new(),
            closer: Event::new(),
        })
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn storage(&self) -> StorageMode {
        self.storage
    }

    pub fn handle(&self) -> &Arc<dyn BtTorrent> {
        &self.handle
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn memory_size(&self) -> u64 {
        self.memory_size.load(Ordering::SeqCst)
    }

    /// # Errors
    /// - `BackendError::InvalidHandle` - torrent was removed from the session
    pub fn status(&self) -> Result<TorrentStatus, TorrentError> {
        Ok(self.handle.status()?)
    }

    pub fn layout(&self) -> Option<Arc<TorrentLayout>> {
        self.layout.read().clone()
    }

    pub fn has_metadata(&self) -> bool {
        self.got_metainfo.is_set()
    }

    pub fn files(&self) -> Vec<Arc<File>> {
        self.layout().map(|layout| layout.files.clone()).unwrap_or_default()
    }

    pub fn chosen_files(&self) -> Vec<Arc<File>> {
        let Some(layout) = self.layout() else {
            return Vec::new();
        };
        self.chosen
            .read()
            .iter()
            .filter_map(|index| layout.file(*index).cloned())
            .collect()
    }

    /// File whose path relative to the download root is `path`.
    pub fn file_by_path(&self, path: &Path) -> Option<Arc<File>> {
        self.files().into_iter().find(|file| file.matches_path(path))
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.lifecycle.lock().state()
    }

    pub fn is_paused(&self) -> bool {
        self.lifecycle.lock().is_paused()
    }

    pub fn is_buffering(&self) -> bool {
        self.lifecycle.lock().effective() == LifecycleState::Buffering
    }

    pub fn is_playing(&self) -> bool {
        self.lifecycle.lock().effective() == LifecycleState::Playing
    }

    pub fn is_seeding(&self) -> bool {
        self.lifecycle.lock().effective() == LifecycleState::Seeding
    }

    pub fn is_removed(&self) -> bool {
        self.closer.is_set()
    }

    pub fn is_buffering_finished(&self) -> bool {
        self.buffering_finished.load(Ordering::SeqCst)
    }

    pub(super) fn set_buffering_finished(&self, finished: bool) -> bool {
        self.buffering_finished.swap(finished, Ordering::SeqCst)
    }

    pub fn is_next_episode(&self) -> bool {
        self.next_episode.load(Ordering::SeqCst)
    }

    pub fn set_next_episode(&self, next: bool) {
        self.next_episode.store(next, Ordering::SeqCst);
    }

    pub fn is_rar_archive(&self) -> bool {
        self.rar_archive.load(Ordering::SeqCst)
    }

    pub fn not_enough_space(&self) -> bool {
        self.not_enough_space.load(Ordering::SeqCst)
    }

    /// True once `seeded` was marked by policy or natural completion.
    pub fn is_seeded(&self) -> bool {
        self.seeded.load(Ordering::SeqCst)
    }

    pub fn mark_seeded(&self) {
        if !self.seeded.swap(true, Ordering::SeqCst) {
            info!("Torrent {} is seeded", self.info_hash);
        }
    }

    /// Claims the one-time space check; false if it already ran.
    pub fn claim_space_check(&self) -> bool {
        !self.space_checked.swap(true, Ordering::SeqCst)
    }

    pub fn episode(&self) -> Option<EpisodeHint> {
        *self.episode.read()
    }

    pub fn set_episode(&self, hint: EpisodeHint) {
        *self.episode.write() = Some(hint);
    }

    /// Buffer events from now on.
    pub fn subscribe_buffer(&self) -> Listener<BufferEvent> {
        self.buffer_events.listen()
    }

    /// Set once the torrent is dropped.
    pub fn closer(&self) -> &Event {
        &self.closer
    }

    /// Builds the layout once the library knows the metadata.
    ///
    /// Idempotent. Writes the canonical `.torrent` copy for disk storage
    /// unless one already exists.
    ///
    /// # Errors
    /// - `TorrentError::InvalidState` - the library has no metadata yet
    pub fn on_metadata_received(&self) -> Result<(), TorrentError> {
        if self.got_metainfo.is_set() {
            return Ok(());
        }
        let info = self
            .handle
            .torrent_info()
            .ok_or_else(|| TorrentError::InvalidState {
                reason: format!("no metadata for {}", self.info_hash),
            })?;

        let layout = Arc::new(TorrentLayout::from_info(&info));
        self.pieces.reset(layout.piece_count);
        *self.name.write() = info.name.clone();
        *self.layout.write() = Some(layout.clone());

        if self.storage == StorageMode::File
            && let Some(metainfo) = &info.metainfo
            && let Err(e) = self.write_canonical_torrent(metainfo, &info.trackers)
        {
            warn!(
                "Failed to write torrent file for {}: {}",
                self.info_hash, e
            );
        }

        if let Err(e) = self.lifecycle.lock().transition(LifecycleState::Idle) {
            debug!("Metadata for {} in unexpected state: {}", self.info_hash, e);
        }
        info!(
            "Metadata for {}: {} pieces of {} bytes, {} files",
            self.info_hash,
            layout.piece_count,
            layout.piece_length,
            layout.files.len()
        );
        self.got_metainfo.set();
        Ok(())
    }

    fn write_canonical_torrent(&self, metainfo: &[u8], trackers: &[String]) -> Result<(), TorrentError> {
        let path = self.torrent_file_path();
        if path.exists() {
            return Ok(());
        }
        let canonical = BencodeParser::canonical_torrent(metainfo, trackers)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, canonical)?;
        debug!("Saved torrent file {}", path.display());
        Ok(())
    }

    pub fn torrent_file_path(&self) -> PathBuf {
        self.ctx.config().torrent_file_path(&self.info_hash)
    }

    pub fn fastresume_path(&self) -> PathBuf {
        self.ctx.config().fastresume_path(&self.info_hash)
    }

    pub fn parts_path(&self) -> PathBuf {
        self.ctx.config().parts_path(&self.info_hash)
    }

    /// Waits until metadata is known.
    ///
    /// # Errors
    /// - `TorrentError::Closed` - torrent was dropped or the service shut down
    pub async fn wait_for_metadata(&self) -> Result<Arc<TorrentLayout>, TorrentError> {
        if !self.got_metainfo.is_set() {
            tokio::select! {
                _ = self.got_metainfo.wait() => {}
                _ = self.closer.wait() => return Err(TorrentError::Closed),
                _ = self.ctx.shutdown.cancelled() => return Err(TorrentError::Closed),
            }
        }
        self.layout().ok_or(TorrentError::Closed)
    }

    /// Picks the playback file and marks it chosen.
    ///
    /// # Errors
    /// - `TorrentError::InvalidState` - metadata not known yet
    /// - `TorrentError::FileNotChosen` - no video or archive in the torrent
    pub fn choose_file(&self) -> Result<Arc<File>, TorrentError> {
        let layout = self.layout().ok_or_else(|| TorrentError::InvalidState {
            reason: "metadata not received".to_string(),
        })?;
        let config = self.ctx.config();
        let index = choose_file(
            &layout.files,
            self.episode().as_ref(),
            config.playback.smart_episode_match,
        )
        .ok_or(TorrentError::FileNotChosen {
            info_hash: self.info_hash,
        })?;
        self.select_file(index)
    }

    /// Marks file `index` chosen and selected.
    ///
    /// # Errors
    /// - `TorrentError::FileNotFound` - no file at `index`
    pub fn select_file(&self, index: usize) -> Result<Arc<File>, TorrentError> {
        let layout = self.layout().ok_or_else(|| TorrentError::InvalidState {
            reason: "metadata not received".to_string(),
        })?;
        let file = layout
            .file(index)
            .cloned()
            .ok_or_else(|| TorrentError::FileNotFound {
                path: format!("#{index}"),
            })?;
        file.set_selected(true);
        self.chosen.write().insert(index);
        if file.is_rar() {
            self.rar_archive.store(true, Ordering::SeqCst);
        }

        let chosen = self.chosen.read().clone();
        let priorities: Vec<u8> = (0..layout.files.len())
            .map(|i| if chosen.contains(&i) { 4 } else { 0 })
            .collect();
        self.handle.prioritize_files(&priorities)?;
        debug!("Chose {} in {}", file.path.display(), self.info_hash);
        Ok(file)
    }

    /// Downloads every file at normal priority.
    ///
    /// # Errors
    /// - `TorrentError::InvalidState` - metadata not known yet
    pub fn download_all_files(&self) -> Result<(), TorrentError> {
        let layout = self.layout().ok_or_else(|| TorrentError::InvalidState {
            reason: "metadata not received".to_string(),
        })?;
        for file in &layout.files {
            file.set_selected(true);
        }
        self.chosen.write().extend(0..layout.files.len());
        self.handle
            .prioritize_files(&vec![super::priority::PRIORITY_DOWNLOAD_ALL; layout.files.len()])?;
        Ok(())
    }

    /// Auto-management off, then paused. Idempotent.
    ///
    /// # Errors
    /// - `TorrentError::InvalidState` - torrent was removed
    pub fn pause(&self) -> Result<(), TorrentError> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.is_paused() {
            return Ok(());
        }
        lifecycle.pause()?;
        self.handle.set_auto_managed(false)?;
        self.handle.pause()?;
        info!("Paused {}", self.info_hash);
        Ok(())
    }

    /// Auto-management back on, then resumed. Idempotent.
    ///
    /// # Errors
    /// - `TorrentError::InvalidState` - torrent was removed
    pub fn resume(&self) -> Result<(), TorrentError> {
        let mut lifecycle = self.lifecycle.lock();
        if !lifecycle.is_paused() {
            return Ok(());
        }
        lifecycle.resume()?;
        self.handle.set_auto_managed(true)?;
        self.handle.resume()?;
        info!("Resumed {}", self.info_hash);
        Ok(())
    }

    /// Back to `Playing` when a reader reopens a buffered torrent.
    pub(super) fn resume_playback(&self) {
        if !self.is_buffering_finished() {
            return;
        }
        let mut lifecycle = self.lifecycle.lock();
        if matches!(
            lifecycle.effective(),
            LifecycleState::Idle | LifecycleState::Seeding
        ) && lifecycle.transition(LifecycleState::Playing).is_ok()
        {
            debug!("Playback of {} resumed", self.info_hash);
        }
    }

    /// `Playing` drops to `Idle`; a complete torrent goes on to `Seeding`.
    pub(super) fn finish_playback(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.effective() != LifecycleState::Playing
                || lifecycle.transition(LifecycleState::Idle).is_err()
            {
                return;
            }
        }
        info!("Playback of {} finished", self.info_hash);
        match self.handle.status() {
            Ok(status) => self.on_state_changed(status.state),
            Err(e) => debug!("No status for {}: {}", self.info_hash, e),
        }
    }

    /// Feeds a library state change into the lifecycle.
    pub fn on_state_changed(&self, state: TorrentState) {
        if !state.is_complete() {
            return;
        }
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.effective() == LifecycleState::Idle
            && lifecycle.transition(LifecycleState::Seeding).is_ok()
        {
            info!("Torrent {} finished downloading", self.info_hash);
        }
    }

    /// Fails pending buffering and pauses after disk space ran out.
    pub fn mark_not_enough_space(&self, needed: u64, available: u64) {
        self.not_enough_space.store(true, Ordering::SeqCst);
        self.buffer_events
            .broadcast(BufferEvent::NotEnoughSpace { needed, available });
        if let Err(e) = self.pause() {
            warn!("Failed to pause {} after space check: {}", self.info_hash, e);
        }
    }

    /// Drops the torrent: readers closed, library entry removed, auxiliaries
    /// deleted.
    ///
    /// # Errors
    /// - `TorrentError::Backend` - the library refused the removal
    pub async fn drop_torrent(&self, delete_files: bool) -> Result<(), TorrentError> {
        // Set before anything is deleted; the alert pump checks it.
        self.closer.set();
        self.readers.lock().clear();
        self.awaiting.lock().clear();
        self.release_rate_slot();
        self.buffer_events.close();
        self.lifecycle.lock().transition(LifecycleState::Removed)?;

        info!(
            "Removing {} ({} files)",
            self.info_hash,
            if delete_files { "deleting" } else { "keeping" }
        );
        let removed = self
            .ctx
            .session
            .remove_torrent(&self.info_hash, delete_files)
            .await;

        remove_if_present(&self.torrent_file_path());
        if delete_files {
            remove_if_present(&self.fastresume_path());
            remove_if_present(&self.parts_path());
        }
        removed.map_err(TorrentError::from)
    }

    /// Gives back the buffering rate-limit slot if this torrent holds one.
    pub(super) fn release_rate_slot(&self) {
        if self.holds_rate_slot.swap(false, Ordering::SeqCst) {
            self.ctx.buffering_finished();
        }
    }

    /// Samples buffer progress and re-prioritizes once per second until the
    /// torrent is dropped or the service shuts down.
    pub async fn run_watch(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(WATCH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.watch_tick(),
                _ = self.closer.wait() => break,
                _ = self.ctx.shutdown.cancelled() => break,
            }
        }
        debug!("Watch loop for {} stopped", self.info_hash);
    }

    pub fn spawn_watch(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.clone().run_watch())
    }

    fn watch_tick(&self) {
        if !self.has_metadata() {
            return;
        }
        if let Err(e) = self.pieces.refresh(self.handle.as_ref()) {
            debug!("Bitfield refresh for {} skipped: {}", self.info_hash, e);
        }
        let state = self.lifecycle_state();
        match state {
            LifecycleState::Buffering => self.update_buffer_progress(),
            LifecycleState::Playing => {
                if let Err(e) = self.prioritize_pieces() {
                    debug!("Prioritization for {} skipped: {}", self.info_hash, e);
                }
            }
            _ => {}
        }
    }

    /// True when `piece` is downloaded, per a view at most one refresh
    /// interval old.
    pub fn has_piece(&self, piece: u32) -> bool {
        if let Err(e) = self.pieces.refresh(self.handle.as_ref()) {
            debug!("Bitfield refresh for {} failed: {}", self.info_hash, e);
        }
        self.pieces.has_piece(piece)
    }
}

fn remove_if_present(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Deleted {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to delete {}: {}", path.display(), e),
    }
}

impl QueueItem for Torrent {
    fn info_hash(&self) -> InfoHash {
        self.info_hash
    }
}

impl std::fmt::Debug for Torrent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Torrent")
            .field("info_hash", &self.info_hash)
            .field("name", &self.name())
            .field("storage", &self.storage)
            .field("state", &self.lifecycle_state())
            .finish()
    }
}
