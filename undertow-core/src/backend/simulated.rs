//! Deterministic in-process BitTorrent library.
//!
//! Nothing is downloaded. Tests drive progress explicitly: pieces complete
//! when told to, metadata arrives when delivered, and every request the
//! engine makes (priorities, deadlines, settings, port mappings) is recorded
//! for inspection. Piece bytes follow `torrent::creation::content_byte`, so
//! torrents built with `TorrentBuilder` verify.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::debug;

use super::{
    AddTorrentParams, Alert, AlertKind, BackendError, BlockInfo, BtSession, BtTorrent,
    MemoryStorage, PartialPiece, PieceRead, PortProtocol, SettingsPack, StorageMode,
    TorrentInfo, TorrentSource, TorrentState, TorrentStatus,
};
use crate::torrent::InfoHash;
use crate::torrent::bitfield::BitField;
use crate::torrent::creation::fill_content;
use crate::torrent::parsing::{Bencode, BencodeParser};

/// Alert queue shared by the session and its torrents.
#[derive(Default)]
struct AlertSink {
    queue: Mutex<VecDeque<Alert>>,
    notify: Notify,
}

impl AlertSink {
    fn push(&self, alert: Alert) {
        self.queue.lock().push_back(alert);
        self.notify.notify_one();
    }
}

/// A recorded port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMappingRecord {
    pub id: i32,
    pub protocol: PortProtocol,
    pub external_port: u16,
    pub local_port: u16,
}

#[derive(Default)]
pub struct SimulatedSession {
    torrents: Mutex<HashMap<InfoHash, Arc<SimulatedTorrent>>>,
    settings: Mutex<SettingsPack>,
    applied: Mutex<Vec<SettingsPack>>,
    mappings: Mutex<Vec<PortMappingRecord>>,
    removed: Mutex<Vec<(InfoHash, bool)>>,
    added: Mutex<Vec<AddTorrentParams>>,
    alerts: Arc<AlertSink>,
    next_mapping: AtomicI32,
    closed: AtomicBool,
}

impl SimulatedSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn torrent(&self, info_hash: &InfoHash) -> Option<Arc<SimulatedTorrent>> {
        self.torrents.lock().get(info_hash).cloned()
    }

    /// Effective settings after every `apply_settings` call.
    pub fn settings(&self) -> SettingsPack {
        self.settings.lock().clone()
    }

    pub fn setting_int(&self, key: &str) -> Option<i64> {
        self.settings.lock().get_int(key)
    }

    /// Every pack passed to `apply_settings`, in order.
    pub fn applied_settings(&self) -> Vec<SettingsPack> {
        self.applied.lock().clone()
    }

    pub fn port_mappings(&self) -> Vec<PortMappingRecord> {
        self.mappings.lock().clone()
    }

    /// `(info_hash, delete_files)` for every removal.
    pub fn removed(&self) -> Vec<(InfoHash, bool)> {
        self.removed.lock().clone()
    }

    pub fn added(&self) -> Vec<AddTorrentParams> {
        self.added.lock().clone()
    }

    pub fn push_alert(&self, alert: Alert) {
        self.alerts.push(alert);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BtSession for SimulatedSession {
    async fn add_torrent(
        &self,
        params: AddTorrentParams,
    ) -> Result<Arc<dyn BtTorrent>, BackendError> {
        if self.is_closed() {
            return Err(BackendError::SessionClosed);
        }
        let mut torrents = self.torrents.lock();
        if torrents.contains_key(&params.info_hash) {
            return Err(BackendError::DuplicateTorrent {
                info_hash: params.info_hash,
            });
        }
        let torrent = Arc::new(SimulatedTorrent::new(&params, self.alerts.clone())?);
        torrents.insert(params.info_hash, torrent.clone());
        self.added.lock().push(params);
        Ok(torrent)
    }

    async fn remove_torrent(
        &self,
        info_hash: &InfoHash,
        delete_files: bool,
    ) -> Result<(), BackendError> {
        let torrent = self
            .torrents
            .lock()
            .remove(info_hash)
            .ok_or(BackendError::InvalidHandle)?;
        torrent.valid.store(false, Ordering::SeqCst);
        if delete_files && torrent.storage == StorageMode::File {
            torrent.delete_files();
        }
        self.removed.lock().push((*info_hash, delete_files));
        self.alerts.push(Alert::new(
            AlertKind::TorrentRemoved,
            Some(*info_hash),
            torrent.name.clone(),
        ));
        Ok(())
    }

    fn find_torrent(&self, info_hash: &InfoHash) -> Option<Arc<dyn BtTorrent>> {
        self.torrent(info_hash)
            .map(|torrent| torrent as Arc<dyn BtTorrent>)
    }

    fn apply_settings(&self, pack: &SettingsPack) -> Result<(), BackendError> {
        if self.is_closed() {
            return Err(BackendError::SessionClosed);
        }
        self.settings.lock().merge(pack);
        self.applied.lock().push(pack.clone());
        Ok(())
    }

    fn add_port_mapping(
        &self,
        protocol: PortProtocol,
        external_port: u16,
        local_port: u16,
    ) -> Result<i32, BackendError> {
        if external_port == 0 {
            return Err(BackendError::Operation {
                operation: "add_port_mapping".to_string(),
                reason: "port 0 cannot be mapped".to_string(),
            });
        }
        let id = self.next_mapping.fetch_add(1, Ordering::SeqCst);
        self.mappings.lock().push(PortMappingRecord {
            id,
            protocol,
            external_port,
            local_port,
        });
        Ok(id)
    }

    async fn wait_for_alert(&self, timeout: Duration) -> bool {
        if !self.alerts.queue.lock().is_empty() {
            return true;
        }
        let _ = tokio::time::timeout(timeout, self.alerts.notify.notified()).await;
        !self.alerts.queue.lock().is_empty()
    }

    fn pop_alerts(&self) -> Vec<Alert> {
        self.alerts.queue.lock().drain(..).collect()
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.closed.store(true, Ordering::SeqCst);
        self.alerts.notify.notify_waiters();
        Ok(())
    }
}

struct SimState {
    status: TorrentStatus,
    have: BitField,
    piece_priorities: Vec<u8>,
    file_priorities: Vec<u8>,
    deadlines: BTreeMap<u32, u32>,
    partial: BTreeMap<u32, Vec<BlockInfo>>,
}

pub struct SimulatedTorrent {
    info_hash: InfoHash,
    name: String,
    save_path: PathBuf,
    storage: StorageMode,
    memory_size: u64,
    info: RwLock<Option<Arc<TorrentInfo>>>,
    state: Mutex<SimState>,
    memory: RwLock<Option<Arc<SimulatedMemoryStorage>>>,
    valid: AtomicBool,
    alerts: Arc<AlertSink>,
    reannounces: AtomicU32,
    dht_announces: AtomicU32,
    pauses: AtomicU32,
    resumes: AtomicU32,
    resume_requests: AtomicU32,
}

impl SimulatedTorrent {
    fn new(params: &AddTorrentParams, alerts: Arc<AlertSink>) -> Result<Self, BackendError> {
        let info = match &params.source {
            TorrentSource::Metainfo(bytes) => Some(Arc::new(decode_info(bytes)?)),
            TorrentSource::Magnet(_) => None,
        };
        let state = if info.is_some() {
            TorrentState::Downloading
        } else {
            TorrentState::DownloadingMetadata
        };
        let torrent = Self {
            info_hash: params.info_hash,
            name: params.name.clone(),
            save_path: params.save_path.clone(),
            storage: params.storage,
            memory_size: params.memory_size,
            info: RwLock::new(None),
            state: Mutex::new(SimState {
                status: TorrentStatus {
                    state,
                    paused: params.paused,
                    auto_managed: params.auto_managed,
                    ..TorrentStatus::default()
                },
                have: BitField::new(0),
                piece_priorities: Vec::new(),
                file_priorities: Vec::new(),
                deadlines: BTreeMap::new(),
                partial: BTreeMap::new(),
            }),
            memory: RwLock::new(None),
            valid: AtomicBool::new(true),
            alerts,
            reannounces: AtomicU32::new(0),
            dht_announces: AtomicU32::new(0),
            pauses: AtomicU32::new(0),
            resumes: AtomicU32::new(0),
            resume_requests: AtomicU32::new(0),
        };
        if let Some(info) = info {
            torrent.install_info(info);
        }
        Ok(torrent)
    }

    fn install_info(&self, info: Arc<TorrentInfo>) {
        {
            let mut state = self.state.lock();
            state.have = BitField::new(info.num_pieces);
            state.piece_priorities = vec![4; info.num_pieces as usize];
            state.file_priorities = vec![4; info.files.len()];
            state.status.has_metadata = true;
            state.status.total_wanted = info.total_size;
        }
        if self.storage == StorageMode::Memory {
            *self.memory.write() = Some(Arc::new(SimulatedMemoryStorage::new(
                info.piece_length,
                info.total_size,
                info.num_pieces,
                self.memory_size,
            )));
        }
        *self.info.write() = Some(info);
    }

    fn push(&self, kind: AlertKind) {
        self.alerts
            .push(Alert::new(kind, Some(self.info_hash), self.name.clone()));
    }

    /// Completes metadata download for a magnet.
    ///
    /// # Errors
    /// - `BackendError::Operation` - `metainfo` does not decode
    pub fn deliver_metadata(&self, metainfo: Bytes) -> Result<(), BackendError> {
        let info = decode_info(&metainfo)?;
        self.install_info(Arc::new(info));
        self.push(AlertKind::MetadataReceived);
        self.set_state(TorrentState::Downloading);
        Ok(())
    }

    /// Moves to `state` and emits `StateChanged`.
    pub fn set_state(&self, state: TorrentState) {
        let prev_state = {
            let mut guard = self.state.lock();
            std::mem::replace(&mut guard.status.state, state)
        };
        if prev_state != state {
            self.push(AlertKind::StateChanged { state, prev_state });
        }
    }

    /// Marks `piece` downloaded and stores its bytes.
    pub fn complete_piece(&self, piece: u32) {
        let Some(info) = self.info.read().clone() else {
            return;
        };
        if piece >= info.num_pieces {
            return;
        }
        let start = u64::from(piece) * info.piece_length;
        let len = info.piece_length.min(info.total_size - start) as usize;
        let mut data = vec![0u8; len];
        fill_content(start, &mut data);

        match self.storage {
            StorageMode::File => {
                if let Err(e) = self.write_piece(&info, start, &data) {
                    self.push(AlertKind::FileError {
                        path: self.save_path.display().to_string(),
                        reason: e.to_string(),
                    });
                    return;
                }
            }
            StorageMode::Memory => {
                if let Some(memory) = self.memory.read().as_ref() {
                    memory.insert(piece, Bytes::from(data));
                }
            }
        }

        let finished = {
            let mut state = self.state.lock();
            state.have.set_bit(piece, true);
            state.partial.remove(&piece);
            state.deadlines.remove(&piece);
            state.status.total_done += len as u64;
            state.status.total_wanted_done = state.status.total_done;
            state.status.progress =
                state.status.total_done as f32 / info.total_size.max(1) as f32;
            state.status.need_save_resume = true;
            state.have.all()
        };
        self.push(AlertKind::PieceFinished { piece });
        if finished {
            self.push(AlertKind::TorrentFinished);
            self.set_state(TorrentState::Seeding);
        }
    }

    /// Drops `piece` from the memory cache, as an eviction would.
    pub fn evict_cached(&self, piece: u32) {
        if let Some(memory) = self.memory.read().as_ref() {
            memory.cache.lock().pop(&piece);
        }
    }

    pub fn complete_all(&self) {
        let count = self.info.read().as_ref().map_or(0, |info| info.num_pieces);
        for piece in 0..count {
            self.complete_piece(piece);
        }
    }

    pub fn set_block_progress(&self, piece: u32, blocks: Vec<BlockInfo>) {
        self.state.lock().partial.insert(piece, blocks);
    }

    /// Sets transfer counters and rates.
    pub fn set_transfer(&self, downloaded: u64, uploaded: u64, download_rate: u64, upload_rate: u64) {
        let mut state = self.state.lock();
        state.status.all_time_download = downloaded;
        state.status.all_time_upload = uploaded;
        state.status.download_rate = download_rate;
        state.status.upload_rate = upload_rate;
    }

    pub fn set_times(&self, active: Duration, seeding: Duration) {
        let mut state = self.state.lock();
        state.status.active_time = active;
        state.status.seeding_time = seeding;
    }

    pub fn deadlines(&self) -> BTreeMap<u32, u32> {
        self.state.lock().deadlines.clone()
    }

    pub fn reannounce_count(&self) -> u32 {
        self.reannounces.load(Ordering::SeqCst)
    }

    pub fn dht_announce_count(&self) -> u32 {
        self.dht_announces.load(Ordering::SeqCst)
    }

    pub fn pause_count(&self) -> u32 {
        self.pauses.load(Ordering::SeqCst)
    }

    pub fn resume_count(&self) -> u32 {
        self.resumes.load(Ordering::SeqCst)
    }

    pub fn resume_requests(&self) -> u32 {
        self.resume_requests.load(Ordering::SeqCst)
    }

    pub fn simulated_memory(&self) -> Option<Arc<SimulatedMemoryStorage>> {
        self.memory.read().clone()
    }

    fn write_piece(&self, info: &TorrentInfo, start: u64, data: &[u8]) -> std::io::Result<()> {
        let end = start + data.len() as u64;
        for file in &info.files {
            let file_end = file.offset + file.size;
            if file.size == 0 || file_end <= start || file.offset >= end {
                continue;
            }
            let from = start.max(file.offset);
            let to = end.min(file_end);
            let path = self.save_path.join(&file.path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut handle = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)?;
            if handle.metadata()?.len() < file.size {
                handle.set_len(file.size)?;
            }
            handle.seek(SeekFrom::Start(from - file.offset))?;
            handle.write_all(&data[(from - start) as usize..(to - start) as usize])?;
        }
        Ok(())
    }

    fn delete_files(&self) {
        let Some(info) = self.info.read().clone() else {
            return;
        };
        for file in &info.files {
            let _ = std::fs::remove_file(self.save_path.join(&file.path));
        }
    }

    fn check_valid(&self) -> Result<(), BackendError> {
        if self.valid.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::InvalidHandle)
        }
    }
}

impl BtTorrent for SimulatedTorrent {
    fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn status(&self) -> Result<TorrentStatus, BackendError> {
        self.check_valid()?;
        Ok(self.state.lock().status.clone())
    }

    fn torrent_info(&self) -> Option<Arc<TorrentInfo>> {
        self.info.read().clone()
    }

    fn pause(&self) -> Result<(), BackendError> {
        self.check_valid()?;
        self.pauses.fetch_add(1, Ordering::SeqCst);
        self.state.lock().status.paused = true;
        Ok(())
    }

    fn resume(&self) -> Result<(), BackendError> {
        self.check_valid()?;
        self.resumes.fetch_add(1, Ordering::SeqCst);
        self.state.lock().status.paused = false;
        Ok(())
    }

    fn set_auto_managed(&self, auto_managed: bool) -> Result<(), BackendError> {
        self.check_valid()?;
        self.state.lock().status.auto_managed = auto_managed;
        Ok(())
    }

    fn prioritize_pieces(&self, priorities: &[u8]) -> Result<(), BackendError> {
        self.check_valid()?;
        let mut state = self.state.lock();
        if priorities.len() != state.have.len() as usize {
            return Err(length_mismatch("prioritize_pieces", priorities.len(), state.have.len() as usize));
        }
        state.piece_priorities = priorities.to_vec();
        Ok(())
    }

    fn piece_priorities(&self) -> Vec<u8> {
        self.state.lock().piece_priorities.clone()
    }

    fn prioritize_files(&self, priorities: &[u8]) -> Result<(), BackendError> {
        self.check_valid()?;
        let mut state = self.state.lock();
        if priorities.len() != state.file_priorities.len() {
            return Err(length_mismatch("prioritize_files", priorities.len(), state.file_priorities.len()));
        }
        state.file_priorities = priorities.to_vec();
        Ok(())
    }

    fn file_priorities(&self) -> Vec<u8> {
        self.state.lock().file_priorities.clone()
    }

    fn set_piece_deadline(&self, piece: u32, deadline_ms: u32) -> Result<(), BackendError> {
        self.check_valid()?;
        self.state.lock().deadlines.insert(piece, deadline_ms);
        Ok(())
    }

    fn clear_piece_deadlines(&self) {
        self.state.lock().deadlines.clear();
    }

    fn piece_bitfield(&self) -> Result<Vec<u8>, BackendError> {
        self.check_valid()?;
        let mut have = self.state.lock().have.clone();
        if let Some(memory) = self.memory.read().as_ref() {
            for piece in 0..have.len() {
                if have.get_bit(piece) && !memory.contains(piece) {
                    have.set_bit(piece, false);
                }
            }
        }
        Ok(have.as_bytes().to_vec())
    }

    fn download_queue(&self) -> Vec<PartialPiece> {
        self.state
            .lock()
            .partial
            .iter()
            .map(|(piece, blocks)| PartialPiece {
                piece: *piece,
                blocks: blocks.clone(),
            })
            .collect()
    }

    fn force_reannounce(&self) {
        self.reannounces.fetch_add(1, Ordering::SeqCst);
    }

    fn force_dht_announce(&self) {
        self.dht_announces.fetch_add(1, Ordering::SeqCst);
    }

    fn save_resume_data(&self) -> Result<(), BackendError> {
        self.check_valid()?;
        self.resume_requests.fetch_add(1, Ordering::SeqCst);
        let pieces = {
            let mut state = self.state.lock();
            state.status.need_save_resume = false;
            state.have.as_bytes().to_vec()
        };
        let mut entries = BTreeMap::new();
        entries.insert(
            b"info-hash".to_vec(),
            Bencode::Bytes(self.info_hash.as_bytes().to_vec()),
        );
        entries.insert(b"pieces".to_vec(), Bencode::Bytes(pieces));
        let data = Bytes::from(Bencode::Dictionary(entries).encode());
        self.push(AlertKind::SaveResumeData { data });
        Ok(())
    }

    fn memory_storage(&self) -> Option<Arc<dyn MemoryStorage>> {
        self.memory
            .read()
            .clone()
            .map(|memory| memory as Arc<dyn MemoryStorage>)
    }

    fn save_path(&self) -> PathBuf {
        self.save_path.clone()
    }
}

fn decode_info(metainfo: &[u8]) -> Result<TorrentInfo, BackendError> {
    let metadata =
        BencodeParser::parse_bencode_data(metainfo).map_err(|e| BackendError::Operation {
            operation: "decode metainfo".to_string(),
            reason: e.to_string(),
        })?;
    Ok(TorrentInfo::from_metadata(
        &metadata,
        Some(Bytes::copy_from_slice(metainfo)),
    ))
}

fn length_mismatch(operation: &str, got: usize, expected: usize) -> BackendError {
    BackendError::Operation {
        operation: operation.to_string(),
        reason: format!("got {got} entries, expected {expected}"),
    }
}

/// Bounded piece cache. Reserved and reader pieces are evicted last.
pub struct SimulatedMemoryStorage {
    piece_length: u64,
    total_size: u64,
    piece_count: u32,
    capacity: AtomicU64,
    cache: Mutex<LruCache<u32, Bytes>>,
    reader_pieces: Mutex<Vec<u32>>,
    reserved: Mutex<Vec<u32>>,
}

impl SimulatedMemoryStorage {
    fn new(piece_length: u64, total_size: u64, piece_count: u32, capacity: u64) -> Self {
        Self {
            piece_length,
            total_size,
            piece_count,
            capacity: AtomicU64::new(capacity),
            cache: Mutex::new(LruCache::unbounded()),
            reader_pieces: Mutex::new(Vec::new()),
            reserved: Mutex::new(Vec::new()),
        }
    }

    fn slots(&self) -> usize {
        NonZeroUsize::new((self.capacity.load(Ordering::SeqCst) / self.piece_length.max(1)) as usize)
            .map_or(1, NonZeroUsize::get)
    }

    fn insert(&self, piece: u32, data: Bytes) {
        let mut cache = self.cache.lock();
        cache.put(piece, data);
        self.evict(&mut cache);
    }

    fn evict(&self, cache: &mut LruCache<u32, Bytes>) {
        let reserved = self.reserved.lock().clone();
        let readers = self.reader_pieces.lock().clone();
        while cache.len() > self.slots() {
            let victim = cache
                .iter()
                .rev()
                .map(|(piece, _)| *piece)
                .find(|piece| !reserved.contains(piece) && !readers.contains(piece))
                .or_else(|| {
                    cache
                        .iter()
                        .rev()
                        .map(|(piece, _)| *piece)
                        .find(|piece| !reserved.contains(piece))
                });
            match victim {
                Some(piece) => {
                    debug!("Evicting piece {} from memory storage", piece);
                    cache.pop(&piece);
                }
                None => {
                    cache.pop_lru();
                }
            }
        }
    }

    pub fn contains(&self, piece: u32) -> bool {
        self.cache.lock().contains(&piece)
    }

    pub fn cached_pieces(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn reader_pieces(&self) -> Vec<u32> {
        self.reader_pieces.lock().clone()
    }

    pub fn reserved_pieces(&self) -> Vec<u32> {
        self.reserved.lock().clone()
    }

    /// Drops `piece` as if it were evicted.
    pub fn forget(&self, piece: u32) {
        self.cache.lock().pop(&piece);
    }
}

impl MemoryStorage for SimulatedMemoryStorage {
    fn read_piece(&self, buf: &mut [u8], piece: u32, offset: u64) -> Result<PieceRead, BackendError> {
        if piece >= self.piece_count {
            return Err(BackendError::Operation {
                operation: "read_piece".to_string(),
                reason: format!("piece {piece} beyond {}", self.piece_count),
            });
        }
        let mut cache = self.cache.lock();
        let Some(data) = cache.get(&piece) else {
            return Ok(PieceRead::ShortBuffer);
        };
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(PieceRead::Read(n))
    }

    fn set_reader_pieces(&self, pieces: Vec<u32>) {
        *self.reader_pieces.lock() = pieces;
    }

    fn set_reserved_pieces(&self, pieces: Vec<u32>) {
        *self.reserved.lock() = pieces;
    }

    fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::SeqCst)
    }

    fn set_capacity(&self, bytes: u64) {
        self.capacity.store(bytes, Ordering::SeqCst);
        let mut cache = self.cache.lock();
        self.evict(&mut cache);
    }
}

impl std::fmt::Debug for SimulatedMemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedMemoryStorage")
            .field("piece_length", &self.piece_length)
            .field("total_size", &self.total_size)
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::TorrentBuilder;

    fn params(dir: &std::path::Path, source: TorrentSource, info_hash: InfoHash, storage: StorageMode) -> AddTorrentParams {
        AddTorrentParams {
            info_hash,
            name: "sim".to_string(),
            save_path: dir.to_path_buf(),
            source,
            trackers: Vec::new(),
            resume_data: None,
            storage,
            memory_size: 2048,
            paused: false,
            auto_managed: true,
        }
    }

    #[tokio::test]
    async fn test_file_storage_writes_piece_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let built = TorrentBuilder::new("a.mkv")
            .piece_length(1024)
            .file(&["a.mkv"], 3000)
            .build()
            .unwrap();
        let session = SimulatedSession::new();
        let handle = session
            .add_torrent(params(
                dir.path(),
                TorrentSource::Metainfo(built.bytes.clone()),
                built.metadata.info_hash,
                StorageMode::File,
            ))
            .await
            .unwrap();
        let sim = session.torrent(&built.metadata.info_hash).unwrap();

        sim.complete_piece(2);
        let bytes = std::fs::read(dir.path().join("a.mkv")).unwrap();
        assert_eq!(bytes.len(), 3000);
        assert_eq!(bytes[2048], (2048 % 251) as u8);
        assert_eq!(handle.piece_bitfield().unwrap(), vec![0b0010_0000]);
        assert!(session.wait_for_alert(Duration::from_millis(10)).await);
        assert!(matches!(
            session.pop_alerts()[0].kind,
            AlertKind::PieceFinished { piece: 2 }
        ));
    }

    #[tokio::test]
    async fn test_magnet_waits_for_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let built = TorrentBuilder::new("b.mkv")
            .file(&["b.mkv"], 10)
            .build()
            .unwrap();
        let session = SimulatedSession::new();
        let handle = session
            .add_torrent(params(
                dir.path(),
                TorrentSource::Magnet("magnet:?".to_string()),
                built.metadata.info_hash,
                StorageMode::File,
            ))
            .await
            .unwrap();
        assert!(handle.torrent_info().is_none());
        assert_eq!(handle.status().unwrap().state, TorrentState::DownloadingMetadata);

        session
            .torrent(&built.metadata.info_hash)
            .unwrap()
            .deliver_metadata(built.bytes.clone())
            .unwrap();
        assert_eq!(handle.torrent_info().unwrap().num_pieces, 1);
        let kinds: Vec<AlertKind> = session.pop_alerts().into_iter().map(|a| a.kind).collect();
        assert_eq!(kinds[0], AlertKind::MetadataReceived);
    }

    #[tokio::test]
    async fn test_memory_storage_evicts_unreserved_first() {
        let dir = tempfile::tempdir().unwrap();
        let built = TorrentBuilder::new("c.mkv")
            .piece_length(1024)
            .file(&["c.mkv"], 5000)
            .build()
            .unwrap();
        let session = SimulatedSession::new();
        let handle = session
            .add_torrent(params(
                dir.path(),
                TorrentSource::Metainfo(built.bytes.clone()),
                built.metadata.info_hash,
                StorageMode::Memory,
            ))
            .await
            .unwrap();
        let sim = session.torrent(&built.metadata.info_hash).unwrap();
        let memory = handle.memory_storage().unwrap();
        memory.set_reserved_pieces(vec![0]);

        sim.complete_piece(0);
        sim.complete_piece(1);
        sim.complete_piece(2);

        let cache = sim.simulated_memory().unwrap();
        assert_eq!(cache.cached_pieces(), 2);
        assert!(cache.contains(0));
        assert!(!cache.contains(1));

        let mut buf = [0u8; 8];
        assert_eq!(memory.read_piece(&mut buf, 2, 4).unwrap(), PieceRead::Read(8));
        assert_eq!(buf[0], ((2048 + 4) % 251) as u8);
        assert_eq!(memory.read_piece(&mut buf, 1, 0).unwrap(), PieceRead::ShortBuffer);
        assert!(memory.read_piece(&mut buf, 9, 0).is_err());
        // Evicted pieces are no longer reported as present.
        assert_eq!(handle.piece_bitfield().unwrap(), vec![0b1010_0000]);
    }

    #[tokio::test]
    async fn test_removed_handle_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let built = TorrentBuilder::new("d").file(&["d"], 10).build().unwrap();
        let session = SimulatedSession::new();
        let handle = session
            .add_torrent(params(
                dir.path(),
                TorrentSource::Metainfo(built.bytes.clone()),
                built.metadata.info_hash,
                StorageMode::File,
            ))
            .await
            .unwrap();

        let duplicate = session
            .add_torrent(params(
                dir.path(),
                TorrentSource::Metainfo(built.bytes),
                built.metadata.info_hash,
                StorageMode::File,
            ))
            .await;
        assert!(matches!(duplicate, Err(BackendError::DuplicateTorrent { .. })));

        session
            .remove_torrent(&built.metadata.info_hash, false)
            .await
            .unwrap();
        assert!(!handle.is_valid());
        assert!(matches!(handle.status(), Err(BackendError::InvalidHandle)));
        assert_eq!(session.removed(), vec![(built.metadata.info_hash, false)]);
    }
}
