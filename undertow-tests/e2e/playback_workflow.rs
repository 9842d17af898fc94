//! Magnet in, bytes out: metadata, pre-buffer, then a full read.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;
use undertow_core::backend::StorageMode;
use undertow_core::backend::simulated::SimulatedSession;
use undertow_core::config::UndertowConfig;
use undertow_core::host::RecordingHost;
use undertow_core::resources::FixedResources;
use undertow_core::torrent::creation::{BuiltTorrent, content_byte};
use undertow_core::torrent::{LifecycleState, TorrentBuilder};
use undertow_core::{JsonMediaLibrary, Service, ServiceParts, Torrent};

const PIECE: u64 = 16 * 1024;
const PIECES: u64 = 48;

struct Running {
    _dir: TempDir,
    session: Arc<SimulatedSession>,
    service: Arc<Service>,
}

async fn start(storage: StorageMode) -> Running {
    let dir = tempfile::tempdir().unwrap();
    let mut config = UndertowConfig::for_profile(dir.path());
    config.storage.download_storage = storage;
    config.storage.buffer_size = 6 * PIECE;
    config.storage.end_buffer_size = 2 * PIECE;
    config.storage.memory_size = 64 * PIECE;
    let session = Arc::new(SimulatedSession::new());
    let library = Arc::new(JsonMediaLibrary::open(config.library_path()).unwrap());
    let service = Service::start(ServiceParts {
        session: session.clone(),
        config,
        resources: Arc::new(FixedResources::new(1 << 40, 1 << 34)),
        host: Arc::new(RecordingHost::default()),
        library,
    })
    .await
    .unwrap();
    Running {
        _dir: dir,
        session,
        service,
    }
}

fn movie() -> BuiltTorrent {
    TorrentBuilder::new("feature.mkv")
        .piece_length(PIECE as u32)
        .file(&["feature.mkv"], PIECES * PIECE - 1000)
        .build()
        .unwrap()
}

/// Adds by magnet and lets the alert pump pick up the metadata.
async fn add_magnet(running: &Running, built: &BuiltTorrent) -> Arc<Torrent> {
    let magnet = format!("magnet:?xt=urn:btih:{}&dn=feature.mkv", built.metadata.info_hash);
    let torrent = running.service.add_torrent(&magnet, false).await.unwrap();
    let sim = running.session.torrent(&torrent.info_hash()).unwrap();
    sim.deliver_metadata(built.bytes.clone()).unwrap();
    timeout(Duration::from_secs(5), torrent.wait_for_metadata())
        .await
        .unwrap()
        .unwrap();
    torrent
}

async fn read_all(running: &Running, path: &Path, size: u64) -> Vec<u8> {
    let entry = Arc::new(running.service.fs().open(path).unwrap());
    let mut data = Vec::with_capacity(size as usize);
    let mut buf = vec![0u8; 10_000];
    loop {
        let n = timeout(Duration::from_secs(5), entry.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }
    entry.close();
    data
}

async fn play(storage: StorageMode) {
    let running = start(storage).await;
    let built = movie();
    let torrent = add_magnet(&running, &built).await;
    let sim = running.session.torrent(&torrent.info_hash()).unwrap();

    let snapshot = torrent.buffer(None).await.unwrap();
    assert_eq!(torrent.lifecycle_state(), LifecycleState::Buffering);
    for range in &snapshot.ranges {
        for piece in range.pieces() {
            sim.complete_piece(piece);
        }
    }
    timeout(Duration::from_secs(5), torrent.wait_for_buffer(Duration::from_secs(5)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(torrent.lifecycle_state(), LifecycleState::Playing);

    // The rest of the file arrives while the player reads.
    let feeder = tokio::spawn({
        let sim = sim.clone();
        async move {
            for piece in 0..PIECES as u32 {
                sim.complete_piece(piece);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    });

    let size = PIECES * PIECE - 1000;
    let path = running
        .service
        .config()
        .paths
        .download_path
        .join("feature.mkv");
    let data = read_all(&running, &path, size).await;
    feeder.await.unwrap();
    tracing::info!("Read {} bytes of {} from {:?} storage", data.len(), size, storage);

    assert_eq!(data.len() as u64, size);
    assert!(
        data.iter()
            .enumerate()
            .all(|(offset, byte)| *byte == content_byte(offset as u64))
    );
    assert_eq!(torrent.reader_count(), 0);
    assert!(!torrent.is_playing());

    timeout(Duration::from_secs(10), running.service.close())
        .await
        .unwrap()
        .unwrap();
    assert!(running.service.is_closed());
    assert!(running.session.is_closed());
}

#[tokio::test]
async fn test_playback_from_disk() {
    play(StorageMode::File).await;
}

#[tokio::test]
async fn test_playback_from_memory() {
    play(StorageMode::Memory).await;
}

#[tokio::test]
async fn test_close_without_torrents() {
    let running = start(StorageMode::File).await;
    assert!(running.service.torrents().is_empty());
    running.service.close().await.unwrap();
    // Closing twice is a no-op.
    running.service.close().await.unwrap();
}
