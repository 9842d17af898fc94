//! Pre-buffer setup for a magnet and buffer progress sampling.

use std::sync::Arc;
use std::time::Duration;

use undertow_core::Torrent;
use undertow_core::backend::simulated::SimulatedTorrent;
use undertow_core::backend::{BlockInfo, BtTorrent, StorageMode};
use undertow_core::config::MIB;
use undertow_core::service::testing::TestService;
use undertow_core::torrent::{BufferEvent, BufferRange, LifecycleState, TorrentBuilder};

use super::fixtures::{PIECE, add_built, single_file};

async fn buffered_magnet(storage: StorageMode) -> (TestService, Arc<Torrent>, Arc<SimulatedTorrent>) {
    let test = TestService::new(|config| {
        config.storage.download_storage = storage;
        config.storage.buffer_size = 20 * MIB;
        config.storage.end_buffer_size = 5 * MIB;
    });
    let built = TorrentBuilder::new("movie.mkv")
        .piece_length(MIB as u32)
        .file(&["movie.mkv"], 100 * MIB)
        .build()
        .unwrap();
    let magnet = format!(
        "magnet:?xt=urn:btih:{}&dn=movie.mkv",
        built.metadata.info_hash
    );
    let torrent = test.service.add_torrent(&magnet, false).await.unwrap();
    assert!(!torrent.has_metadata());

    let sim = test.session.torrent(&torrent.info_hash()).unwrap();
    sim.deliver_metadata(built.bytes.clone()).unwrap();
    test.service.process_alerts();
    assert!(torrent.has_metadata());
    (test, torrent, sim)
}

fn expected_priorities(rest: u8) -> Vec<u8> {
    (0..100u32)
        .map(|piece| if piece < 20 || piece >= 95 { 7 } else { rest })
        .collect()
}

#[tokio::test]
async fn test_single_file_magnet_buffer_on_disk() {
    let (_test, torrent, sim) = buffered_magnet(StorageMode::File).await;
    let snapshot = torrent.buffer(None).await.unwrap();

    assert_eq!(
        snapshot.ranges,
        vec![
            BufferRange {
                start_piece: 0,
                end_piece: 19,
                offset: 0,
                size: 20 * MIB,
            },
            BufferRange {
                start_piece: 95,
                end_piece: 99,
                offset: 95 * MIB,
                size: 5 * MIB,
            },
        ]
    );
    assert_eq!(snapshot.pieces_length, 25 * MIB);
    assert_eq!(sim.piece_priorities(), expected_priorities(1));

    let deadlines = sim.deadlines();
    assert_eq!(deadlines.len(), 25);
    assert!(deadlines.values().all(|deadline| *deadline == 0));
    assert!(deadlines.contains_key(&0) && deadlines.contains_key(&99));
    assert!(sim.reannounce_count() >= 1);
    assert_eq!(torrent.lifecycle_state(), LifecycleState::Buffering);
}

#[tokio::test]
async fn test_single_file_magnet_buffer_in_memory() {
    let (_test, torrent, sim) = buffered_magnet(StorageMode::Memory).await;
    let snapshot = torrent.buffer(None).await.unwrap();

    assert_eq!(snapshot.pieces_length, 25 * MIB);
    assert_eq!(sim.piece_priorities(), expected_priorities(0));
    let memory = sim.simulated_memory().unwrap();
    let reserved = memory.reserved_pieces();
    assert_eq!(reserved.len(), 25);
    assert!(reserved.contains(&19) && reserved.contains(&95));
    assert!(!reserved.contains(&20));
}

#[tokio::test]
async fn test_buffer_progress_never_decreases() {
    let test = TestService::new(|config| {
        config.storage.buffer_size = 8 * PIECE;
        config.storage.end_buffer_size = 4 * PIECE;
    });
    let (torrent, sim) = add_built(&test, &single_file("clip.mkv", 64)).await;
    let mut events = torrent.subscribe_buffer();
    let snapshot = torrent.buffer(None).await.unwrap();
    assert_eq!(snapshot.ranges.len(), 2);

    let half = PIECE as u32 / 2;
    sim.set_block_progress(
        0,
        vec![
            BlockInfo {
                bytes_progress: half,
                block_size: half,
            },
            BlockInfo {
                bytes_progress: 0,
                block_size: half,
            },
        ],
    );
    torrent.update_buffer_progress();
    let first = torrent.buffer_progress();
    assert!(first > 0.0);

    // The library may forget a partial piece; progress holds.
    sim.set_block_progress(0, Vec::new());
    torrent.update_buffer_progress();
    assert!(torrent.buffer_progress() >= first);

    for range in &snapshot.ranges {
        for piece in range.pieces() {
            sim.complete_piece(piece);
        }
    }
    torrent.wait_for_buffer(Duration::from_secs(5)).await.unwrap();
    assert!(torrent.is_buffering_finished());
    assert_eq!(torrent.lifecycle_state(), LifecycleState::Playing);

    let mut samples = Vec::new();
    let mut finished = 0;
    while let Some(event) = events.try_recv() {
        match event {
            BufferEvent::Progress(progress) => samples.push(progress),
            BufferEvent::Finished => finished += 1,
            other => panic!("unexpected buffer event {other:?}"),
        }
    }
    assert_eq!(finished, 1);
    assert!(samples.windows(2).all(|pair| pair[1] >= pair[0]));
    assert_eq!(samples.last().copied(), Some(100.0));
}
