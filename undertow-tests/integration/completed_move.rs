//! Finished episodes land in the shows library.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use undertow_core::Torrent;
use undertow_core::backend::TorrentState;
use undertow_core::backend::simulated::SimulatedTorrent;
use undertow_core::library::{ItemStatus, MediaItem, MediaLibrary};
use undertow_core::service::testing::TestService;
use undertow_core::torrent::TorrentBuilder;

use super::fixtures::{PIECE, add_built};

async fn finished_episode() -> (TestService, PathBuf, Arc<Torrent>, Arc<SimulatedTorrent>) {
    let test = TestService::new(|config| {
        config.storage.completed_move = true;
    });
    let out = test.dir.path().join("out");
    let mut config = (*test.service.config()).clone();
    config.paths.completed_shows_path = Some(out.clone());
    test.service.context().config.replace(config);

    let built = TorrentBuilder::new("ShowX")
        .piece_length(PIECE as u32)
        .file(&["S01E02.mkv"], 6 * PIECE)
        .build()
        .unwrap();
    let (torrent, sim) = add_built(&test, &built).await;
    sim.complete_all();
    torrent.select_file(0).unwrap();
    std::fs::write(torrent.fastresume_path(), b"d4:infoi1ee").unwrap();
    std::fs::write(torrent.parts_path(), [0u8; 4]).unwrap();
    test.library
        .upsert(MediaItem::episode(torrent.info_hash(), 1399, "Show X", Some(2020), 1, 2))
        .unwrap();
    sim.set_state(TorrentState::Finished);
    (test, out, torrent, sim)
}

fn source_path(test: &TestService, torrent: &Torrent) -> PathBuf {
    test.service
        .config()
        .paths
        .download_path
        .join(&torrent.files()[0].path)
}

fn assert_gone(path: &Path) {
    assert!(!path.exists(), "{} still exists", path.display());
}

#[tokio::test]
async fn test_finished_episode_moves_to_season_folder() {
    let (test, out, torrent, _sim) = finished_episode().await;
    let source = source_path(&test, &torrent);
    assert!(source.exists());
    let hash = torrent.info_hash();
    let season = out.join("Show X (2020)").join("Season 1");
    assert_eq!(test.service.completed_destination(&hash), Some(season.clone()));

    test.service.progress_tick().await;

    let target = season.join("S01E02.mkv");
    assert!(target.exists());
    assert_eq!(std::fs::metadata(&target).unwrap().len(), 6 * PIECE);
    assert_gone(&source);
    assert_gone(&torrent.fastresume_path());
    assert_gone(&torrent.parts_path());
    assert_gone(&torrent.torrent_file_path());

    assert!(test.service.torrent(&hash).is_none());
    assert_eq!(test.session.removed(), vec![(hash, false)]);
    assert_eq!(test.library.item(&hash).unwrap().status, ItemStatus::Remove);

    // Nothing left to move on the next pass.
    test.service.progress_tick().await;
    assert_eq!(test.session.removed().len(), 1);
}

#[tokio::test]
async fn test_open_reader_defers_move() {
    let (test, out, torrent, _sim) = finished_episode().await;
    let entry = test.service.fs().open(&torrent.files()[0].path).unwrap();
    entry.seek(SeekFrom::Start(0)).await.unwrap();

    test.service.progress_tick().await;
    assert!(torrent.is_seeded());
    assert!(test.service.torrent(&torrent.info_hash()).is_some());
    assert!(!out.join("Show X (2020)").exists());

    entry.close();
    test.service.progress_tick().await;
    assert!(test.service.torrent(&torrent.info_hash()).is_none());
    assert!(
        out.join("Show X (2020)")
            .join("Season 1")
            .join("S01E02.mkv")
            .exists()
    );
}

#[tokio::test]
async fn test_move_disabled_keeps_torrent() {
    let (test, out, torrent, _sim) = finished_episode().await;
    let mut config = (*test.service.config()).clone();
    config.storage.completed_move = false;
    test.service.context().config.replace(config);

    test.service.progress_tick().await;
    assert!(torrent.is_seeded());
    assert!(test.service.torrent(&torrent.info_hash()).is_some());
    assert!(!out.exists());
    assert!(source_path(&test, &torrent).exists());
}
