//! Torrents built in memory and added to a simulated service.

use std::sync::Arc;

use undertow_core::Torrent;
use undertow_core::backend::simulated::SimulatedTorrent;
use undertow_core::service::testing::TestService;
use undertow_core::torrent::TorrentBuilder;
use undertow_core::torrent::creation::BuiltTorrent;

/// Piece length for the small synthetic torrents.
pub const PIECE: u64 = 16 * 1024;

/// Single-file torrent of `pieces` pieces of `PIECE` bytes.
pub fn single_file(name: &str, pieces: u64) -> BuiltTorrent {
    TorrentBuilder::new(name)
        .piece_length(PIECE as u32)
        .file(&[name], pieces * PIECE)
        .build()
        .unwrap()
}

/// Writes `built` into the profile and adds it through the service.
pub async fn add_built(
    test: &TestService,
    built: &BuiltTorrent,
) -> (Arc<Torrent>, Arc<SimulatedTorrent>) {
    let path = test
        .dir
        .path()
        .join(format!("{}.torrent", built.metadata.info_hash));
    std::fs::write(&path, &built.bytes).unwrap();
    let torrent = test
        .service
        .add_torrent(path.to_str().unwrap(), false)
        .await
        .unwrap();
    let sim = test.session.torrent(&torrent.info_hash()).unwrap();
    (torrent, sim)
}
