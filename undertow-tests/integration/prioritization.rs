//! Reader-driven priorities, deadlines and readahead budgets.

use std::io::SeekFrom;
use std::path::Path;

use undertow_core::backend::{BtTorrent, StorageMode};
use undertow_core::service::testing::TestService;

use super::fixtures::{PIECE, add_built, single_file};

/// Priority bands ahead of a reader starting at `begin`.
fn assert_bands(priorities: &[u8], begin: usize) {
    assert_eq!(priorities[begin], 6, "piece {begin}");
    assert_eq!(&priorities[begin + 1..=begin + 2], &[5, 5]);
    assert_eq!(&priorities[begin + 3..=begin + 5], &[4, 4, 4]);
    assert_eq!(&priorities[begin + 6..=begin + 9], &[3, 3, 3, 3]);
}

#[tokio::test]
async fn test_two_readers_on_disk() {
    let test = TestService::new(|_| {});
    let (torrent, sim) = add_built(&test, &single_file("movie.mkv", 400)).await;
    torrent.select_file(0).unwrap();

    let fs = test.service.fs();
    let first = fs.open(Path::new("movie.mkv")).unwrap();
    first.seek(SeekFrom::Start(10 * PIECE)).await.unwrap();
    let second = fs.open(Path::new("movie.mkv")).unwrap();
    second.seek(SeekFrom::Start(200 * PIECE)).await.unwrap();
    assert_eq!(torrent.reader_count(), 2);

    torrent.prioritize_pieces().unwrap();
    let priorities = sim.piece_priorities();
    assert_eq!(priorities.len(), 400);
    assert_bands(&priorities, 10);
    assert_bands(&priorities, 200);
    assert!(priorities[20..200].iter().all(|p| *p == 2));
    assert!(priorities[210..].iter().all(|p| *p == 2));
    // Chosen file pieces no reader covers stay wanted.
    assert!(priorities[..10].iter().all(|p| *p == 1));

    second.close();
    first.close();
    assert_eq!(torrent.reader_count(), 0);
}

#[tokio::test]
async fn test_memory_readers_get_deadlines_within_budget() {
    let test = TestService::new(|config| {
        config.storage.download_storage = StorageMode::Memory;
        config.storage.memory_size = 64 * PIECE;
    });
    let (torrent, sim) = add_built(&test, &single_file("movie.mkv", 400)).await;

    let fs = test.service.fs();
    let first = fs.open(Path::new("movie.mkv")).unwrap();
    first.seek(SeekFrom::Start(10 * PIECE)).await.unwrap();
    let second = fs.open(Path::new("movie.mkv")).unwrap();
    second.seek(SeekFrom::Start(200 * PIECE)).await.unwrap();

    let budget = torrent.readahead_size();
    assert_eq!(budget, 63 * PIECE);
    assert!(first.readahead() + second.readahead() <= budget);
    assert!(second.readahead() > first.readahead());

    let priorities = sim.piece_priorities();
    assert_bands(&priorities, 200);
    assert_eq!(priorities[0], 0);
    assert_eq!(priorities[399], 0);

    let deadlines = sim.deadlines();
    assert_eq!(deadlines.get(&200), Some(&0));
    assert_eq!(deadlines.get(&201), Some(&100));
    assert_eq!(deadlines.get(&205), Some(&500));

    let memory = sim.simulated_memory().unwrap();
    let (begin, end) = second.pieces_range();
    assert_eq!(begin, 200);
    assert!(memory.reader_pieces().contains(&end));
}
