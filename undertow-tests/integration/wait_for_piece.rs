//! Blocking reads over pieces that are still downloading.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, timeout};
use undertow_core::ReaderError;
use undertow_core::backend::BtTorrent;
use undertow_core::service::testing::TestService;
use undertow_core::streaming::PIECE_WAIT_INTERVAL;
use undertow_core::torrent::creation::content_byte;

use super::fixtures::{PIECE, add_built, single_file};

#[tokio::test]
async fn test_read_returns_once_piece_arrives() {
    let test = TestService::new(|_| {});
    let (torrent, sim) = add_built(&test, &single_file("movie.mkv", 64)).await;
    let entry = Arc::new(test.service.fs().open(Path::new("movie.mkv")).unwrap());
    let start = 42 * PIECE + 100;
    entry.seek(SeekFrom::Start(start)).await.unwrap();

    let read = tokio::spawn({
        let entry = entry.clone();
        async move {
            let mut buf = vec![0u8; 64];
            let n = entry.read(&mut buf).await?;
            buf.truncate(n);
            Ok::<_, ReaderError>(buf)
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!read.is_finished());
    assert_eq!(torrent.awaiting_pieces(), vec![42]);
    assert_eq!(sim.piece_priorities()[42], 7);
    assert_eq!(sim.deadlines().get(&42), Some(&0));

    sim.complete_piece(42);
    let data = timeout(Duration::from_secs(5), read)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(data.len(), 64);
    for (i, byte) in data.iter().enumerate() {
        assert_eq!(*byte, content_byte(start + i as u64));
    }
    assert!(torrent.awaiting_pieces().is_empty());
    assert_eq!(entry.position().await, start + 64);
}

#[tokio::test]
async fn test_close_interrupts_blocked_read() {
    let test = TestService::new(|_| {});
    let (torrent, _sim) = add_built(&test, &single_file("movie.mkv", 64)).await;
    let entry = Arc::new(test.service.fs().open(Path::new("movie.mkv")).unwrap());
    entry.seek(SeekFrom::Start(42 * PIECE)).await.unwrap();

    let read = tokio::spawn({
        let entry = entry.clone();
        async move {
            let mut buf = vec![0u8; 16];
            entry.read(&mut buf).await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let closed_at = Instant::now();
    entry.close();
    let result = timeout(Duration::from_secs(2), read).await.unwrap().unwrap();
    assert!(matches!(result, Err(ReaderError::Closed)));
    assert!(closed_at.elapsed() <= PIECE_WAIT_INTERVAL);
    assert_eq!(torrent.reader_count(), 0);

    let mut buf = [0u8; 4];
    assert!(matches!(entry.read(&mut buf).await, Err(ReaderError::Closed)));
}

#[tokio::test]
async fn test_concurrent_reads_and_close_settle() {
    let test = TestService::new(|_| {});
    let (_torrent, sim) = add_built(&test, &single_file("movie.mkv", 32)).await;
    for piece in 0..8 {
        sim.complete_piece(piece);
    }
    let entry = Arc::new(test.service.fs().open(Path::new("movie.mkv")).unwrap());

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let entry = entry.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; PIECE as usize];
                loop {
                    match entry.read(&mut buf).await {
                        Ok(0) => return Ok(()),
                        Ok(_) => {}
                        Err(e) => return Err(e),
                    }
                }
            })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(30)).await;
    entry.close();

    for reader in readers {
        let result = timeout(Duration::from_secs(2), reader).await.unwrap().unwrap();
        assert!(matches!(result, Err(ReaderError::Closed)));
    }
}

#[tokio::test]
async fn test_seek_releases_blocked_read() {
    let test = TestService::new(|_| {});
    let (torrent, sim) = add_built(&test, &single_file("movie.mkv", 64)).await;
    sim.complete_piece(0);
    let entry = Arc::new(test.service.fs().open(Path::new("movie.mkv")).unwrap());
    entry.seek(SeekFrom::Start(50 * PIECE)).await.unwrap();

    let read = tokio::spawn({
        let entry = entry.clone();
        async move {
            let mut buf = vec![0u8; 16];
            entry.read(&mut buf).await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    entry.seek(SeekFrom::Start(0)).await.unwrap();

    let result = timeout(Duration::from_secs(2), read).await.unwrap().unwrap();
    assert!(matches!(result, Err(ReaderError::Seeked)));
    assert!(torrent.awaiting_pieces().is_empty());

    let mut buf = [0u8; 8];
    assert_eq!(entry.read(&mut buf).await.unwrap(), 8);
    assert_eq!(buf[7], content_byte(7));
}
