//! Playback file selection in multi-file torrents.

use std::path::PathBuf;
use std::sync::Arc;

use undertow_core::backend::FileEntry;
use undertow_core::config::MIB;
use undertow_core::torrent::{EpisodeHint, File, choose_file};

const PIECE_LENGTH: u64 = 4 * MIB;

fn layout(files: &[(&str, u64)]) -> Vec<Arc<File>> {
    let total: u64 = files.iter().map(|(_, size)| size).sum();
    let piece_count = total.div_ceil(PIECE_LENGTH) as u32;
    let mut offset = 0;
    files
        .iter()
        .enumerate()
        .map(|(index, (path, size))| {
            let entry = FileEntry {
                path: PathBuf::from(path),
                offset,
                size: *size,
            };
            offset += size;
            Arc::new(File::new(index, &entry, PIECE_LENGTH, piece_count))
        })
        .collect()
}

fn season_pack() -> Vec<Arc<File>> {
    layout(&[
        ("Show/sample.mkv", 10 * MIB),
        ("Show/Show.S01E01.1080p.mkv", 1536 * MIB),
        ("Show/Show.S01E02.en.srt", 200 * 1024),
        ("Show/Show.S01E02.720p.mkv", 800 * MIB),
    ])
}

#[test]
fn test_episode_match_beats_larger_file() {
    let files = season_pack();
    let hint = EpisodeHint::new(1399, 1, 2);
    assert_eq!(choose_file(&files, Some(&hint), true), Some(3));
}

#[test]
fn test_largest_video_without_usable_hint() {
    let files = season_pack();
    assert_eq!(choose_file(&files, None, true), Some(1));
    // Show id 0 means no show is known.
    assert_eq!(choose_file(&files, Some(&EpisodeHint::new(0, 1, 2)), true), Some(1));
    assert_eq!(choose_file(&files, Some(&EpisodeHint::new(1399, 1, 2)), false), Some(1));
    // No file carries the marker.
    assert_eq!(choose_file(&files, Some(&EpisodeHint::new(1399, 4, 9)), true), Some(1));
}

#[test]
fn test_archive_when_no_video() {
    let files = layout(&[
        ("Movie/movie.nfo", 2 * 1024),
        ("Movie/movie.rar", 700 * MIB),
        ("Movie/movie.r00", 700 * MIB),
    ]);
    assert_eq!(choose_file(&files, None, true), Some(1));

    let files = layout(&[("Docs/readme.txt", 1024), ("Docs/cover.jpg", 90 * 1024)]);
    assert_eq!(choose_file(&files, None, true), None);
}

#[test]
fn test_file_piece_ranges() {
    let files = season_pack();
    assert_eq!((files[0].piece_start, files[0].piece_end), (0, 2));
    // 10 MiB + 1.5 GiB ends inside piece 386.
    assert_eq!(files[1].piece_start, 2);
    assert_eq!(files[1].piece_end, 386);
    assert_eq!(files[2].piece_start, files[2].piece_end);
    let last = files.last().unwrap();
    let piece_count = (10 * MIB + 1536 * MIB + 200 * 1024 + 800 * MIB).div_ceil(PIECE_LENGTH) as u32;
    assert_eq!(last.piece_end, piece_count - 1);
}
