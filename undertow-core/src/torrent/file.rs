//! Per-file records built once metadata is known.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::backend::FileEntry;

/// One file inside a torrent's concatenated layout.
///
/// Everything except `selected` is fixed at construction.
#[derive(Debug)]
pub struct File {
    pub index: usize,
    pub name: String,
    /// Relative to the download root.
    pub path: PathBuf,
    /// Byte position inside the torrent layout.
    pub offset: u64,
    pub size: u64,
    pub piece_start: u32,
    pub piece_end: u32,
    piece_length: u64,
    selected: AtomicBool,
}

impl File {
    /// Builds the record for `entry`; the piece range is clamped into
    /// `[0, piece_count)`.
    pub fn new(index: usize, entry: &FileEntry, piece_length: u64, piece_count: u32) -> Self {
        let piece_length = piece_length.max(1);
        let last_piece = u64::from(piece_count.saturating_sub(1));
        let piece_start = (entry.offset / piece_length).min(last_piece);
        let last_byte = (entry.offset + entry.size).saturating_sub(1).max(entry.offset);
        let piece_end = (last_byte / piece_length).min(last_piece).max(piece_start);

        let name = entry
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            index,
            name,
            path: entry.path.clone(),
            offset: entry.offset,
            size: entry.size,
            piece_start: piece_start as u32,
            piece_end: piece_end as u32,
            piece_length,
            selected: AtomicBool::new(false),
        }
    }

    /// Maps a file-relative offset to `(piece, offset within piece)`.
    pub fn piece_from_offset(&self, offset: u64) -> (u32, u64) {
        let absolute = self.offset + offset;
        let piece = (absolute / self.piece_length) as u32;
        (
            piece.clamp(self.piece_start, self.piece_end),
            absolute % self.piece_length,
        )
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_end - self.piece_start + 1
    }

    pub fn is_selected(&self) -> bool {
        self.selected.load(Ordering::Acquire)
    }

    pub fn set_selected(&self, selected: bool) {
        self.selected.store(selected, Ordering::Release);
    }

    pub fn extension(&self) -> Option<String> {
        self.path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
    }

    pub fn is_video(&self) -> bool {
        super::parsing::is_video_path(&self.name)
    }

    pub fn is_rar(&self) -> bool {
        self.extension().as_deref() == Some("rar")
    }

    pub fn matches_path(&self, path: &Path) -> bool {
        self.path == path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, offset: u64, size: u64) -> FileEntry {
        FileEntry {
            path: PathBuf::from(path),
            offset,
            size,
        }
    }

    #[test]
    fn test_piece_range() {
        let file = File::new(1, &entry("Show/b.mkv", 1500, 2000), 1024, 4);
        assert_eq!(file.piece_start, 1);
        assert_eq!(file.piece_end, 3);
        assert_eq!(file.piece_count(), 3);
        assert_eq!(file.name, "b.mkv");
        assert!(!file.is_selected());
    }

    #[test]
    fn test_piece_from_offset() {
        let file = File::new(0, &entry("b.mkv", 1500, 2000), 1024, 4);
        assert_eq!(file.piece_from_offset(0), (1, 476));
        assert_eq!(file.piece_from_offset(548), (2, 0));
        assert_eq!(file.piece_from_offset(1999), (3, 403));
    }

    #[test]
    fn test_range_is_clamped() {
        // Claims more bytes than the pieces cover.
        let file = File::new(0, &entry("a", 0, 10_000), 1024, 4);
        assert_eq!(file.piece_end, 3);

        let empty = File::new(0, &entry("e", 4096, 0), 1024, 4);
        assert_eq!(empty.piece_start, 3);
        assert_eq!(empty.piece_end, 3);
    }

    #[test]
    fn test_kind_helpers() {
        let file = File::new(0, &entry("Show/Part.RAR", 0, 1), 1024, 1);
        assert!(file.is_rar());
        assert!(!file.is_video());
        assert!(file.matches_path(Path::new("Show/Part.RAR")));
    }
}
