//! Path lookup across the torrent queue.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use super::{FsEntry, ReaderError};
use crate::torrent::{File, Queue, Torrent};

/// File-system facade over every torrent in the queue.
pub struct TorrentFs {
    queue: Arc<Queue<Torrent>>,
}

impl TorrentFs {
    pub fn new(queue: Arc<Queue<Torrent>>) -> Self {
        Self { queue }
    }

    /// Opens the torrent file at `path`.
    ///
    /// `path` is either relative to the download directory or absolute
    /// inside it.
    ///
    /// # Errors
    /// - `ReaderError::NotFound` - no torrent in the queue has a file at `path`
    /// - `ReaderError::Torrent` - memory storage without a cache handle
    pub fn open(&self, path: &Path) -> Result<FsEntry, ReaderError> {
        for torrent in self.queue.all() {
            let download_path = torrent.context().config().paths.download_path.clone();
            let relative = path.strip_prefix(&download_path).unwrap_or(path);
            if let Some(file) = torrent.file_by_path(relative) {
                return self.open_file(&torrent, file);
            }
        }
        debug!("Open of {} matched no torrent", path.display());
        Err(ReaderError::NotFound {
            path: path.to_path_buf(),
        })
    }

    /// Opens `file` of `torrent` directly.
    ///
    /// # Errors
    /// - `ReaderError::Closed` - the torrent was removed
    pub fn open_file(&self, torrent: &Arc<Torrent>, file: Arc<File>) -> Result<FsEntry, ReaderError> {
        if torrent.is_removed() {
            return Err(ReaderError::Closed);
        }
        info!("Opening {} from {}", file.path.display(), torrent.name());
        offer_subtitles(torrent, &file);
        FsEntry::open(torrent.clone(), file)
    }
}

/// `.srt` files of `torrent` sharing `file`'s stem, excluding `file` itself.
pub fn sibling_subtitles(torrent: &Torrent, file: &File) -> Vec<PathBuf> {
    if has_srt_extension(&file.path) {
        return Vec::new();
    }
    let stem = file.path.with_extension("");
    let stem = stem.to_string_lossy();
    torrent
        .files()
        .iter()
        .filter(|candidate| candidate.index != file.index && has_srt_extension(&candidate.path))
        .filter(|candidate| candidate.path.to_string_lossy().starts_with(stem.as_ref()))
        .map(|candidate| candidate.path.clone())
        .collect()
}

fn has_srt_extension(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("srt"))
}

fn offer_subtitles(torrent: &Torrent, file: &File) {
    let subtitles = sibling_subtitles(torrent, file);
    if subtitles.is_empty() {
        return;
    }
    let ctx = torrent.context();
    let download_path = ctx.config().paths.download_path.clone();
    let subtitles: Vec<PathBuf> = subtitles
        .iter()
        .map(|path| download_path.join(path))
        .collect();
    debug!("Offering {} subtitle(s) for {}", subtitles.len(), file.name);
    ctx.host
        .offer_subtitles(torrent.info_hash(), &download_path.join(&file.path), &subtitles);
}

#[cfg(test)]
mod tests {
    use std::io::SeekFrom;

    use super::*;
    use crate::torrent::creation::content_byte;
    use crate::torrent::fixture::{Fixture, FixtureOptions};

    fn pack_options() -> FixtureOptions {
        FixtureOptions {
            files: vec![
                (vec!["Pack", "Movie.2020.mkv"], 40 * 16 * 1024),
                (vec!["Pack", "Movie.2020.en.srt"], 2000),
                (vec!["Pack", "Other.srt"], 1000),
            ],
            ..FixtureOptions::default()
        }
    }

    fn fs_for(fixture: &Fixture) -> TorrentFs {
        let queue = Arc::new(Queue::new());
        queue.add(fixture.torrent.clone());
        TorrentFs::new(queue)
    }

    #[tokio::test]
    async fn test_open_by_relative_and_absolute_path() {
        let fixture = Fixture::new(pack_options()).await;
        fixture.complete_all();
        let fs = fs_for(&fixture);
        let file = fixture.torrent.files()[0].clone();

        let entry = fs.open(&file.path).unwrap();
        assert_eq!(entry.file().index, 0);
        let mut buf = [0u8; 4];
        assert_eq!(entry.read(&mut buf).await.unwrap(), 4);
        assert_eq!(buf[0], content_byte(file.offset));

        let absolute = fixture.ctx.config().paths.download_path.join(&file.path);
        let entry = fs.open(&absolute).unwrap();
        assert_eq!(entry.seek(SeekFrom::End(0)).await.unwrap(), file.size);
    }

    #[tokio::test]
    async fn test_open_unknown_path() {
        let fixture = Fixture::new(FixtureOptions::default()).await;
        let fs = fs_for(&fixture);
        assert!(matches!(
            fs.open(Path::new("missing.mkv")),
            Err(ReaderError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_subtitles_offered_for_video() {
        let fixture = Fixture::new(pack_options()).await;
        let fs = fs_for(&fixture);
        let files = fixture.torrent.files();

        let _entry = fs.open(&files[0].path).unwrap();
        let offers = fixture.host.subtitle_offers.lock().clone();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].2.len(), 1);
        assert!(offers[0].2[0].ends_with("Pack/Movie.2020.en.srt"));

        // Opening a subtitle never offers anything.
        let _srt = fs.open(&files[1].path).unwrap();
        assert_eq!(fixture.host.subtitle_offers.lock().len(), 1);
    }
}
