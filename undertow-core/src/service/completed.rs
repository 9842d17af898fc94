//! Moves finished downloads into the completed library folders.
//!
//! A torrent qualifies once it is seeded and its library item has a media
//! type. The torrent leaves the session first (files kept), its auxiliary
//! files are deleted, then every chosen file is moved under the movies or
//! shows root. A failed torrent is remembered and not retried.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{Service, ServiceError};
use crate::config::UndertowConfig;
use crate::library::{ItemStatus, MediaItem, MediaType};
use crate::torrent::{File, InfoHash, Torrent};

/// Mover caches: writability per media type, torrents that already failed.
#[derive(Default)]
pub(super) struct MoveState {
    writable: Mutex<HashMap<MediaType, bool>>,
    failed: Mutex<HashSet<InfoHash>>,
}

/// `Show Name (Year)`, or just the name when the year is unknown.
pub fn show_folder(name: &str, year: Option<u16>) -> String {
    let name = sanitize(name);
    match year {
        Some(year) => format!("{name} ({year})"),
        None => name,
    }
}

/// `Season N`; season 0 holds specials.
pub fn season_folder(season: u32) -> String {
    if season == 0 {
        "Specials".to_string()
    } else {
        format!("Season {season}")
    }
}

/// Target directory for `item`, if its root is configured.
pub fn destination_dir(config: &UndertowConfig, item: &MediaItem) -> Option<PathBuf> {
    match item.media_type? {
        MediaType::Movie => config.paths.completed_movies_path.clone(),
        MediaType::Episode => {
            let root = config.paths.completed_shows_path.as_ref()?;
            Some(
                root.join(show_folder(&item.show_name, item.year))
                    .join(season_folder(item.season)),
            )
        }
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

impl Service {
    /// Moves every eligible seeded torrent. Failures are logged once.
    pub async fn move_completed(&self) {
        for torrent in self.queue.all() {
            let info_hash = torrent.info_hash();
            if !torrent.is_seeded() || self.mover.failed.lock().contains(&info_hash) {
                continue;
            }
            let Some(item) = self.library.item(&info_hash) else {
                continue;
            };
            if item.media_type.is_none() || item.status != ItemStatus::Active {
                continue;
            }
            if torrent.reader_count() > 0 || self.players.lock().contains_key(&info_hash) {
                debug!("Torrent {} still in use, not moving yet", info_hash);
                continue;
            }
            match self.move_torrent(&torrent, &item).await {
                Ok(moved) => info!("Moved {} file(s) of {}", moved.len(), torrent.name()),
                Err(e) => {
                    error!("Moving {} failed: {}", torrent.name(), e);
                    self.mover.failed.lock().insert(info_hash);
                }
            }
        }
    }

    /// Runs the move for one torrent. Returns the new file locations.
    ///
    /// # Errors
    /// - `ServiceError::Configuration` - no root configured for the media
    ///   type, or the root is not writable
    /// - `ServiceError::Torrent` - the session refused the removal
    /// - `ServiceError::Io` - a file could not be moved
    pub async fn move_torrent(
        &self,
        torrent: &Arc<Torrent>,
        item: &MediaItem,
    ) -> Result<Vec<PathBuf>, ServiceError> {
        let config = self.ctx.config();
        let media_type = item.media_type.ok_or_else(|| ServiceError::Configuration {
            reason: format!("library item for {} has no media type", item.info_hash),
        })?;
        let destination =
            destination_dir(&config, item).ok_or_else(|| ServiceError::Configuration {
                reason: format!("no completed folder configured for {media_type:?}"),
            })?;
        self.ensure_writable(media_type, &config)?;

        let files = files_to_move(torrent);
        let info_hash = torrent.info_hash();
        self.queue.delete(&info_hash);
        torrent.drop_torrent(false).await?;
        for aux in [
            torrent.parts_path(),
            torrent.fastresume_path(),
            torrent.torrent_file_path(),
        ] {
            remove_aux(&aux).await;
        }

        let download_path = config.paths.download_path.clone();
        tokio::fs::create_dir_all(&destination).await?;
        let mut moved = Vec::with_capacity(files.len());
        for file in files {
            let mut source = download_path.join(&file.path);
            if file.is_rar() {
                source = extracted_video(&source).await.ok_or_else(|| {
                    ServiceError::Configuration {
                        reason: format!("no extracted video next to {}", source.display()),
                    }
                })?;
            }
            let Some(name) = source.file_name() else {
                continue;
            };
            let target = destination.join(name);
            move_file(&source, &target).await?;
            info!("Moved {} to {}", source.display(), target.display());
            if let Some(parent) = source.parent() {
                remove_empty_dirs(parent, &download_path).await;
            }
            moved.push(target);
        }

        if let Err(e) = self.library.set_status(&info_hash, ItemStatus::Remove) {
            warn!("Library status for {} not updated: {}", info_hash, e);
        }
        Ok(moved)
    }

    fn ensure_writable(
        &self,
        media_type: MediaType,
        config: &UndertowConfig,
    ) -> Result<(), ServiceError> {
        let root = match media_type {
            MediaType::Movie => config.paths.completed_movies_path.as_ref(),
            MediaType::Episode => config.paths.completed_shows_path.as_ref(),
        }
        .ok_or_else(|| ServiceError::Configuration {
            reason: format!("no completed folder configured for {media_type:?}"),
        })?;
        let writable = *self
            .mover
            .writable
            .lock()
            .entry(media_type)
            .or_insert_with(|| {
                if let Err(e) = std::fs::create_dir_all(root) {
                    warn!("Cannot create {}: {}", root.display(), e);
                }
                self.ctx.resources.is_writable(root)
            });
        if writable {
            Ok(())
        } else {
            Err(ServiceError::Configuration {
                reason: format!("{} is not writable", root.display()),
            })
        }
    }
}

/// Chosen files, or every file when nothing was chosen.
fn files_to_move(torrent: &Torrent) -> Vec<Arc<File>> {
    let chosen = torrent.chosen_files();
    if chosen.is_empty() {
        torrent.files()
    } else {
        chosen
    }
}

/// First video file in `<rar dir>/extracted/`.
async fn extracted_video(rar: &Path) -> Option<PathBuf> {
    let dir = rar.parent()?.join("extracted");
    let mut entries = tokio::fs::read_dir(&dir).await.ok()?;
    let mut videos = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if crate::torrent::parsing::is_video_path(&path.to_string_lossy()) {
            videos.push(path);
        }
    }
    videos.sort();
    videos.into_iter().next()
}

/// Rename, or copy then delete across filesystems.
async fn move_file(source: &Path, target: &Path) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::rename(source, target).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(e),
        Err(e) => {
            debug!("Rename of {} failed ({}), copying", source.display(), e);
            tokio::fs::copy(source, target).await?;
            tokio::fs::remove_file(source).await
        }
    }
}

/// Deletes empty directories from `dir` upwards, stopping at `root`.
async fn remove_empty_dirs(dir: &Path, root: &Path) {
    let mut current = dir.to_path_buf();
    while current.starts_with(root) && current != root {
        if tokio::fs::remove_dir(&current).await.is_err() {
            break;
        }
        debug!("Removed empty directory {}", current.display());
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }
}

async fn remove_aux(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Deleted {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to delete {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::MediaLibrary;
    use crate::service::testing::TestService;
    use crate::torrent::TorrentBuilder;

    #[test]
    fn test_destination_folders() {
        let mut config = UndertowConfig::default();
        config.paths.completed_shows_path = Some(PathBuf::from("/out"));
        config.paths.completed_movies_path = Some(PathBuf::from("/movies"));
        let hash = InfoHash::new([1; 20]);

        let mut item = MediaItem::episode(hash, 7, "Show X", Some(2020), 1, 2);
        assert_eq!(
            destination_dir(&config, &item),
            Some(PathBuf::from("/out/Show X (2020)/Season 1"))
        );
        item.season = 0;
        item.year = None;
        assert_eq!(
            destination_dir(&config, &item),
            Some(PathBuf::from("/out/Show X/Specials"))
        );
        assert_eq!(
            destination_dir(&config, &MediaItem::movie(hash, 3)),
            Some(PathBuf::from("/movies"))
        );
        assert_eq!(show_folder("A/B: C", None), "A_B_ C");

        item.media_type = None;
        assert_eq!(destination_dir(&config, &item), None);
    }

    #[tokio::test]
    async fn test_unwritable_root_fails_once() {
        let test = TestService::new(|config| {
            config.storage.completed_move = true;
        });
        let movies = test.dir.path().join("movies");
        let mut config = (*test.service.config()).clone();
        config.paths.completed_movies_path = Some(movies.clone());
        test.service.context().config.replace(config);
        test.resources.deny_writes(&movies);

        let built = TorrentBuilder::new("film.mkv")
            .piece_length(16 * 1024)
            .file(&["film.mkv"], 2 * 16 * 1024)
            .build()
            .unwrap();
        let path = test.dir.path().join("film.torrent");
        std::fs::write(&path, &built.bytes).unwrap();
        let torrent = test
            .service
            .add_torrent(path.to_str().unwrap(), false)
            .await
            .unwrap();
        test.library
            .upsert(MediaItem::movie(torrent.info_hash(), 11))
            .unwrap();
        torrent.mark_seeded();

        test.service.move_completed().await;
        assert!(test.service.torrent(&torrent.info_hash()).is_some());
        assert!(test.session.removed().is_empty());
        test.service.move_completed().await;
        assert!(test.session.removed().is_empty());
    }
}
