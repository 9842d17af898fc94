//! Fast-resume persistence and torrent autoload.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::{Service, ServiceError};
use crate::backend::StorageMode;
use crate::torrent::TorrentDescriptor;

impl Service {
    pub(super) async fn run_save_resume(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.ctx.config().session_save_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; nothing needs saving yet.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.save_resume_pass();
                }
                _ = self.ctx.shutdown.cancelled() => break,
            }
        }
        debug!("Resume saver stopped");
    }

    /// Requests resume data for every disk torrent that has metadata and
    /// reports unsaved changes. The alert pump writes the file.
    ///
    /// Returns the number of requests made.
    pub fn save_resume_pass(&self) -> usize {
        let mut requested = 0;
        for torrent in self.queue.all() {
            if torrent.storage() != StorageMode::File || !torrent.has_metadata() {
                continue;
            }
            let needs_save = match torrent.status() {
                Ok(status) => status.need_save_resume,
                Err(e) => {
                    debug!("Status of {} unavailable: {}", torrent.info_hash(), e);
                    continue;
                }
            };
            if !needs_save {
                continue;
            }
            match torrent.handle().save_resume_data() {
                Ok(()) => requested += 1,
                Err(e) => warn!("Resume save for {} failed: {}", torrent.info_hash(), e),
            }
        }
        if requested > 0 {
            debug!("Requested resume data for {} torrent(s)", requested);
        }
        requested
    }

    /// Re-adds every `<torrents>/*.torrent`, with its `.fastresume` when
    /// present. Unreadable files are logged and skipped.
    ///
    /// # Errors
    /// - `ServiceError::Io` - the torrents directory cannot be listed
    pub async fn autoload(&self) -> Result<usize, ServiceError> {
        let config = self.ctx.config();
        let paused = config.storage.autoload_torrents_paused;
        let mut entries = tokio::fs::read_dir(&config.paths.torrents_path).await?;
        let mut loaded = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "torrent") {
                continue;
            }
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            let uri = path.display().to_string();
            let descriptor = match TorrentDescriptor::from_metainfo(
                &uri,
                &bytes,
                config.network.tracker_policy,
            ) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            if self.queue.find_by_hash(&descriptor.info_hash).is_some() {
                continue;
            }
            let resume = read_fastresume(&config.fastresume_path(&descriptor.info_hash)).await;
            match self.add_descriptor(&descriptor, paused, resume).await {
                Ok(torrent) => {
                    info!("Autoloaded {}", torrent.name());
                    loaded += 1;
                }
                Err(e) => warn!("Autoload of {} failed: {}", path.display(), e),
            }
        }
        Ok(loaded)
    }
}

/// Resume data at `path`, if any.
pub(super) async fn read_fastresume(path: &Path) -> Option<Bytes> {
    match tokio::fs::read(path).await {
        Ok(data) if !data.is_empty() => Some(Bytes::from(data)),
        Ok(_) => None,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("Ignoring unreadable resume data {}: {}", path.display(), e);
            None
        }
    }
}

/// Writes through a sibling temp file so a crash never leaves half a file.
pub(super) fn write_fastresume(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let temp = path.with_extension("fastresume.tmp");
    std::fs::write(&temp, data)?;
    std::fs::rename(&temp, path)?;
    debug!("Saved {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BtTorrent;
    use crate::service::testing::TestService;
    use crate::torrent::TorrentBuilder;

    fn store_torrent(test: &TestService, name: &str) -> crate::torrent::InfoHash {
        let built = TorrentBuilder::new(name)
            .piece_length(16 * 1024)
            .file(&[name], 6 * 16 * 1024)
            .build()
            .unwrap();
        let descriptor =
            TorrentDescriptor::from_metainfo(name, &built.bytes, crate::torrent::TrackerPolicy::AsIs)
                .unwrap();
        let config = test.service.config();
        std::fs::write(config.torrent_file_path(&descriptor.info_hash), &built.bytes).unwrap();
        descriptor.info_hash
    }

    #[tokio::test]
    async fn test_save_pass_only_requests_dirty_torrents() {
        let test = TestService::new(|_| {});
        let hash = store_torrent(&test, "a.mkv");
        test.service.autoload().await.unwrap();
        let sim = test.session.torrent(&hash).unwrap();

        assert_eq!(test.service.save_resume_pass(), 0);
        sim.complete_piece(1);
        assert_eq!(test.service.save_resume_pass(), 1);
        test.service.process_alerts();
        let saved = test.service.config().fastresume_path(&hash);
        assert!(saved.exists());
        assert_eq!(test.service.save_resume_pass(), 0);
        assert_eq!(sim.resume_requests(), 1);
    }

    #[tokio::test]
    async fn test_autoload_uses_resume_data_and_pause_flag() {
        let test = TestService::new(|config| {
            config.storage.autoload_torrents_paused = true;
        });
        let first = store_torrent(&test, "first.mkv");
        let second = store_torrent(&test, "second.mkv");
        let config = test.service.config();
        write_fastresume(&config.fastresume_path(&first), b"d6:piecesi0ee").unwrap();
        std::fs::write(config.paths.torrents_path.join("junk.torrent"), b"not bencode").unwrap();

        assert_eq!(test.service.autoload().await.unwrap(), 2);
        let added = test.session.added();
        let first_params = added.iter().find(|p| p.info_hash == first).unwrap();
        assert!(first_params.resume_data.is_some());
        assert!(first_params.paused);
        let second_params = added.iter().find(|p| p.info_hash == second).unwrap();
        assert!(second_params.resume_data.is_none());
        assert!(test.service.torrent(&second).unwrap().is_paused());

        // Already queued torrents are not added twice.
        assert_eq!(test.service.autoload().await.unwrap(), 0);
        assert!(test.session.torrent(&first).unwrap().status().unwrap().paused);
    }
}
