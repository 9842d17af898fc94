//! Free-space guard for disk downloads.

use tracing::{debug, warn};

use super::Service;
use crate::backend::StorageMode;
use crate::host::Notice;
use crate::torrent::Torrent;

/// Outcome of the one-time space check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceCheck {
    /// Memory storage, already checked, or nothing to measure.
    Skipped,
    Enough { needed: u64, available: u64 },
    Short { needed: u64, available: u64 },
}

impl Service {
    /// Runs the space check the first time `torrent` starts downloading
    /// with metadata known. A shortfall notifies the host and pauses the
    /// torrent.
    pub fn guard_space(&self, torrent: &Torrent) -> SpaceCheck {
        if torrent.storage() == StorageMode::Memory {
            return SpaceCheck::Skipped;
        }
        let Some(layout) = torrent.layout() else {
            return SpaceCheck::Skipped;
        };
        let done = match torrent.status() {
            Ok(status) => status.total_done,
            Err(e) => {
                debug!("Space check for {} skipped: {}", torrent.info_hash(), e);
                return SpaceCheck::Skipped;
            }
        };
        let needed = layout.total_length.saturating_sub(done);
        let download_path = self.ctx.config().paths.download_path.clone();
        let available = match self.ctx.resources.available_space(&download_path) {
            Ok(available) => available,
            Err(e) => {
                warn!(
                    "Cannot measure free space under {}: {}",
                    download_path.display(),
                    e
                );
                return SpaceCheck::Skipped;
            }
        };
        if !torrent.claim_space_check() {
            return SpaceCheck::Skipped;
        }

        if available >= needed {
            debug!(
                "Space for {}: {} needed, {} available",
                torrent.info_hash(),
                needed,
                available
            );
            return SpaceCheck::Enough { needed, available };
        }
        warn!(
            "Not enough space for {}: {} needed, {} available",
            torrent.info_hash(),
            needed,
            available
        );
        self.ctx.host.notify(Notice::error(format!(
            "Not enough space in {} to download {}",
            download_path.display(),
            torrent.name()
        )));
        torrent.mark_not_enough_space(needed, available);
        SpaceCheck::Short { needed, available }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testing::TestService;
    use crate::torrent::TorrentBuilder;

    async fn add(test: &TestService, name: &str) -> std::sync::Arc<Torrent> {
        let built = TorrentBuilder::new(name)
            .piece_length(16 * 1024)
            .file(&[name], 10 * 16 * 1024)
            .build()
            .unwrap();
        let path = test.dir.path().join(format!("{name}.torrent"));
        std::fs::write(&path, &built.bytes).unwrap();
        test.service
            .add_torrent(path.to_str().unwrap(), false)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_enough_space_runs_once() {
        let test = TestService::new(|_| {});
        let torrent = add(&test, "fits.mkv").await;
        assert!(matches!(
            test.service.guard_space(&torrent),
            SpaceCheck::Enough { needed, .. } if needed == 10 * 16 * 1024
        ));
        assert_eq!(test.service.guard_space(&torrent), SpaceCheck::Skipped);
    }

    #[tokio::test]
    async fn test_magnet_is_checked_once_metadata_arrives() {
        let test = TestService::new(|_| {});
        test.resources.set_space(100);
        let built = TorrentBuilder::new("late.mkv")
            .piece_length(16 * 1024)
            .file(&["late.mkv"], 10 * 16 * 1024)
            .build()
            .unwrap();
        let descriptor = crate::torrent::TorrentDescriptor::from_metainfo(
            "x",
            &built.bytes,
            crate::torrent::TrackerPolicy::AsIs,
        )
        .unwrap();
        let torrent = test
            .service
            .add_torrent(&descriptor.magnet_uri(), false)
            .await
            .unwrap();
        assert_eq!(test.service.guard_space(&torrent), SpaceCheck::Skipped);

        assert!(!torrent.not_enough_space());

        // The download starting with metadata runs the real check.
        let sim = test.session.torrent(&torrent.info_hash()).unwrap();
        sim.deliver_metadata(built.bytes.clone()).unwrap();
        test.service.process_alerts();
        assert!(torrent.has_metadata());
        assert!(torrent.not_enough_space());
        assert!(torrent.is_paused());
        assert_eq!(test.service.guard_space(&torrent), SpaceCheck::Skipped);
    }

    #[tokio::test]
    async fn test_memory_storage_is_not_checked() {
        let test = TestService::new(|config| {
            config.storage.download_storage = StorageMode::Memory;
        });
        test.resources.set_space(0);
        let torrent = add(&test, "stream.mkv").await;
        assert_eq!(test.service.guard_space(&torrent), SpaceCheck::Skipped);
        assert!(!torrent.not_enough_space());
    }

    #[tokio::test]
    async fn test_short_space_broadcasts_to_buffer_waiters() {
        let test = TestService::new(|_| {});
        test.resources.set_space(100);
        let torrent = add(&test, "huge.mkv").await;
        let mut events = torrent.subscribe_buffer();
        assert_eq!(
            test.service.guard_space(&torrent),
            SpaceCheck::Short {
                needed: 10 * 16 * 1024,
                available: 100
            }
        );
        assert!(matches!(
            events.try_recv(),
            Some(crate::torrent::BufferEvent::NotEnoughSpace { .. })
        ));
    }
}
