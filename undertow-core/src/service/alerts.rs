//! Alert pump: drains the library's alerts into torrents and listeners.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::Service;
use super::resume::write_fastresume;
use crate::backend::{Alert, AlertKind, TorrentState};

/// How long one library wait lasts before the shutdown token is re-checked.
pub const ALERT_WAIT: Duration = Duration::from_secs(1);

impl Service {
    pub(super) async fn run_alert_pump(self: Arc<Self>) {
        debug!("Alert pump started");
        loop {
            tokio::select! {
                ready = self.ctx.session.wait_for_alert(ALERT_WAIT) => {
                    if ready {
                        self.process_alerts();
                    }
                }
                _ = self.ctx.shutdown.cancelled() => break,
            }
        }
        debug!("Alert pump stopped");
    }

    /// Handles and publishes every pending alert. Returns how many there were.
    pub fn process_alerts(&self) -> usize {
        let alerts = self.ctx.session.pop_alerts();
        for alert in &alerts {
            self.handle_alert(alert);
            self.alerts.broadcast(alert.clone());
        }
        alerts.len()
    }

    fn handle_alert(&self, alert: &Alert) {
        trace!("Alert {}: {}", alert.what, alert.message);
        let Some(info_hash) = alert.info_hash else {
            if let AlertKind::ExternalIp { address } = &alert.kind {
                debug!("External address is {}", address);
            }
            return;
        };
        let Some(torrent) = self.queue.find_by_hash(&info_hash) else {
            return;
        };
        if torrent.closer().is_set() {
            return;
        }

        match &alert.kind {
            AlertKind::StateChanged { state, prev_state } => {
                debug!(
                    "Torrent {} state {:?} -> {:?}",
                    info_hash, prev_state, state
                );
                torrent.on_state_changed(*state);
                if *state == TorrentState::Downloading {
                    self.guard_space(&torrent);
                }
            }
            AlertKind::MetadataReceived => {
                if let Err(e) = torrent.on_metadata_received() {
                    warn!("Metadata for {} unusable: {}", info_hash, e);
                }
            }
            AlertKind::SaveResumeData { data } => {
                if let Err(e) = write_fastresume(&torrent.fastresume_path(), data) {
                    warn!("Failed to write resume data for {}: {}", info_hash, e);
                }
            }
            AlertKind::SaveResumeDataFailed { reason } => {
                debug!("Resume data for {} not saved: {}", info_hash, reason);
            }
            AlertKind::FileError { path, reason } => {
                warn!("File error in {} at {}: {}", info_hash, path, reason);
                if torrent.is_buffering() && !torrent.is_paused() {
                    torrent.fail_buffering(format!("{path}: {reason}"));
                    if let Err(e) = torrent.pause() {
                        warn!("Failed to pause {}: {}", info_hash, e);
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::backend::BtTorrent;
    use crate::service::testing::TestService;
    use crate::torrent::TorrentBuilder;

    #[tokio::test]
    async fn test_magnet_metadata_and_resume_alerts() {
        let test = TestService::new(|_| {});
        let built = TorrentBuilder::new("show.mkv")
            .piece_length(16 * 1024)
            .file(&["show.mkv"], 8 * 16 * 1024)
            .build()
            .unwrap();
        let descriptor = crate::torrent::TorrentDescriptor::from_metainfo(
            "x",
            &built.bytes,
            crate::torrent::TrackerPolicy::AsIs,
        )
        .unwrap();
        let magnet = descriptor.magnet_uri();
        let mut alerts = test.service.subscribe_alerts();

        let torrent = test.service.add_torrent(&magnet, false).await.unwrap();
        assert!(!torrent.has_metadata());

        let sim = test.session.torrent(&torrent.info_hash()).unwrap();
        sim.deliver_metadata(built.bytes.clone()).unwrap();
        assert_eq!(test.service.process_alerts(), 2);
        assert!(torrent.has_metadata());
        assert!(torrent.torrent_file_path().exists());
        assert!(alerts.try_recv().is_some());

        sim.complete_piece(0);
        sim.save_resume_data().unwrap();
        test.service.process_alerts();
        assert!(torrent.fastresume_path().exists());
    }

    #[tokio::test]
    async fn test_space_guard_pauses_short_torrent() {
        let test = TestService::new(|_| {});
        test.resources.set_space(1024);
        let built = TorrentBuilder::new("big.mkv")
            .piece_length(16 * 1024)
            .file(&["big.mkv"], 64 * 16 * 1024)
            .build()
            .unwrap();
        let path = test.dir.path().join("big.torrent");
        std::fs::write(&path, &built.bytes).unwrap();
        let torrent = test
            .service
            .add_torrent(path.to_str().unwrap(), false)
            .await
            .unwrap();
        let sim = test.session.torrent(&torrent.info_hash()).unwrap();

        sim.set_state(TorrentState::CheckingFiles);
        sim.set_state(TorrentState::Downloading);
        test.service.process_alerts();
        assert!(torrent.not_enough_space());
        assert!(torrent.is_paused());
        assert_eq!(test.host.notices.lock().len(), 1);
        assert!(sim.pause_count() >= 1);

        // The check runs once per torrent.
        sim.set_state(TorrentState::CheckingFiles);
        sim.set_state(TorrentState::Downloading);
        test.service.process_alerts();
        assert_eq!(test.host.notices.lock().len(), 1);
        assert_eq!(test.host.cleared.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_file_error_fails_buffering() {
        let test = TestService::new(|config| {
            config.storage.buffer_size = 4 * 16 * 1024;
            config.storage.end_buffer_size = 16 * 1024;
        });
        let built = TorrentBuilder::new("clip.mkv")
            .piece_length(16 * 1024)
            .file(&["clip.mkv"], 32 * 16 * 1024)
            .build()
            .unwrap();
        let path = test.dir.path().join("clip.torrent");
        std::fs::write(&path, &built.bytes).unwrap();
        let torrent = test
            .service
            .add_torrent(path.to_str().unwrap(), false)
            .await
            .unwrap();
        let mut events = torrent.subscribe_buffer();
        torrent.buffer(None).await.unwrap();

        test.session.push_alert(Alert::new(
            AlertKind::FileError {
                path: "clip.mkv".to_string(),
                reason: "read-only file system".to_string(),
            },
            Some(torrent.info_hash()),
            "clip.mkv",
        ));
        test.service.process_alerts();

        let mut failed = None;
        while let Some(event) = events.try_recv() {
            if let crate::torrent::BufferEvent::Failed { reason } = event {
                failed = Some(reason);
            }
        }
        assert_eq!(failed.as_deref(), Some("clip.mkv: read-only file system"));
        assert!(torrent.is_paused());
        let sim = test.session.torrent(&torrent.info_hash()).unwrap();
        assert!(sim.status().unwrap().paused);
    }
}
