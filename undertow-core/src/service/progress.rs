//! Progress ticker: aggregate stats, the host's progress lines and seed
//! policies.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::Service;
use crate::backend::{StorageMode, TorrentState, TorrentStatus};
use crate::config::LimitsConfig;
use crate::format_bytes_per_second;
use crate::host::ProgressLines;

pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Totals over every queued torrent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServiceStats {
    /// Bytes per second.
    pub download_rate: u64,
    /// Bytes per second.
    pub upload_rate: u64,
    /// Percent of wanted bytes downloaded, over torrents with metadata.
    pub progress: f64,
    pub torrents: usize,
    /// Torrents still downloading and not paused.
    pub downloading: usize,
    pub seeding: usize,
}

/// Which seed limit `status` has reached, if any.
///
/// Only meaningful for complete torrents; every limit of zero is disabled.
pub fn seed_limit_reached(limits: &LimitsConfig, status: &TorrentStatus) -> Option<&'static str> {
    let seeding = status.seeding_time.as_secs();
    if limits.seed_time_limit > 0 && seeding >= limits.seed_time_limit {
        return Some("seed time");
    }
    let downloading = status.active_time.as_secs().saturating_sub(seeding);
    if limits.seed_time_ratio_limit > 0
        && downloading > 0
        && seeding * 100 / downloading >= u64::from(limits.seed_time_ratio_limit)
    {
        return Some("seed time ratio");
    }
    if limits.share_ratio_limit > 0
        && status.all_time_download > 0
        && status.all_time_upload * 100 / status.all_time_download
            >= u64::from(limits.share_ratio_limit)
    {
        return Some("share ratio");
    }
    None
}

impl Service {
    pub(super) async fn run_progress_ticker(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.progress_tick().await,
                _ = self.ctx.shutdown.cancelled() => break,
            }
        }
        debug!("Progress ticker stopped");
    }

    /// One progress pass: stats, host progress, seed policies, then the
    /// completed mover when enabled.
    pub async fn progress_tick(&self) {
        let stats = self.collect_stats();
        self.report_progress(&stats);
        *self.stats.write() = stats;
        self.enforce_seed_limits();
        if self.ctx.config().storage.completed_move {
            self.move_completed().await;
        }
    }

    fn collect_stats(&self) -> ServiceStats {
        let mut stats = ServiceStats::default();
        let mut wanted = 0u64;
        let mut wanted_done = 0u64;
        for torrent in self.queue.all() {
            stats.torrents += 1;
            let Ok(status) = torrent.status() else {
                continue;
            };
            stats.download_rate += status.download_rate;
            stats.upload_rate += status.upload_rate;
            if status.has_metadata {
                wanted += status.total_wanted;
                wanted_done += status.total_wanted_done.min(status.total_wanted);
            }
            if status.state.is_complete() {
                stats.seeding += 1;
            } else if !status.paused {
                stats.downloading += 1;
            }
        }
        if wanted > 0 {
            stats.progress = wanted_done as f64 * 100.0 / wanted as f64;
        }
        stats
    }

    /// Shows progress while something downloads and nothing plays.
    fn report_progress(&self, stats: &ServiceStats) {
        let playing = self.active_player().is_some();
        if stats.downloading == 0 || playing {
            if self.progress_shown.swap(false, Ordering::SeqCst) {
                self.ctx.host.clear_progress();
            }
            return;
        }
        let lines = ProgressLines {
            percent: stats.progress.clamp(0.0, 100.0) as u8,
            line1: format!(
                "{} downloading, {} seeding",
                stats.downloading, stats.seeding
            ),
            line2: format!(
                "D: {} U: {}",
                format_bytes_per_second(stats.download_rate),
                format_bytes_per_second(stats.upload_rate)
            ),
            line3: format!("{:.1}%", stats.progress),
        };
        self.ctx.host.notify_progress(&lines);
        self.progress_shown.store(true, Ordering::SeqCst);
    }

    /// Pauses complete disk torrents past a seed limit and marks them
    /// seeded. A library `Finished` state counts as seeded on its own.
    fn enforce_seed_limits(&self) {
        let limits = self.ctx.config().limits.clone();
        for torrent in self.queue.all() {
            if torrent.storage() != StorageMode::File || torrent.is_seeded() {
                continue;
            }
            let Ok(status) = torrent.status() else {
                continue;
            };
            if status.state == TorrentState::Finished {
                torrent.mark_seeded();
                continue;
            }
            if !status.state.is_complete() {
                continue;
            }
            if let Some(limit) = seed_limit_reached(&limits, &status) {
                info!("Torrent {} reached its {} limit", torrent.info_hash(), limit);
                if let Err(e) = torrent.pause() {
                    warn!("Failed to pause {}: {}", torrent.info_hash(), e);
                }
                torrent.mark_seeded();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::service::testing::TestService;
    use crate::torrent::TorrentBuilder;

    fn status(seeding: u64, active: u64, down: u64, up: u64) -> TorrentStatus {
        TorrentStatus {
            seeding_time: Duration::from_secs(seeding),
            active_time: Duration::from_secs(active),
            all_time_download: down,
            all_time_upload: up,
            ..TorrentStatus::default()
        }
    }

    #[test]
    fn test_seed_limits() {
        let mut limits = LimitsConfig::default();
        assert_eq!(seed_limit_reached(&limits, &status(10_000, 20_000, 1, 100)), None);

        limits.seed_time_limit = 3600;
        assert_eq!(seed_limit_reached(&limits, &status(3600, 7200, 0, 0)), Some("seed time"));
        assert_eq!(seed_limit_reached(&limits, &status(3599, 7200, 0, 0)), None);

        let limits = LimitsConfig {
            seed_time_ratio_limit: 50,
            ..LimitsConfig::default()
        };
        // 100s downloading, 50s seeding.
        assert_eq!(seed_limit_reached(&limits, &status(50, 150, 0, 0)), Some("seed time ratio"));
        assert_eq!(seed_limit_reached(&limits, &status(49, 149, 0, 0)), None);

        let limits = LimitsConfig {
            share_ratio_limit: 200,
            ..LimitsConfig::default()
        };
        assert_eq!(seed_limit_reached(&limits, &status(0, 0, 100, 200)), Some("share ratio"));
        assert_eq!(seed_limit_reached(&limits, &status(0, 0, 100, 199)), None);
        assert_eq!(seed_limit_reached(&limits, &status(0, 0, 0, 500)), None);
    }

    async fn add(test: &TestService, name: &str) -> Arc<crate::torrent::Torrent> {
        let built = TorrentBuilder::new(name)
            .piece_length(16 * 1024)
            .file(&[name], 4 * 16 * 1024)
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
    async fn test_progress_tick_reports_and_clears() {
        let test = TestService::new(|_| {});
        let torrent = add(&test, "a.mkv").await;
        let sim = test.session.torrent(&torrent.info_hash()).unwrap();
        sim.set_transfer(0, 0, 2 * 1024 * 1024, 512);
        sim.complete_piece(0);

        test.service.progress_tick().await;
        let stats = test.service.stats();
        assert_eq!(stats.torrents, 1);
        assert_eq!(stats.downloading, 1);
        assert!((stats.progress - 25.0).abs() < 1e-9);
        let progress = test.host.progress.lock().clone();
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].percent, 25);
        assert_eq!(progress[0].line2, "D: 2.0 MB/s U: 512 B/s");

        sim.complete_all();
        test.service.progress_tick().await;
        assert_eq!(test.service.stats().seeding, 1);
        assert_eq!(test.host.cleared.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_seed_policy_pauses_disk_torrents() {
        let test = TestService::new(|config| {
            config.limits.share_ratio_limit = 100;
        });
        let torrent = add(&test, "b.mkv").await;
        let sim = test.session.torrent(&torrent.info_hash()).unwrap();
        sim.complete_all();
        sim.set_transfer(1000, 999, 0, 0);
        test.service.progress_tick().await;
        assert!(!torrent.is_seeded());

        sim.set_transfer(1000, 1000, 0, 0);
        test.service.progress_tick().await;
        assert!(torrent.is_seeded());
        assert!(torrent.is_paused());
    }

    #[tokio::test]
    async fn test_seed_time_limit_marks_seeded() {
        let test = TestService::new(|config| {
            config.limits.seed_time_limit = 600;
        });
        let torrent = add(&test, "c.mkv").await;
        let sim = test.session.torrent(&torrent.info_hash()).unwrap();
        sim.complete_all();
        sim.set_times(Duration::from_secs(900), Duration::from_secs(599));
        test.service.progress_tick().await;
        assert!(!torrent.is_seeded());

        sim.set_times(Duration::from_secs(901), Duration::from_secs(600));
        test.service.progress_tick().await;
        assert!(torrent.is_seeded());
    }
}
