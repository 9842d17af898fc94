//! Host UI and player collaborators.
//!
//! The engine reports progress, raises notices and asks for confirmation
//! through `Host`. Players attach per torrent through `Player`.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::torrent::InfoHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

/// Three-line foreground progress indicator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProgressLines {
    pub percent: u8,
    pub line1: String,
    pub line2: String,
    pub line3: String,
}

pub trait Host: Send + Sync {
    fn notify_progress(&self, progress: &ProgressLines);

    /// Hides the progress indicator.
    fn clear_progress(&self) {}

    fn notify(&self, notice: Notice);

    /// Asks the user a yes/no question. Hosts without a UI answer `default`.
    fn confirm(&self, _question: &str, default: bool) -> bool {
        default
    }

    /// Advisory: subtitles that sit next to the file being played.
    fn offer_subtitles(&self, _info_hash: InfoHash, _opened: &Path, _subtitles: &[PathBuf]) {}
}

/// A media player bound to one torrent.
pub trait Player: Send + Sync {
    fn info_hash(&self) -> InfoHash;

    fn is_playing(&self) -> bool;
}

/// Host without a UI; everything goes to the log.
#[derive(Debug, Default)]
pub struct SilentHost;

impl Host for SilentHost {
    fn notify_progress(&self, progress: &ProgressLines) {
        tracing::debug!(
            "Progress {}%: {} | {} | {}",
            progress.percent,
            progress.line1,
            progress.line2,
            progress.line3
        );
    }

    fn notify(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Info => info!("{}", notice.message),
            NoticeLevel::Warning | NoticeLevel::Error => warn!("{}", notice.message),
        }
    }
}

/// Records everything it is told, for assertions.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Default)]
pub struct RecordingHost {
    pub progress: parking_lot::Mutex<Vec<ProgressLines>>,
    pub notices: parking_lot::Mutex<Vec<Notice>>,
    pub subtitle_offers: parking_lot::Mutex<Vec<(InfoHash, PathBuf, Vec<PathBuf>)>>,
    pub cleared: std::sync::atomic::AtomicUsize,
}

#[cfg(any(test, feature = "test-utils"))]
impl Host for RecordingHost {
    fn notify_progress(&self, progress: &ProgressLines) {
        self.progress.lock().push(progress.clone());
    }

    fn clear_progress(&self) {
        self.cleared
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn notify(&self, notice: Notice) {
        self.notices.lock().push(notice);
    }

    fn offer_subtitles(&self, info_hash: InfoHash, opened: &Path, subtitles: &[PathBuf]) {
        self.subtitle_offers
            .lock()
            .push((info_hash, opened.to_path_buf(), subtitles.to_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_host_defaults() {
        let host = SilentHost;
        assert!(host.confirm("Delete files?", true));
        assert!(!host.confirm("Resume?", false));
        host.notify(Notice::warning("disk almost full"));
        host.notify_progress(&ProgressLines::default());
    }

    #[test]
    fn test_recording_host() {
        let host = RecordingHost::default();
        host.notify(Notice::error("boom"));
        host.offer_subtitles(
            InfoHash::new([1; 20]),
            Path::new("a.mkv"),
            &[PathBuf::from("a.srt")],
        );
        assert_eq!(host.notices.lock()[0].level, NoticeLevel::Error);
        assert_eq!(host.subtitle_offers.lock()[0].2, vec![PathBuf::from("a.srt")]);
    }
}
