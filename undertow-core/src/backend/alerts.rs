//! Typed alerts emitted by the library.

use std::net::IpAddr;
use std::ops::BitOr;

use bytes::Bytes;

use super::{PortProtocol, TorrentState};
use crate::torrent::InfoHash;

/// Bit set of alert categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AlertCategory(u32);

impl AlertCategory {
    pub const ERROR: Self = Self(1);
    pub const PEER: Self = Self(1 << 1);
    pub const PORT_MAPPING: Self = Self(1 << 2);
    pub const STORAGE: Self = Self(1 << 3);
    pub const TRACKER: Self = Self(1 << 4);
    pub const STATUS: Self = Self(1 << 6);
    pub const PROGRESS: Self = Self(1 << 7);
    pub const DHT: Self = Self(1 << 10);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AlertCategory {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Alert payload. Variants the engine does not act on arrive as `Other`.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertKind {
    StateChanged {
        state: TorrentState,
        prev_state: TorrentState,
    },
    MetadataReceived,
    SaveResumeData {
        data: Bytes,
    },
    SaveResumeDataFailed {
        reason: String,
    },
    ExternalIp {
        address: IpAddr,
    },
    TorrentRemoved,
    TorrentFinished,
    PieceFinished {
        piece: u32,
    },
    FileError {
        path: String,
        reason: String,
    },
    PortMapping {
        port: u16,
        protocol: PortProtocol,
    },
    Other {
        type_code: i32,
    },
}

impl AlertKind {
    /// Library type identifier.
    pub fn type_code(&self) -> i32 {
        match self {
            AlertKind::StateChanged { .. } => 10,
            AlertKind::MetadataReceived => 45,
            AlertKind::SaveResumeData { .. } => 37,
            AlertKind::SaveResumeDataFailed { .. } => 38,
            AlertKind::ExternalIp { .. } => 48,
            AlertKind::TorrentRemoved => 4,
            AlertKind::TorrentFinished => 26,
            AlertKind::PieceFinished { .. } => 27,
            AlertKind::FileError { .. } => 43,
            AlertKind::PortMapping { .. } => 50,
            AlertKind::Other { type_code } => *type_code,
        }
    }

    fn what(&self) -> &'static str {
        match self {
            AlertKind::StateChanged { .. } => "state_changed",
            AlertKind::MetadataReceived => "metadata_received",
            AlertKind::SaveResumeData { .. } => "save_resume_data",
            AlertKind::SaveResumeDataFailed { .. } => "save_resume_data_failed",
            AlertKind::ExternalIp { .. } => "external_ip",
            AlertKind::TorrentRemoved => "torrent_removed",
            AlertKind::TorrentFinished => "torrent_finished",
            AlertKind::PieceFinished { .. } => "piece_finished",
            AlertKind::FileError { .. } => "file_error",
            AlertKind::PortMapping { .. } => "portmap",
            AlertKind::Other { .. } => "other",
        }
    }

    fn category(&self) -> AlertCategory {
        match self {
            AlertKind::StateChanged { .. }
            | AlertKind::MetadataReceived
            | AlertKind::TorrentRemoved
            | AlertKind::TorrentFinished
            | AlertKind::ExternalIp { .. } => AlertCategory::STATUS,
            AlertKind::SaveResumeData { .. } => AlertCategory::STORAGE,
            AlertKind::SaveResumeDataFailed { .. } | AlertKind::FileError { .. } => {
                AlertCategory::STORAGE | AlertCategory::ERROR
            }
            AlertKind::PieceFinished { .. } => AlertCategory::PROGRESS,
            AlertKind::PortMapping { .. } => AlertCategory::PORT_MAPPING,
            AlertKind::Other { .. } => AlertCategory::default(),
        }
    }
}

/// Neutral alert record published to every alert listener.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub kind: AlertKind,
    pub category: AlertCategory,
    pub what: String,
    pub message: String,
    pub info_hash: Option<InfoHash>,
    pub name: String,
}

impl Alert {
    /// Builds a record with the category and name derived from `kind`.
    pub fn new(kind: AlertKind, info_hash: Option<InfoHash>, name: impl Into<String>) -> Self {
        let name = name.into();
        let what = kind.what().to_string();
        let message = match &kind {
            AlertKind::StateChanged { state, prev_state } => {
                format!("{name}: state changed {prev_state:?} -> {state:?}")
            }
            AlertKind::SaveResumeDataFailed { reason } | AlertKind::FileError { reason, .. } => {
                format!("{name}: {reason}")
            }
            AlertKind::ExternalIp { address } => format!("external address {address}"),
            AlertKind::PieceFinished { piece } => format!("{name}: piece {piece} finished"),
            _ => format!("{name}: {what}"),
        };
        Self {
            category: kind.category(),
            kind,
            what,
            message,
            info_hash,
            name,
        }
    }

    pub fn type_code(&self) -> i32 {
        self.kind.type_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_derives_category_and_message() {
        let alert = Alert::new(
            AlertKind::StateChanged {
                state: TorrentState::Downloading,
                prev_state: TorrentState::DownloadingMetadata,
            },
            Some(InfoHash::new([1; 20])),
            "movie",
        );
        assert_eq!(alert.what, "state_changed");
        assert!(alert.category.contains(AlertCategory::STATUS));
        assert!(alert.message.contains("DownloadingMetadata -> Downloading"));
        assert_eq!(alert.type_code(), 10);
    }

    #[test]
    fn test_error_alerts_carry_error_bit() {
        let alert = Alert::new(
            AlertKind::FileError {
                path: "a".to_string(),
                reason: "disk full".to_string(),
            },
            None,
            "movie",
        );
        assert!(alert.category.contains(AlertCategory::ERROR));
        assert!(alert.category.contains(AlertCategory::STORAGE));
        assert!(!alert.category.contains(AlertCategory::DHT));
    }
}
