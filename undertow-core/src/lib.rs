//! Undertow Core - streaming BitTorrent playback engine
//!
//! Downloads a torrent in the order a media player reads it. A player opens
//! a file through [`TorrentFs`] and reads it while pieces are still arriving;
//! the engine keeps the pieces ahead of every reader at the highest priority
//! and buffers the start and the tail of the file before playback begins.
//! The BitTorrent protocol itself lives behind the [`backend`] seam.

pub mod backend;
pub mod config;
pub mod context;
pub mod events;
pub mod host;
pub mod library;
pub mod resources;
pub mod service;
pub mod streaming;
pub mod torrent;
pub mod tracing_setup;

pub use backend::{BackendError, BtSession, BtTorrent, StorageMode};
pub use config::{ConfigError, UndertowConfig};
pub use context::EngineContext;
pub use host::{Host, Notice, Player, ProgressLines};
pub use library::{JsonMediaLibrary, MediaItem, MediaLibrary};
pub use service::{Service, ServiceError, ServiceParts};
pub use streaming::{FsEntry, ReaderError, TorrentFs};
pub use torrent::{InfoHash, Torrent, TorrentError};

/// Errors that can bubble up from any Undertow subsystem.
#[derive(Debug, thiserror::Error)]
pub enum UndertowError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Reader error: {0}")]
    Reader(#[from] ReaderError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

impl UndertowError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            UndertowError::Torrent(e) | UndertowError::Service(ServiceError::Torrent(e)) => {
                match e {
                    TorrentError::InvalidTorrentFile { reason } => {
                        format!("Invalid torrent file: {reason}")
                    }
                    TorrentError::MalformedMagnet { reason } => {
                        format!("Invalid magnet link: {reason}")
                    }
                    TorrentError::TorrentNotFound { info_hash } => {
                        format!("Torrent {info_hash} not found")
                    }
                    TorrentError::NotEnoughSpace { needed, available } => format!(
                        "Not enough disk space: {} needed, {} available",
                        format_bytes(*needed),
                        format_bytes(*available)
                    ),
                    TorrentError::MemoryExhausted { .. } => {
                        "Not enough memory to stream this torrent".to_string()
                    }
                    TorrentError::Timeout { operation } => format!("Timed out during {operation}"),
                    _ => "Download error occurred".to_string(),
                }
            }
            UndertowError::Service(ServiceError::Shutdown) => "Engine is shutting down".to_string(),
            UndertowError::Service(_) => "Engine error occurred".to_string(),
            UndertowError::Reader(ReaderError::NotFound { path }) => {
                format!("File not found: {}", path.display())
            }
            UndertowError::Reader(_) => "Playback read error occurred".to_string(),
            UndertowError::Config(_) | UndertowError::Configuration { .. } => {
                "Configuration error occurred".to_string()
            }
            UndertowError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            UndertowError::Configuration { .. }
                | UndertowError::Config(_)
                | UndertowError::Torrent(TorrentError::InvalidTorrentFile { .. })
                | UndertowError::Torrent(TorrentError::MalformedMagnet { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, UndertowError>;

const UNITS: [&str; 4] = ["B", "kB", "MB", "GB"];

/// Human readable size with a 1024 base: `512 B`, `1.5 MB`.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// Transfer rate for progress lines: `512 B/s`, `2.0 MB/s`.
pub fn format_bytes_per_second(bytes: u64) -> String {
    format!("{}/s", format_bytes(bytes))
}
