//! Centralized configuration for the engine.
//!
//! Values are layered: built-in defaults, then `<profile>/settings.json`,
//! then `UNDERTOW_*` environment variables. The running service keeps the
//! result as an immutable snapshot and swaps it wholesale on reload.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::StorageMode;
use crate::torrent::{InfoHash, TrackerPolicy};

pub const MIB: u64 = 1024 * 1024;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Central configuration for all engine components.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct UndertowConfig {
    pub paths: PathsConfig,
    pub storage: StorageConfig,
    pub network: NetworkConfig,
    pub limits: LimitsConfig,
    pub playback: PlaybackConfig,
}

/// Filesystem layout under the profile directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    pub profile_path: PathBuf,
    pub download_path: PathBuf,
    pub torrents_path: PathBuf,
    pub temp_path: PathBuf,
    pub logs_path: PathBuf,
    pub completed_movies_path: Option<PathBuf>,
    pub completed_shows_path: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self::for_profile(Path::new("undertow"))
    }
}

impl PathsConfig {
    /// Standard layout rooted at `profile`.
    pub fn for_profile(profile: &Path) -> Self {
        Self {
            profile_path: profile.to_path_buf(),
            download_path: profile.join("downloads"),
            torrents_path: profile.join("torrents"),
            temp_path: profile.join("temp"),
            logs_path: profile.join("logs"),
            completed_movies_path: None,
            completed_shows_path: None,
        }
    }
}

/// Piece storage and persistence behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub download_storage: StorageMode,
    /// Bounded piece cache size for memory storage, in bytes.
    pub memory_size: u64,
    /// Grow the memory cache when the host has spare memory.
    pub auto_memory_size: bool,
    /// Head pre-buffer, in bytes.
    pub buffer_size: u64,
    /// Tail pre-buffer, in bytes.
    pub end_buffer_size: u64,
    /// Interval between resume-data saves, in seconds.
    pub session_save: u64,
    pub autoload_torrents: bool,
    pub autoload_torrents_paused: bool,
    /// Relocate finished downloads into the completed roots.
    pub completed_move: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            download_storage: StorageMode::File,
            memory_size: 100 * MIB,
            auto_memory_size: false,
            buffer_size: 20 * MIB,
            end_buffer_size: 5 * MIB + MIB / 2,
            session_save: 30,
            autoload_torrents: false,
            autoload_torrents_paused: false,
            completed_move: false,
        }
    }
}

/// Outgoing traffic encryption preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionPolicy {
    Off,
    #[default]
    Prefer,
    Force,
}

/// Proxy flavour passed through to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProxyType {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "socks4")]
    Socks4,
    #[serde(rename = "socks5")]
    Socks5,
    #[serde(rename = "socks5+pw")]
    Socks5Password,
    #[serde(rename = "http")]
    Http,
    #[serde(rename = "http+pw")]
    HttpPassword,
    #[serde(rename = "i2p")]
    I2p,
}

/// Tuning preset applied on top of the baseline settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionProfile {
    #[default]
    Default,
    MinMemory,
    HighPerformance,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ProxyConfig {
    pub proxy_type: ProxyType,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Session networking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub connections_limit: u32,
    pub listen_port_min: u16,
    pub listen_port_max: u16,
    /// Interfaces to bind; empty means `0.0.0.0`.
    pub listen_interfaces: Vec<String>,
    pub outgoing_interfaces: Vec<String>,
    pub encryption_policy: EncryptionPolicy,
    pub proxy: ProxyConfig,
    pub tracker_policy: TrackerPolicy,
    pub session_profile: SessionProfile,
    pub disable_dht: bool,
    pub disable_lsd: bool,
    pub disable_upnp: bool,
    pub disable_natpmp: bool,
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connections_limit: 200,
            listen_port_min: 6891,
            listen_port_max: 6899,
            listen_interfaces: Vec::new(),
            outgoing_interfaces: Vec::new(),
            encryption_policy: EncryptionPolicy::Prefer,
            proxy: ProxyConfig::default(),
            tracker_policy: TrackerPolicy::AddDefaults,
            session_profile: SessionProfile::Default,
            disable_dht: false,
            disable_lsd: false,
            disable_upnp: false,
            disable_natpmp: false,
            user_agent: format!("undertow/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Bandwidth and seeding policy. Zero disables a limit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct LimitsConfig {
    /// Bytes per second.
    pub download_rate_limit: u64,
    /// Bytes per second.
    pub upload_rate_limit: u64,
    /// Apply the rate limits only once buffering has finished.
    pub limit_after_buffering: bool,
    /// Seconds of seeding before the torrent is paused.
    pub seed_time_limit: u64,
    /// Seeding time as a percentage of download time.
    pub seed_time_ratio_limit: u32,
    /// Uploaded bytes as a percentage of downloaded bytes.
    pub share_ratio_limit: u32,
}

/// Playback-facing switches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Start buffering the next episode while the current one plays.
    pub smart_episode_start: bool,
    /// Match episode files by season/episode instead of size.
    pub smart_episode_match: bool,
    /// Pause and resume the torrent after buffer setup to kick the picker.
    pub pause_resume_hack: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            smart_episode_start: true,
            smart_episode_match: true,
            pause_resume_hack: false,
        }
    }
}

impl FromStr for StorageMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(StorageMode::File),
            "memory" => Ok(StorageMode::Memory),
            other => Err(ConfigError::InvalidValue {
                key: "download_storage".to_string(),
                reason: format!("unknown storage mode {other:?}"),
            }),
        }
    }
}

impl FromStr for EncryptionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(EncryptionPolicy::Off),
            "prefer" => Ok(EncryptionPolicy::Prefer),
            "force" => Ok(EncryptionPolicy::Force),
            other => Err(ConfigError::InvalidValue {
                key: "encryption_policy".to_string(),
                reason: format!("unknown policy {other:?}"),
            }),
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageMode::File => f.write_str("file"),
            StorageMode::Memory => f.write_str("memory"),
        }
    }
}

impl UndertowConfig {
    /// Defaults with every path rooted at `profile`.
    pub fn for_profile(profile: &Path) -> Self {
        Self {
            paths: PathsConfig::for_profile(profile),
            ..Default::default()
        }
    }

    /// Defaults for `profile`, then `settings.json`, then environment.
    ///
    /// # Errors
    /// - `ConfigError::Io` - settings file exists but cannot be read
    /// - `ConfigError::Parse` - settings file is not valid JSON
    /// - `ConfigError::InvalidValue` - an environment override or final value is invalid
    pub fn load(profile: &Path) -> Result<Self, ConfigError> {
        let settings_path = profile.join("settings.json");
        let mut config = if settings_path.exists() {
            let raw = std::fs::read_to_string(&settings_path).map_err(|source| ConfigError::Io {
                path: settings_path.clone(),
                source,
            })?;
            let overlay: serde_json::Value =
                serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
                    path: settings_path.clone(),
                    reason: e.to_string(),
                })?;
            let mut merged = serde_json::to_value(Self::for_profile(profile)).map_err(|e| {
                ConfigError::Parse {
                    path: settings_path.clone(),
                    reason: e.to_string(),
                }
            })?;
            merge_json(&mut merged, overlay);
            serde_json::from_value(merged).map_err(|e| ConfigError::Parse {
                path: settings_path.clone(),
                reason: e.to_string(),
            })?
        } else {
            Self::for_profile(profile)
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Default configuration with environment variable overrides.
    ///
    /// # Errors
    /// - `ConfigError::InvalidValue` - an override does not parse
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Applies `UNDERTOW_*` overrides in place. Unset variables are skipped.
    ///
    /// # Errors
    /// - `ConfigError::InvalidValue` - a set variable does not parse
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(path) = std::env::var("UNDERTOW_DOWNLOAD_PATH") {
            self.paths.download_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("UNDERTOW_TORRENTS_PATH") {
            self.paths.torrents_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("UNDERTOW_COMPLETED_MOVIES_PATH") {
            self.paths.completed_movies_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("UNDERTOW_COMPLETED_SHOWS_PATH") {
            self.paths.completed_shows_path = Some(PathBuf::from(path));
        }
        if let Ok(mode) = std::env::var("UNDERTOW_DOWNLOAD_STORAGE") {
            self.storage.download_storage = mode.parse()?;
        }
        if let Some(size) = env_number("UNDERTOW_MEMORY_SIZE")? {
            self.storage.memory_size = size;
        }
        if let Some(size) = env_number("UNDERTOW_BUFFER_SIZE")? {
            self.storage.buffer_size = size;
        }
        if let Some(limit) = env_number("UNDERTOW_CONNECTIONS_LIMIT")? {
            self.network.connections_limit = limit;
        }
        if let Some(port) = env_number("UNDERTOW_LISTEN_PORT_MIN")? {
            self.network.listen_port_min = port;
        }
        if let Some(port) = env_number("UNDERTOW_LISTEN_PORT_MAX")? {
            self.network.listen_port_max = port;
        }
        if let Ok(interfaces) = std::env::var("UNDERTOW_LISTEN_INTERFACES") {
            self.network.listen_interfaces = split_list(&interfaces);
        }
        if let Ok(interfaces) = std::env::var("UNDERTOW_OUTGOING_INTERFACES") {
            self.network.outgoing_interfaces = split_list(&interfaces);
        }
        if let Ok(policy) = std::env::var("UNDERTOW_ENCRYPTION_POLICY") {
            self.network.encryption_policy = policy.parse()?;
        }
        if let Some(limit) = env_number("UNDERTOW_DOWNLOAD_RATE_LIMIT")? {
            self.limits.download_rate_limit = limit;
        }
        if let Some(limit) = env_number("UNDERTOW_UPLOAD_RATE_LIMIT")? {
            self.limits.upload_rate_limit = limit;
        }
        if let Some(seconds) = env_number("UNDERTOW_SESSION_SAVE")? {
            self.storage.session_save = seconds;
        }
        Ok(())
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    /// - `ConfigError::InvalidValue` - port range inverted, zero buffer or zero save interval
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.listen_port_min > self.network.listen_port_max {
            return Err(ConfigError::InvalidValue {
                key: "listen_port_min".to_string(),
                reason: format!(
                    "{} is above listen_port_max {}",
                    self.network.listen_port_min, self.network.listen_port_max
                ),
            });
        }
        if self.storage.buffer_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "buffer_size".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.storage.session_save == 0 {
            return Err(ConfigError::InvalidValue {
                key: "session_save".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn session_save_interval(&self) -> Duration {
        Duration::from_secs(self.storage.session_save.max(1))
    }

    /// Canonical `.torrent` copy kept for autoload.
    pub fn torrent_file_path(&self, info_hash: &InfoHash) -> PathBuf {
        self.paths.torrents_path.join(format!("{info_hash}.torrent"))
    }

    pub fn fastresume_path(&self, info_hash: &InfoHash) -> PathBuf {
        self.paths
            .torrents_path
            .join(format!("{info_hash}.fastresume"))
    }

    /// Partial-piece file managed by the library.
    pub fn parts_path(&self, info_hash: &InfoHash) -> PathBuf {
        self.paths.download_path.join(format!(".{info_hash}.parts"))
    }

    pub fn overrides_path(&self) -> PathBuf {
        self.paths.profile_path.join("libtorrent.config")
    }

    pub fn library_path(&self) -> PathBuf {
        self.paths.profile_path.join("library.json")
    }
}

fn env_number<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

/// Recursively overlays `overlay` onto `base`; objects merge, everything else replaces.
fn merge_json(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
