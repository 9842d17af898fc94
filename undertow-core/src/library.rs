//! Media database collaborator.
//!
//! Torrents can be attached to a library item carrying what the torrent is
//! (movie or episode, show name, air year). The completed mover and the
//! episode lookups read it; nothing else in the engine depends on it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::torrent::InfoHash;

#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("Library I/O error at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Library file {path} is invalid: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("No library item for torrent {info_hash}")]
    NotFound { info_hash: InfoHash },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Episode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    #[default]
    Active,
    /// Post-processing finished; the record may be purged.
    Remove,
}

/// What a torrent was added for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub info_hash: InfoHash,
    pub media_type: Option<MediaType>,
    #[serde(default)]
    pub movie_id: u64,
    #[serde(default)]
    pub show_id: u64,
    #[serde(default)]
    pub show_name: String,
    /// First-aired year of the show, or release year of the movie.
    #[serde(default)]
    pub year: Option<u16>,
    #[serde(default)]
    pub season: u32,
    #[serde(default)]
    pub episode: u32,
    /// Free-form search query the torrent was found with.
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub status: ItemStatus,
}

impl MediaItem {
    pub fn movie(info_hash: InfoHash, movie_id: u64) -> Self {
        Self {
            info_hash,
            media_type: Some(MediaType::Movie),
            movie_id,
            show_id: 0,
            show_name: String::new(),
            year: None,
            season: 0,
            episode: 0,
            query: None,
            status: ItemStatus::Active,
        }
    }

    pub fn episode(
        info_hash: InfoHash,
        show_id: u64,
        show_name: impl Into<String>,
        year: Option<u16>,
        season: u32,
        episode: u32,
    ) -> Self {
        Self {
            info_hash,
            media_type: Some(MediaType::Episode),
            movie_id: 0,
            show_id,
            show_name: show_name.into(),
            year,
            season,
            episode,
            query: None,
            status: ItemStatus::Active,
        }
    }
}

/// Lookup and status updates for library items.
pub trait MediaLibrary: Send + Sync {
    fn item(&self, info_hash: &InfoHash) -> Option<MediaItem>;

    fn items(&self) -> Vec<MediaItem>;

    /// # Errors
    /// - `LibraryError::Io` - library could not be persisted
    fn upsert(&self, item: MediaItem) -> Result<(), LibraryError>;

    /// # Errors
    /// - `LibraryError::NotFound` - no item for `info_hash`
    /// - `LibraryError::Io` - library could not be persisted
    fn set_status(&self, info_hash: &InfoHash, status: ItemStatus) -> Result<(), LibraryError>;
}

/// Library stored as one JSON document, rewritten on every change.
pub struct JsonMediaLibrary {
    path: PathBuf,
    items: RwLock<HashMap<InfoHash, MediaItem>>,
}

impl JsonMediaLibrary {
    /// Loads `path`; a missing file yields an empty library.
    ///
    /// # Errors
    /// - `LibraryError::Io` - file exists but cannot be read
    /// - `LibraryError::Parse` - file is not a JSON item list
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LibraryError> {
        let path = path.into();
        let items = match std::fs::read_to_string(&path) {
            Ok(text) => {
                let list: Vec<MediaItem> =
                    serde_json::from_str(&text).map_err(|e| LibraryError::Parse {
                        path: path.clone(),
                        reason: e.to_string(),
                    })?;
                list.into_iter().map(|item| (item.info_hash, item)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => return Err(LibraryError::Io { path, source }),
        };
        debug!("Loaded {} library items from {}", items.len(), path.display());
        Ok(Self {
            path,
            items: RwLock::new(items),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, items: &HashMap<InfoHash, MediaItem>) -> Result<(), LibraryError> {
        let mut list: Vec<&MediaItem> = items.values().collect();
        list.sort_by_key(|item| item.info_hash);
        let text = serde_json::to_string_pretty(&list).map_err(|e| LibraryError::Parse {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LibraryError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&self.path, text).map_err(|source| LibraryError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl MediaLibrary for JsonMediaLibrary {
    fn item(&self, info_hash: &InfoHash) -> Option<MediaItem> {
        self.items.read().get(info_hash).cloned()
    }

    fn items(&self) -> Vec<MediaItem> {
        self.items.read().values().cloned().collect()
    }

    fn upsert(&self, item: MediaItem) -> Result<(), LibraryError> {
        let mut items = self.items.write();
        items.insert(item.info_hash, item);
        self.persist(&items)
    }

    fn set_status(&self, info_hash: &InfoHash, status: ItemStatus) -> Result<(), LibraryError> {
        let mut items = self.items.write();
        let Some(item) = items.get_mut(info_hash) else {
            warn!("Status update for unknown library item {}", info_hash);
            return Err(LibraryError::NotFound {
                info_hash: *info_hash,
            });
        };
        item.status = status;
        self.persist(&items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let library = JsonMediaLibrary::open(dir.path().join("library.json")).unwrap();
        assert!(library.items().is_empty());
    }

    #[test]
    fn test_upsert_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("library.json");
        let hash = InfoHash::new([3; 20]);

        let library = JsonMediaLibrary::open(&path).unwrap();
        library
            .upsert(MediaItem::episode(hash, 42, "Show X", Some(2020), 1, 2))
            .unwrap();
        library.set_status(&hash, ItemStatus::Remove).unwrap();

        let reloaded = JsonMediaLibrary::open(&path).unwrap();
        let item = reloaded.item(&hash).unwrap();
        assert_eq!(item.show_name, "Show X");
        assert_eq!(item.status, ItemStatus::Remove);
        assert_eq!(item.media_type, Some(MediaType::Episode));
    }

    #[test]
    fn test_unknown_status_update_and_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.json");
        let library = JsonMediaLibrary::open(&path).unwrap();
        assert!(matches!(
            library.set_status(&InfoHash::new([1; 20]), ItemStatus::Remove),
            Err(LibraryError::NotFound { .. })
        ));

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            JsonMediaLibrary::open(&path),
            Err(LibraryError::Parse { .. })
        ));
    }
}
