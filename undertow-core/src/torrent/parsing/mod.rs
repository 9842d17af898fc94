//! Torrent inputs: `.torrent` decoding, magnet links and descriptor resolution.

pub mod bencode;
pub mod descriptor;
pub mod magnet;
pub mod media;
pub mod types;

pub use bencode::{Bencode, BencodeParser};
pub use descriptor::{DescriptorResolver, TorrentDescriptor};
pub use magnet::{DEFAULT_TRACKERS, MagnetLink, TrackerPolicy};
pub use media::{MediaHints, clean_title, is_video_path};
pub use types::{TorrentFile, TorrentMetadata};
