//! Magnet URI parsing and regeneration.

use std::fmt;
use std::str::FromStr;

use data_encoding::BASE32;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::torrent::{InfoHash, TorrentError};

/// Public trackers appended under `TrackerPolicy::AddDefaults`.
pub const DEFAULT_TRACKERS: &[&str] = &[
    "udp://tracker.opentrackr.org:1337/announce",
    "udp://open.stealth.si:80/announce",
    "udp://exodus.desync.com:6969/announce",
    "udp://tracker.torrent.eu.org:451/announce",
    "udp://tracker.tiny-vps.com:6969/announce",
    "udp://p4p.arenabg.com:1337/announce",
    "udp://tracker.moeking.me:6969/announce",
    "udp://tracker.cyberia.is:6969/announce",
    "http://tracker.openbittorrent.com:80/announce",
];

/// How tracker lists from inputs are rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrackerPolicy {
    AsIs,
    Clear,
    #[default]
    AddDefaults,
}

impl TrackerPolicy {
    /// Applies the policy and removes duplicates, keeping first occurrences.
    pub fn apply(self, trackers: Vec<String>) -> Vec<String> {
        let mut result = match self {
            TrackerPolicy::Clear => return Vec::new(),
            TrackerPolicy::AsIs => trackers,
            TrackerPolicy::AddDefaults => {
                let mut all = trackers;
                all.extend(DEFAULT_TRACKERS.iter().map(|t| (*t).to_string()));
                all
            }
        };
        dedup_preserving_order(&mut result);
        result
    }
}

pub(crate) fn dedup_preserving_order(items: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    items.retain(|item| !item.is_empty() && seen.insert(item.clone()));
}

/// Parsed magnet link.
#[derive(Debug, Clone, PartialEq)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

impl MagnetLink {
    /// Parses a `magnet:` URI. `dn` and `tr` values are percent-decoded.
    ///
    /// # Errors
    /// - `TorrentError::MalformedMagnet` - wrong scheme, missing `urn:btih`
    ///   topic, or a hash that is neither 40 hex nor 32 base32 characters
    pub fn parse(magnet_url: &str) -> Result<Self, TorrentError> {
        let url = Url::parse(magnet_url.trim()).map_err(|e| TorrentError::MalformedMagnet {
            reason: format!("Invalid magnet link: {e}"),
        })?;
        if url.scheme() != "magnet" {
            return Err(TorrentError::MalformedMagnet {
                reason: format!("Unexpected scheme {:?}", url.scheme()),
            });
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" if info_hash.is_none() => {
                    if let Some(hash) = value.strip_prefix("urn:btih:") {
                        info_hash = Some(Self::parse_hash(hash)?);
                    }
                }
                "dn" if display_name.is_none() && !value.is_empty() => {
                    display_name = Some(value.into_owned());
                }
                "tr" => trackers.push(value.into_owned()),
                _ => {}
            }
        }

        let info_hash = info_hash.ok_or_else(|| TorrentError::MalformedMagnet {
            reason: format!("Missing or invalid info hash in magnet link: {magnet_url}"),
        })?;
        dedup_preserving_order(&mut trackers);

        Ok(Self {
            info_hash,
            display_name,
            trackers,
        })
    }

    /// Decodes a hex(40) or base32(32) info hash.
    fn parse_hash(hash: &str) -> Result<InfoHash, TorrentError> {
        match hash.len() {
            40 => InfoHash::from_hex(&hash.to_ascii_lowercase()),
            32 => {
                let bytes = BASE32
                    .decode(hash.to_ascii_uppercase().as_bytes())
                    .map_err(|e| TorrentError::MalformedMagnet {
                        reason: format!("Invalid base32 hash {hash}: {e}"),
                    })?;
                InfoHash::from_slice(&bytes)
            }
            other => Err(TorrentError::MalformedMagnet {
                reason: format!("Invalid hash length: {other} (expected 40 or 32)"),
            }),
        }
    }

    /// Returns a copy with the tracker policy applied.
    pub fn with_policy(mut self, policy: TrackerPolicy) -> Self {
        self.trackers = policy.apply(self.trackers);
        self
    }

    /// Regenerates a magnet URI with a hex topic.
    pub fn to_uri(&self) -> String {
        let mut uri = format!("magnet:?xt=urn:btih:{}", self.info_hash);
        if let Some(name) = &self.display_name {
            uri.push_str("&dn=");
            uri.push_str(&urlencoding::encode(name));
        }
        for tracker in &self.trackers {
            uri.push_str("&tr=");
            uri.push_str(&urlencoding::encode(tracker));
        }
        uri
    }
}

impl FromStr for MagnetLink {
    type Err = TorrentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for MagnetLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn test_magnet_link_parsing() {
        let uri = format!(
            "magnet:?xt=urn:btih:{HEX}&dn=Test%20Torrent&tr=http%3A%2F%2Ftracker.example.com%2Fannounce"
        );
        let magnet = MagnetLink::parse(&uri).unwrap();

        assert_eq!(magnet.info_hash.to_string(), HEX);
        assert_eq!(magnet.display_name.as_deref(), Some("Test Torrent"));
        assert_eq!(magnet.trackers, vec!["http://tracker.example.com/announce"]);
    }

    #[test]
    fn test_base32_hash() {
        let hash = InfoHash::from_hex(HEX).unwrap();
        let encoded = BASE32.encode(hash.as_bytes());
        assert_eq!(encoded.len(), 32);

        let magnet = MagnetLink::parse(&format!("magnet:?xt=urn:btih:{encoded}")).unwrap();
        assert_eq!(magnet.info_hash, hash);

        let lower = encoded.to_ascii_lowercase();
        let magnet = MagnetLink::parse(&format!("magnet:?xt=urn:btih:{lower}")).unwrap();
        assert_eq!(magnet.info_hash, hash);
    }

    #[test]
    fn test_rejects_wrong_scheme_and_bad_hashes() {
        for bad in [
            "http://example.com/?xt=urn:btih:0123456789abcdef0123456789abcdef01234567",
            "magnet:?dn=Test",
            "magnet:?xt=urn:btih:tooshort",
            "magnet:?xt=urn:btih:zz23456789abcdef0123456789abcdef01234567",
            "magnet:?xt=urn:btih:11111111111111111111111111111111",
            "not a uri",
        ] {
            let result = MagnetLink::parse(bad);
            assert!(
                matches!(result, Err(TorrentError::MalformedMagnet { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_regenerate_keeps_hash_and_trackers() {
        let uri = format!(
            "magnet:?xt=urn:btih:{HEX}&dn=A+B%26C&tr=udp%3A%2F%2Fone%3A1&tr=udp%3A%2F%2Ftwo%3A2&tr=udp%3A%2F%2Fone%3A1"
        );
        let magnet = MagnetLink::parse(&uri).unwrap().with_policy(TrackerPolicy::AsIs);
        let again = MagnetLink::parse(&magnet.to_uri()).unwrap();

        assert_eq!(again.info_hash, magnet.info_hash);
        assert_eq!(again.display_name.as_deref(), Some("A B&C"));
        assert_eq!(again.trackers, vec!["udp://one:1", "udp://two:2"]);
    }

    #[test]
    fn test_tracker_policies() {
        let trackers = vec!["udp://mine:1".to_string()];

        assert!(TrackerPolicy::Clear.apply(trackers.clone()).is_empty());
        assert_eq!(TrackerPolicy::AsIs.apply(trackers.clone()), trackers);

        let with_defaults = TrackerPolicy::AddDefaults.apply(trackers);
        assert_eq!(with_defaults[0], "udp://mine:1");
        assert_eq!(with_defaults.len(), 1 + DEFAULT_TRACKERS.len());

        let repeated = TrackerPolicy::AddDefaults.apply(vec![DEFAULT_TRACKERS[0].to_string()]);
        assert_eq!(repeated.len(), DEFAULT_TRACKERS.len());
    }
}
