//! Release-name heuristics. Informational only.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static BRACKETS: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"[\[\(].*?[\]\)]").ok());
static YEAR: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\b(19|20)\d{2}\b").ok());
static RELEASE_TAG: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(2160p|1080p|720p|480p|4k|uhd|bluray|blu-ray|brrip|bdrip|web-?dl|webrip|hdtv|dvdrip|dvdscr|hdcam|cam|telesync|x264|x265|h\.?264|h\.?265|hevc|xvid|remux|s\d{1,2}e\d{1,3})\b",
    )
    .ok()
});

/// Container extensions treated as playable video.
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "m4v", "mov", "wmv", "flv", "webm", "mpg", "mpeg", "ts", "m2ts", "vob",
    "divx", "ogm", "3gp",
];

pub fn is_video_path(path: &str) -> bool {
    path.rsplit_once('.')
        .map(|(_, ext)| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, PartialOrd, Ord)]
pub enum Resolution {
    #[default]
    Unknown,
    Sd480,
    Hd720,
    Hd1080,
    Uhd2160,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Codec {
    #[default]
    Unknown,
    Xvid,
    H264,
    H265,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RipType {
    #[default]
    Unknown,
    Cam,
    Telesync,
    Screener,
    Dvd,
    Hdtv,
    Web,
    BluRay,
    Remux,
}

/// Classes derived from a torrent name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MediaHints {
    pub resolution: Resolution,
    pub codec: Codec,
    pub rip: RipType,
    pub year: Option<u16>,
}

impl MediaHints {
    pub fn from_name(name: &str) -> Self {
        let lower = name.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));

        let resolution = if has(&["2160p", "4k", "uhd"]) {
            Resolution::Uhd2160
        } else if has(&["1080p", "1080i"]) {
            Resolution::Hd1080
        } else if has(&["720p"]) {
            Resolution::Hd720
        } else if has(&["480p", "dvdrip", "xvid"]) {
            Resolution::Sd480
        } else {
            Resolution::Unknown
        };

        let codec = if has(&["x265", "h265", "h.265", "hevc"]) {
            Codec::H265
        } else if has(&["x264", "h264", "h.264", "avc"]) {
            Codec::H264
        } else if has(&["xvid", "divx"]) {
            Codec::Xvid
        } else {
            Codec::Unknown
        };

        let rip = if has(&["remux"]) {
            RipType::Remux
        } else if has(&["bluray", "blu-ray", "brrip", "bdrip"]) {
            RipType::BluRay
        } else if has(&["web-dl", "webdl", "webrip", "web."]) {
            RipType::Web
        } else if has(&["hdtv", "pdtv"]) {
            RipType::Hdtv
        } else if has(&["dvdscr", "screener"]) {
            RipType::Screener
        } else if has(&["dvdrip", "dvd"]) {
            RipType::Dvd
        } else if has(&["telesync", ".ts.", "hdts"]) {
            RipType::Telesync
        } else if has(&["hdcam", "camrip", ".cam."]) {
            RipType::Cam
        } else {
            RipType::Unknown
        };

        Self {
            resolution,
            codec,
            rip,
            year: extract_year(name),
        }
    }
}

/// First plausible release year in `name`.
pub fn extract_year(name: &str) -> Option<u16> {
    let year_regex = YEAR.as_ref()?;
    year_regex
        .find(name)
        .and_then(|found| found.as_str().parse::<u16>().ok())
        .filter(|year| (1900..=2099).contains(year))
}

/// Human title: release tags, bracketed groups and the year are cut off,
/// separators become spaces.
pub fn clean_title(name: &str) -> String {
    let mut title = name.to_string();
    if is_video_path(&title)
        && let Some((stem, _)) = title.rsplit_once('.')
    {
        title = stem.to_string();
    }

    if let Some(regex) = BRACKETS.as_ref() {
        title = regex.replace_all(&title, " ").into_owned();
    }
    let mut cut = title.len();
    if let Some(regex) = RELEASE_TAG.as_ref()
        && let Some(found) = regex.find(&title)
    {
        cut = cut.min(found.start());
    }
    if let Some(regex) = YEAR.as_ref()
        && let Some(found) = regex.find_iter(&title).find(|found| found.start() > 0)
    {
        cut = cut.min(found.start());
    }
    title.truncate(cut);

    let cleaned = title
        .replace(['.', '_'], " ")
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ");
    let cleaned = cleaned.trim_matches(|c: char| c == '-' || c.is_whitespace());
    if cleaned.is_empty() {
        name.to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hints_from_release_name() {
        let hints = MediaHints::from_name("Some.Movie.2019.1080p.BluRay.x264-GROUP");
        assert_eq!(hints.resolution, Resolution::Hd1080);
        assert_eq!(hints.codec, Codec::H264);
        assert_eq!(hints.rip, RipType::BluRay);
        assert_eq!(hints.year, Some(2019));

        let hints = MediaHints::from_name("Show.S02E05.720p.HDTV.HEVC");
        assert_eq!(hints.resolution, Resolution::Hd720);
        assert_eq!(hints.codec, Codec::H265);
        assert_eq!(hints.rip, RipType::Hdtv);
    }

    #[test]
    fn test_unknown_name_has_default_hints() {
        assert_eq!(MediaHints::from_name("holiday video"), MediaHints::default());
    }

    #[test]
    fn test_clean_title() {
        assert_eq!(
            clean_title("Some.Movie.2019.1080p.BluRay.x264-GROUP.mkv"),
            "Some Movie"
        );
        assert_eq!(clean_title("[Group] Show_Name S01E02 [720p]"), "Show Name");
        assert_eq!(clean_title("2012.2009.720p"), "2012");
        assert_eq!(clean_title("plain"), "plain");
        assert!(is_video_path("Show/Episode.MKV"));
        assert!(!is_video_path("Show/Episode.srt"));
    }
}
