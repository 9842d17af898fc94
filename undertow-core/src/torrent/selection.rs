//! Picking the playback file inside a torrent.

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::File;

/// Episode the torrent was added for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EpisodeHint {
    pub show_id: u64,
    pub season: u32,
    pub episode: u32,
}

impl EpisodeHint {
    pub fn new(show_id: u64, season: u32, episode: u32) -> Self {
        Self {
            show_id,
            season,
            episode,
        }
    }

    pub fn regex(&self) -> Option<Regex> {
        episode_regex(self.season, self.episode)
    }
}

/// Matches `S01E02`, `s1.e2`, `1x02` style markers for one episode.
///
/// Returns `None` only if the pattern fails to compile.
pub fn episode_regex(season: u32, episode: u32) -> Option<Regex> {
    Regex::new(&format!(
        r"(?i)(^|\W|_)(S0*{season}\W?E0*{episode}|{season}x0*{episode})(\W|_)"
    ))
    .ok()
}

/// Index into `files` of the file to play.
///
/// With a hint and `smart_match`, the largest video whose path carries the
/// episode marker wins. Otherwise the largest video, then the largest `.rar`.
pub fn choose_file(
    files: &[Arc<File>],
    hint: Option<&EpisodeHint>,
    smart_match: bool,
) -> Option<usize> {
    if smart_match
        && let Some(hint) = hint.filter(|hint| hint.show_id != 0)
        && let Some(pattern) = hint.regex()
    {
        let matching = files.iter().enumerate().filter(|(_, file)| {
            file.is_video() && pattern.is_match(&file.path.to_string_lossy())
        });
        if let Some(index) = largest(matching) {
            debug!(
                "Episode S{:02}E{:02} matched {}",
                hint.season,
                hint.episode,
                files[index].path.display()
            );
            return Some(index);
        }
    }

    let videos = files.iter().enumerate().filter(|(_, file)| file.is_video());
    if let Some(index) = largest(videos) {
        return Some(index);
    }
    largest(files.iter().enumerate().filter(|(_, file)| file.is_rar()))
}

/// Biggest file; the lower index wins a tie.
fn largest<'a>(candidates: impl Iterator<Item = (usize, &'a Arc<File>)>) -> Option<usize> {
    candidates
        .max_by(|(ia, a), (ib, b)| a.size.cmp(&b.size).then(ib.cmp(ia)))
        .map(|(index, _)| index)
}
