//! Player attachment and torrent lookups for the host.

use std::sync::Arc;

use tracing::{debug, info};

use super::Service;
use crate::host::Player;
use crate::library::MediaType;
use crate::torrent::{InfoHash, Torrent, TorrentError, episode_regex};

impl Service {
    /// Binds `player` to its torrent, replacing any previous player.
    pub fn attach_player(&self, player: Arc<dyn Player>) {
        let info_hash = player.info_hash();
        debug!("Player attached to {}", info_hash);
        self.players.lock().insert(info_hash, player);
    }

    pub fn detach_player(&self, info_hash: &InfoHash) -> Option<Arc<dyn Player>> {
        let player = self.players.lock().remove(info_hash);
        if player.is_some() {
            debug!("Player detached from {}", info_hash);
        }
        player
    }

    /// The first attached player that is playing.
    pub fn active_player(&self) -> Option<Arc<dyn Player>> {
        self.players
            .lock()
            .values()
            .find(|player| player.is_playing())
            .cloned()
    }

    /// A torrent for this exact episode, or else one of the same show that
    /// holds a file named like the episode.
    pub fn has_torrent_by_episode(
        &self,
        show_id: u64,
        season: u32,
        episode: u32,
    ) -> Option<Arc<Torrent>> {
        let torrents = self.queue.all();
        let same_show: Vec<_> = torrents
            .iter()
            .filter(|torrent| self.show_of(torrent) == Some(show_id))
            .collect();

        let exact = same_show.iter().find(|torrent| {
            if let Some(hint) = torrent.episode() {
                return hint.season == season && hint.episode == episode;
            }
            self.library
                .item(&torrent.info_hash())
                .is_some_and(|item| item.season == season && item.episode == episode)
        });
        if let Some(torrent) = exact {
            return Some(Arc::clone(torrent));
        }

        let regex = episode_regex(season, episode)?;
        same_show
            .into_iter()
            .find(|torrent| {
                torrent
                    .files()
                    .iter()
                    .any(|file| regex.is_match(&file.path.to_string_lossy()))
            })
            .cloned()
    }

    fn show_of(&self, torrent: &Torrent) -> Option<u64> {
        if let Some(hint) = torrent.episode() {
            return Some(hint.show_id);
        }
        self.library
            .item(&torrent.info_hash())
            .filter(|item| item.media_type == Some(MediaType::Episode))
            .map(|item| item.show_id)
    }

    /// A torrent for `movie_id`.
    pub fn has_torrent_by_movie(&self, movie_id: u64) -> Option<Arc<Torrent>> {
        self.queue.all().into_iter().find(|torrent| {
            self.library.item(&torrent.info_hash()).is_some_and(|item| {
                item.media_type == Some(MediaType::Movie) && item.movie_id == movie_id
            })
        })
    }

    /// A torrent added for the search `query`, case-insensitively.
    pub fn has_torrent_by_query(&self, query: &str) -> Option<Arc<Torrent>> {
        let query = query.trim().to_lowercase();
        self.queue.all().into_iter().find(|torrent| {
            self.library
                .item(&torrent.info_hash())
                .and_then(|item| item.query)
                .is_some_and(|stored| stored.trim().to_lowercase() == query)
        })
    }

    /// Flags a torrent as seeded so the next progress tick moves it.
    ///
    /// # Errors
    /// - `TorrentError::TorrentNotFound` - hash not queued
    pub fn mark_to_move(&self, info_hash: &InfoHash) -> Result<(), TorrentError> {
        let torrent = self
            .queue
            .find_by_hash(info_hash)
            .ok_or(TorrentError::TorrentNotFound {
                info_hash: *info_hash,
            })?;
        info!("Marked {} for moving", info_hash);
        torrent.mark_seeded();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::library::{MediaItem, MediaLibrary};
    use crate::service::testing::TestService;
    use crate::torrent::{EpisodeHint, TorrentBuilder};

    struct FakePlayer {
        info_hash: InfoHash,
        playing: AtomicBool,
    }

    impl Player for FakePlayer {
        fn info_hash(&self) -> InfoHash {
            self.info_hash
        }

        fn is_playing(&self) -> bool {
            self.playing.load(Ordering::SeqCst)
        }
    }

    async fn add(test: &TestService, name: &str, files: &[&str]) -> Arc<Torrent> {
        let mut builder = TorrentBuilder::new(name).piece_length(16 * 1024);
        for file in files {
            builder = builder.file(&[name, file], 3 * 16 * 1024);
        }
        let built = builder.build().unwrap();
        let path = test.dir.path().join(format!("{name}.torrent"));
        std::fs::write(&path, &built.bytes).unwrap();
        test.service
            .add_torrent(path.to_str().unwrap(), false)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_players() {
        let test = TestService::new(|_| {});
        let hash = InfoHash::new([9; 20]);
        let player = Arc::new(FakePlayer {
            info_hash: hash,
            playing: AtomicBool::new(false),
        });
        test.service.attach_player(player.clone());
        assert!(test.service.active_player().is_none());
        player.playing.store(true, Ordering::SeqCst);
        assert_eq!(test.service.active_player().unwrap().info_hash(), hash);
        assert!(test.service.detach_player(&hash).is_some());
        assert!(test.service.active_player().is_none());
    }

    #[tokio::test]
    async fn test_episode_lookup_exact_then_regex() {
        let test = TestService::new(|_| {});
        let exact = add(&test, "Show.S01E02", &["Show.S01E02.mkv"]).await;
        exact.set_episode(EpisodeHint::new(42, 1, 2));
        let pack = add(&test, "Show.Season.2", &["Show.S02E01.mkv", "Show.S02E05.mkv"]).await;
        test.library
            .upsert(MediaItem::episode(pack.info_hash(), 42, "Show", Some(2020), 2, 0))
            .unwrap();

        let found = test.service.has_torrent_by_episode(42, 1, 2).unwrap();
        assert_eq!(found.info_hash(), exact.info_hash());
        let found = test.service.has_torrent_by_episode(42, 2, 5).unwrap();
        assert_eq!(found.info_hash(), pack.info_hash());
        assert!(test.service.has_torrent_by_episode(42, 3, 1).is_none());
        assert!(test.service.has_torrent_by_episode(7, 1, 2).is_none());
    }

    #[tokio::test]
    async fn test_movie_and_query_lookup() {
        let test = TestService::new(|_| {});
        let torrent = add(&test, "Film", &["Film.2019.mkv"]).await;
        let mut item = MediaItem::movie(torrent.info_hash(), 603);
        item.query = Some("Film 2019".to_string());
        test.library.upsert(item).unwrap();

        assert!(test.service.has_torrent_by_movie(603).is_some());
        assert!(test.service.has_torrent_by_movie(604).is_none());
        assert!(test.service.has_torrent_by_query(" film 2019 ").is_some());
        assert!(test.service.has_torrent_by_query("other").is_none());

        test.service.mark_to_move(&torrent.info_hash()).unwrap();
        assert!(torrent.is_seeded());
        assert!(test.service.mark_to_move(&InfoHash::new([0; 20])).is_err());
    }
}
