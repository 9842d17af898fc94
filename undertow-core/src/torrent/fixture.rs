//! A torrent wired to the simulated library, for unit tests.

use std::sync::Arc;

use bytes::Bytes;
use tempfile::TempDir;

use super::parsing::{TorrentDescriptor, TrackerPolicy};
use super::{Torrent, TorrentBuilder};
use crate::backend::simulated::{SimulatedSession, SimulatedTorrent};
use crate::backend::{AddTorrentParams, BtSession, StorageMode, TorrentSource};
use crate::config::UndertowConfig;
use crate::context::EngineContext;
use crate::host::RecordingHost;
use crate::resources::FixedResources;

pub(crate) const PIECE_LENGTH: u32 = 16 * 1024;

pub(crate) struct FixtureOptions {
    pub storage: StorageMode,
    pub memory_size: u64,
    /// `(path, size)` pairs; one entry named like the torrent makes a single-file torrent.
    pub files: Vec<(Vec<&'static str>, u64)>,
    pub magnet: bool,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            storage: StorageMode::File,
            memory_size: 64 * u64::from(PIECE_LENGTH),
            files: vec![(vec!["movie.mkv"], 64 * u64::from(PIECE_LENGTH))],
            magnet: false,
        }
    }
}

pub(crate) struct Fixture {
    pub dir: TempDir,
    pub session: Arc<SimulatedSession>,
    pub sim: Arc<SimulatedTorrent>,
    pub ctx: Arc<EngineContext>,
    pub host: Arc<RecordingHost>,
    pub resources: Arc<FixedResources>,
    pub torrent: Arc<Torrent>,
    pub metainfo: Bytes,
}

impl Fixture {
    pub async fn new(options: FixtureOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = UndertowConfig::for_profile(dir.path());
        config.storage.download_storage = options.storage;
        config.storage.memory_size = options.memory_size;
        config.storage.buffer_size = 16 * u64::from(PIECE_LENGTH);
        config.storage.end_buffer_size = 4 * u64::from(PIECE_LENGTH);

        let name = if options.files.len() == 1 {
            options.files[0].0.join("/")
        } else {
            "Pack".to_string()
        };
        let mut builder = TorrentBuilder::new(name).piece_length(PIECE_LENGTH);
        for (path, size) in &options.files {
            builder = builder.file(path, *size);
        }
        let built = builder.build().unwrap();
        let mut descriptor =
            TorrentDescriptor::from_metainfo("fixture.torrent", &built.bytes, TrackerPolicy::AsIs)
                .unwrap();
        if options.magnet {
            descriptor.metadata = None;
            descriptor.metainfo = None;
        }

        let session = Arc::new(SimulatedSession::new());
        let host = Arc::new(RecordingHost::default());
        let resources = Arc::new(FixedResources::new(u64::MAX / 4, u64::MAX / 4));
        let source = match &descriptor.metainfo {
            Some(bytes) => TorrentSource::Metainfo(bytes.clone()),
            None => TorrentSource::Magnet(descriptor.magnet_uri()),
        };
        let handle = session
            .add_torrent(AddTorrentParams {
                info_hash: descriptor.info_hash,
                name: descriptor.name.clone(),
                save_path: config.paths.download_path.clone(),
                source,
                trackers: descriptor.trackers.clone(),
                resume_data: None,
                storage: options.storage,
                memory_size: options.memory_size,
                paused: false,
                auto_managed: true,
            })
            .await
            .unwrap();
        let sim = session.torrent(&descriptor.info_hash).unwrap();

        let ctx = EngineContext::new(session.clone(), config, resources.clone(), host.clone());
        let torrent = Torrent::new(
            &descriptor,
            handle,
            ctx.clone(),
            options.storage,
            options.memory_size,
        );
        if !options.magnet {
            torrent.on_metadata_received().unwrap();
        }

        Self {
            dir,
            session,
            sim,
            ctx,
            host,
            resources,
            torrent,
            metainfo: built.bytes,
        }
    }

    /// Completes every piece and refreshes the torrent's bitfield.
    pub fn complete_all(&self) {
        self.sim.complete_all();
        self.torrent.pieces.force_refresh(self.sim.as_ref()).unwrap();
    }
}
