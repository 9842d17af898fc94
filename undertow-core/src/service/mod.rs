//! The engine service.
//!
//! Owns the library session and the torrent queue, and runs the long-lived
//! loops: alert pump, resume-data saver, progress ticker and config watcher.
//! Each loop stops when the shared shutdown token is cancelled.

pub mod alerts;
pub mod completed;
pub mod config_watcher;
pub mod listeners;
pub mod ports;
pub mod progress;
pub mod resume;
pub mod space;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use completed::{destination_dir, season_folder, show_folder};
pub use ports::PortMapping;
pub use progress::{ServiceStats, seed_limit_reached};
pub use space::SpaceCheck;

use crate::backend::{
    AddTorrentParams, Alert, BackendError, BtSession, ListenEndpoint, TorrentSource,
};
use crate::config::{ConfigError, UndertowConfig};
use crate::context::EngineContext;
use crate::events::{Broadcaster, Listener};
use crate::host::{Host, Player};
use crate::library::{LibraryError, MediaLibrary};
use crate::resources::HostResources;
use crate::streaming::TorrentFs;
use crate::torrent::parsing::DescriptorResolver;
use crate::torrent::{InfoHash, Queue, Torrent, TorrentDescriptor, TorrentError};

/// Upper bound on the library's own shutdown.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from service operations.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Torrent error")]
    Torrent(#[from] TorrentError),

    #[error("BitTorrent library error")]
    Backend(#[from] BackendError),

    #[error("Invalid configuration")]
    Config(#[from] ConfigError),

    #[error("Media library error")]
    Library(#[from] LibraryError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("Service is shut down")]
    Shutdown,

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

/// Collaborators the service is built from.
pub struct ServiceParts {
    pub session: Arc<dyn BtSession>,
    pub config: UndertowConfig,
    pub resources: Arc<dyn HostResources>,
    pub host: Arc<dyn Host>,
    pub library: Arc<dyn MediaLibrary>,
}

/// Session owner and torrent registry.
pub struct Service {
    ctx: Arc<EngineContext>,
    queue: Arc<Queue<Torrent>>,
    library: Arc<dyn MediaLibrary>,
    resolver: DescriptorResolver,
    alerts: Broadcaster<Alert>,
    endpoints: Vec<ListenEndpoint>,
    port_mappings: Vec<PortMapping>,
    players: Mutex<HashMap<InfoHash, Arc<dyn Player>>>,
    stats: RwLock<ServiceStats>,
    mover: completed::MoveState,
    overrides: config_watcher::OverridesState,
    progress_shown: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Service {
    /// Prepares directories and applies the baseline settings, overrides and
    /// port mappings. No loop is running yet; see [`Service::start`].
    ///
    /// # Errors
    /// - `ServiceError::Config` - configuration failed validation
    /// - `ServiceError::Io` - a working directory could not be created
    /// - `ServiceError::Backend` - the session rejected the settings
    /// - `ServiceError::Torrent` - the HTTP client could not be built
    pub fn new(parts: ServiceParts) -> Result<Arc<Self>, ServiceError> {
        let ServiceParts {
            session,
            config,
            resources,
            host,
            library,
        } = parts;
        config.validate()?;
        for dir in [
            &config.paths.download_path,
            &config.paths.torrents_path,
            &config.paths.temp_path,
        ] {
            std::fs::create_dir_all(dir)?;
        }

        let endpoints = ports::choose_endpoints(&config);
        let resolver = DescriptorResolver::new(
            config.paths.temp_path.clone(),
            config.network.tracker_policy,
        )?;
        let ctx = EngineContext::new(session, config, resources, host);

        let mut service = Self {
            ctx,
            queue: Arc::new(Queue::new()),
            library,
            resolver,
            alerts: Broadcaster::new(),
            endpoints,
            port_mappings: Vec::new(),
            players: Mutex::new(HashMap::new()),
            stats: RwLock::new(ServiceStats::default()),
            mover: completed::MoveState::default(),
            overrides: config_watcher::OverridesState::default(),
            progress_shown: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };
        service.apply_baseline_settings()?;
        service.port_mappings = ports::map_ports(service.ctx.session.as_ref(), &service.endpoints);
        if let Err(e) = service.reload_overrides() {
            warn!("Ignoring libtorrent.config: {}", e);
        }
        info!(
            "Service ready, listening on {}",
            crate::backend::settings::listen_interfaces_value(&service.endpoints)
        );
        Ok(Arc::new(service))
    }

    /// Builds the service, autoloads saved torrents and spawns every loop.
    ///
    /// # Errors
    /// - see [`Service::new`]
    pub async fn start(parts: ServiceParts) -> Result<Arc<Self>, ServiceError> {
        let service = Self::new(parts)?;
        if service.ctx.config().storage.autoload_torrents {
            match service.autoload().await {
                Ok(count) => info!("Autoloaded {} torrent(s)", count),
                Err(e) => warn!("Autoload failed: {}", e),
            }
        }
        service.spawn_loops();
        Ok(service)
    }

    fn spawn_loops(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(self.clone().run_alert_pump()));
        tasks.push(tokio::spawn(self.clone().run_save_resume()));
        tasks.push(tokio::spawn(self.clone().run_progress_ticker()));
        tasks.push(tokio::spawn(self.clone().run_config_watcher()));
    }

    fn apply_baseline_settings(&self) -> Result<(), ServiceError> {
        let config = self.ctx.config();
        let pack = crate::backend::settings::build_settings(&config, &self.endpoints);
        self.ctx.session.apply_settings(&pack)?;
        Ok(())
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn config(&self) -> Arc<UndertowConfig> {
        self.ctx.config()
    }

    pub fn queue(&self) -> &Arc<Queue<Torrent>> {
        &self.queue
    }

    pub fn library(&self) -> &Arc<dyn MediaLibrary> {
        &self.library
    }

    pub fn endpoints(&self) -> &[ListenEndpoint] {
        &self.endpoints
    }

    pub fn port_mappings(&self) -> &[PortMapping] {
        &self.port_mappings
    }

    /// Alerts from now on, in library order.
    pub fn subscribe_alerts(&self) -> Listener<Alert> {
        self.alerts.listen()
    }

    /// File-system facade over the queue.
    pub fn fs(&self) -> TorrentFs {
        TorrentFs::new(self.queue.clone())
    }

    pub fn torrent(&self, info_hash: &InfoHash) -> Option<Arc<Torrent>> {
        self.queue.find_by_hash(info_hash)
    }

    pub fn torrents(&self) -> Vec<Arc<Torrent>> {
        self.queue.all()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), ServiceError> {
        if self.is_closed() {
            Err(ServiceError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Adds a magnet, URL, info hash or local `.torrent`.
    ///
    /// Returns the queued torrent when the info hash is already known.
    ///
    /// # Errors
    /// - `ServiceError::Shutdown` - service is closed
    /// - `ServiceError::Torrent` - the input could not be resolved
    /// - `ServiceError::Backend` - the library refused the torrent
    pub async fn add_torrent(&self, uri: &str, paused: bool) -> Result<Arc<Torrent>, ServiceError> {
        self.ensure_running()?;
        let descriptor = self.resolver.resolve(uri).await?;
        if let Some(existing) = self.queue.find_by_hash(&descriptor.info_hash) {
            debug!("Torrent {} already queued", descriptor.info_hash);
            return Ok(existing);
        }
        self.add_descriptor(&descriptor, paused, None).await
    }

    /// Adds an already resolved descriptor. Disk torrents pick up their
    /// `.fastresume` when `resume_data` is not given.
    ///
    /// # Errors
    /// - `ServiceError::Shutdown` - service is closed
    /// - `ServiceError::Backend` - the library refused the torrent
    pub async fn add_descriptor(
        &self,
        descriptor: &TorrentDescriptor,
        paused: bool,
        resume_data: Option<Bytes>,
    ) -> Result<Arc<Torrent>, ServiceError> {
        self.ensure_running()?;
        let config = self.ctx.config();
        let storage = config.storage.download_storage;
        let memory_size = config.storage.memory_size;
        let resume_data = match resume_data {
            Some(data) => Some(data),
            None if storage == crate::backend::StorageMode::File => {
                resume::read_fastresume(&config.fastresume_path(&descriptor.info_hash)).await
            }
            None => None,
        };
        let source = match &descriptor.metainfo {
            Some(bytes) => TorrentSource::Metainfo(bytes.clone()),
            None => TorrentSource::Magnet(descriptor.magnet_uri()),
        };

        let handle = self
            .ctx
            .session
            .add_torrent(AddTorrentParams {
                info_hash: descriptor.info_hash,
                name: descriptor.name.clone(),
                save_path: config.paths.download_path.clone(),
                source,
                trackers: descriptor.trackers.clone(),
                resume_data,
                storage,
                memory_size,
                paused,
                auto_managed: !paused,
            })
            .await?;
        let has_info = handle.torrent_info().is_some();
        let torrent = Torrent::new(descriptor, handle, self.ctx.clone(), storage, memory_size);
        if !self.queue.add(torrent.clone()) {
            debug!("Torrent {} raced into the queue", descriptor.info_hash);
        }
        if has_info {
            torrent.on_metadata_received()?;
        }
        if paused {
            torrent.pause()?;
        }
        torrent.spawn_watch();
        info!(
            "Added {} ({}, {} storage)",
            torrent.name(),
            torrent.info_hash(),
            storage
        );
        Ok(torrent)
    }

    /// Removes a torrent from the queue and the session.
    ///
    /// # Errors
    /// - `ServiceError::Torrent` - `TorrentNotFound` for an unknown hash, or
    ///   the library refused the removal
    pub async fn remove_torrent(
        &self,
        info_hash: &InfoHash,
        delete_files: bool,
    ) -> Result<(), ServiceError> {
        let torrent = self
            .queue
            .delete(info_hash)
            .ok_or(TorrentError::TorrentNotFound {
                info_hash: *info_hash,
            })?;
        self.players.lock().remove(info_hash);
        torrent.drop_torrent(delete_files).await?;
        Ok(())
    }

    /// Logged only; torrents keep their own paused state.
    pub fn pause_session(&self) {
        info!("Session pause requested; leaving torrents untouched");
    }

    /// Logged only; see [`Service::pause_session`].
    pub fn resume_session(&self) {
        info!("Session resume requested; leaving torrents untouched");
    }

    pub fn stats(&self) -> ServiceStats {
        self.stats.read().clone()
    }

    /// Where finished downloads of `info_hash` end up, when the library
    /// knows the item.
    pub fn completed_destination(&self, info_hash: &InfoHash) -> Option<PathBuf> {
        let item = self.library.item(info_hash)?;
        destination_dir(&self.ctx.config(), &item)
    }

    /// Stops every loop, flushes pending alerts and closes the session.
    ///
    /// Torrents stay in the library session state on disk; nothing is
    /// deleted. Idempotent.
    ///
    /// # Errors
    /// - `ServiceError::Torrent` - `Timeout` when the library did not close in time
    /// - `ServiceError::Backend` - the library failed to close
    pub async fn close(&self) -> Result<(), ServiceError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing service");
        self.save_resume_pass();
        self.process_alerts();
        self.ctx.shutdown.cancel();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!("Service loop ended abnormally: {}", e);
            }
        }
        self.alerts.close();
        self.ctx.host.clear_progress();

        match tokio::time::timeout(CLOSE_TIMEOUT, self.ctx.session.close()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("Session close timed out after {:?}", CLOSE_TIMEOUT);
                return Err(TorrentError::Timeout {
                    operation: "session close".to_string(),
                }
                .into());
            }
        }
        info!("Service closed");
        Ok(())
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    //! A service over the simulated library in a temporary profile.

    use std::sync::Arc;

    use tempfile::TempDir;

    use super::{Service, ServiceParts};
    use crate::backend::simulated::SimulatedSession;
    use crate::config::UndertowConfig;
    use crate::host::RecordingHost;
    use crate::library::JsonMediaLibrary;
    use crate::resources::FixedResources;

    pub struct TestService {
        pub dir: TempDir,
        pub session: Arc<SimulatedSession>,
        pub host: Arc<RecordingHost>,
        pub resources: Arc<FixedResources>,
        pub library: Arc<JsonMediaLibrary>,
        pub service: Arc<Service>,
    }

    impl TestService {
        /// Builds a service without spawning its loops. `configure` runs on
        /// the profile defaults first.
        ///
        /// # Panics
        /// Panics when the temporary profile cannot be set up.
        pub fn new(configure: impl FnOnce(&mut UndertowConfig)) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = UndertowConfig::for_profile(dir.path());
            configure(&mut config);
            let session = Arc::new(SimulatedSession::new());
            let host = Arc::new(RecordingHost::default());
            let resources = Arc::new(FixedResources::new(u64::MAX / 4, u64::MAX / 4));
            let library = Arc::new(JsonMediaLibrary::open(config.library_path()).unwrap());
            let service = Service::new(ServiceParts {
                session: session.clone(),
                config,
                resources: resources.clone(),
                host: host.clone(),
                library: library.clone(),
            })
            .unwrap();
            Self {
                dir,
                session,
                host,
                resources,
                library,
                service,
            }
        }
    }
}
