//! Shared handles every torrent and service loop works with.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::BtSession;
use crate::backend::settings::rate_limit_settings;
use crate::config::UndertowConfig;
use crate::host::Host;
use crate::resources::HostResources;

/// Configuration behind a swappable pointer.
///
/// Readers take an `Arc` snapshot and keep using it; `replace` never
/// disturbs work already in flight.
pub struct SharedConfig {
    inner: RwLock<Arc<UndertowConfig>>,
}

impl SharedConfig {
    pub fn new(config: UndertowConfig) -> Self {
        Self {
            inner: RwLock::new(Arc::new(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<UndertowConfig> {
        self.inner.read().clone()
    }

    pub fn replace(&self, config: UndertowConfig) {
        *self.inner.write() = Arc::new(config);
    }
}

/// Session, configuration and host collaborators, plus the shutdown signal.
pub struct EngineContext {
    pub session: Arc<dyn BtSession>,
    pub config: SharedConfig,
    pub resources: Arc<dyn HostResources>,
    pub host: Arc<dyn Host>,
    /// Cancelled once when the service shuts down.
    pub shutdown: CancellationToken,
    buffering: AtomicUsize,
}

impl EngineContext {
    pub fn new(
        session: Arc<dyn BtSession>,
        config: UndertowConfig,
        resources: Arc<dyn HostResources>,
        host: Arc<dyn Host>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            config: SharedConfig::new(config),
            resources,
            host,
            shutdown: CancellationToken::new(),
            buffering: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> Arc<UndertowConfig> {
        self.config.snapshot()
    }

    /// Number of torrents currently pre-buffering.
    pub fn buffering_count(&self) -> usize {
        self.buffering.load(Ordering::SeqCst)
    }

    /// Lifts the download limit while the first torrent buffers.
    pub fn buffering_started(&self) {
        if self.buffering.fetch_add(1, Ordering::SeqCst) == 0 {
            let config = self.config();
            let upload = if config.limits.limit_after_buffering {
                0
            } else {
                config.limits.upload_rate_limit
            };
            debug!("Buffering started, clearing download rate limit");
            self.apply_limits(0, upload);
        }
    }

    /// Restores configured limits once the last buffering torrent is done.
    pub fn buffering_finished(&self) {
        let previous = self
            .buffering
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if previous == 1 {
            debug!("Buffering finished, restoring rate limits");
            self.restore_rate_limits();
        }
    }

    pub fn restore_rate_limits(&self) {
        let config = self.config();
        self.apply_limits(
            config.limits.download_rate_limit,
            config.limits.upload_rate_limit,
        );
    }

    fn apply_limits(&self, download: u64, upload: u64) {
        if let Err(e) = self
            .session
            .apply_settings(&rate_limit_settings(download, upload))
        {
            warn!("Failed to apply rate limits: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::simulated::SimulatedSession;
    use crate::config::MIB;
    use crate::host::SilentHost;
    use crate::resources::FixedResources;

    fn context(session: Arc<SimulatedSession>) -> Arc<EngineContext> {
        let mut config = UndertowConfig::default();
        config.limits.download_rate_limit = 2 * MIB;
        config.limits.upload_rate_limit = MIB;
        EngineContext::new(
            session,
            config,
            Arc::new(FixedResources::new(u64::MAX, u64::MAX)),
            Arc::new(SilentHost),
        )
    }

    #[test]
    fn test_nested_buffering_restores_once() {
        let session = Arc::new(SimulatedSession::new());
        let ctx = context(session.clone());

        ctx.buffering_started();
        ctx.buffering_started();
        assert_eq!(session.setting_int("download_rate_limit"), Some(0));
        assert_eq!(session.setting_int("upload_rate_limit"), Some(MIB as i64));

        ctx.buffering_finished();
        assert_eq!(session.setting_int("download_rate_limit"), Some(0));
        ctx.buffering_finished();
        assert_eq!(
            session.setting_int("download_rate_limit"),
            Some(2 * MIB as i64)
        );

        // Unbalanced finish is ignored.
        ctx.buffering_finished();
        assert_eq!(ctx.buffering_count(), 0);
    }

    #[test]
    fn test_config_snapshot_survives_replace() {
        let ctx = context(Arc::new(SimulatedSession::new()));
        let before = ctx.config();
        let mut next = (*before).clone();
        next.storage.buffer_size = 1;
        ctx.config.replace(next);

        assert_ne!(before.storage.buffer_size, 1);
        assert_eq!(ctx.config().storage.buffer_size, 1);
    }
}
