//! Watches `libtorrent.config` and re-applies its overrides.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_full::{DebounceEventResult, new_debouncer};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Service, ServiceError};
use crate::backend::SettingsPack;
use crate::backend::settings::{build_settings, parse_overrides};

/// Quiet period before a burst of filesystem events is delivered.
pub const CONFIG_DEBOUNCE: Duration = Duration::from_secs(1);

#[derive(Default)]
pub(super) struct OverridesState {
    applied: Mutex<SettingsPack>,
}

impl Service {
    /// Reloads the overrides whenever the profile directory reports an
    /// event for the overrides file.
    pub(super) async fn run_config_watcher(self: Arc<Self>) {
        let path = self.ctx.config().overrides_path();
        let Some(dir) = path.parent().map(Path::to_path_buf) else {
            return;
        };
        let (tx, mut rx) = mpsc::channel(16);
        let handler = move |result: DebounceEventResult| {
            if let Err(e) = tx.blocking_send(result) {
                debug!("Config watcher gone: {}", e);
            }
        };
        let mut debouncer = match new_debouncer(CONFIG_DEBOUNCE, None, handler) {
            Ok(debouncer) => debouncer,
            Err(e) => {
                warn!("Cannot watch {}: {}", path.display(), e);
                return;
            }
        };
        if let Err(e) = debouncer.watch(&dir, RecursiveMode::NonRecursive) {
            warn!("Cannot watch {}: {}", dir.display(), e);
            return;
        }
        debug!("Watching {}", path.display());

        loop {
            tokio::select! {
                result = rx.recv() => {
                    let Some(result) = result else { break };
                    match result {
                        Ok(events) => {
                            let touched = events.iter().any(|event| {
                                !event.kind.is_access()
                                    && event.paths.iter().any(|p| p.file_name() == path.file_name())
                            });
                            if touched && let Err(e) = self.reload_overrides() {
                                warn!("Keeping previous overrides: {}", e);
                            }
                        }
                        Err(errors) => {
                            for e in errors {
                                warn!("Watch error on {}: {}", dir.display(), e);
                            }
                        }
                    }
                }
                _ = self.ctx.shutdown.cancelled() => break,
            }
        }
        debug!("Config watcher stopped");
    }

    /// Re-reads the overrides file and applies the new pack wholesale when
    /// it differs from the one in effect. Keys dropped from the file go
    /// back to their baseline value. Returns whether anything was applied.
    ///
    /// # Errors
    /// - `ServiceError::Io` - the file exists but cannot be read
    /// - `ServiceError::Backend` - the session rejected the pack
    pub fn reload_overrides(&self) -> Result<bool, ServiceError> {
        let config = self.ctx.config();
        let path = config.overrides_path();
        let overrides = match std::fs::read_to_string(&path) {
            Ok(text) => parse_overrides(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SettingsPack::new(),
            Err(e) => return Err(e.into()),
        };

        let mut applied = self.overrides.applied.lock();
        if *applied == overrides {
            return Ok(false);
        }
        let baseline = build_settings(&config, &self.endpoints);
        let mut pack = overrides.clone();
        for (key, _) in applied.iter() {
            if pack.get(key).is_none()
                && let Some(value) = baseline.get(key)
            {
                pack.set(key, value.clone());
            }
        }
        if pack.is_empty() {
            *applied = overrides;
            return Ok(false);
        }
        self.ctx.session.apply_settings(&pack)?;
        info!(
            "Applied {} override(s) from {}",
            overrides.len(),
            path.display()
        );
        *applied = overrides;
        Ok(true)
    }

    /// Overrides currently in effect.
    pub fn applied_overrides(&self) -> SettingsPack {
        self.overrides.applied.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::service::testing::TestService;

    fn write_overrides(test: &TestService, text: &str, modified: SystemTime) {
        let path = test.service.config().overrides_path();
        std::fs::write(&path, text).unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(modified).unwrap();
    }

    #[tokio::test]
    async fn test_overrides_applied_on_change_only() {
        let test = TestService::new(|config| {
            config.network.connections_limit = 200;
        });
        assert!(!test.service.reload_overrides().unwrap());

        let now = SystemTime::now();
        write_overrides(&test, "connections_limit=55\nenable_lsd=false\n", now);
        assert!(test.service.reload_overrides().unwrap());
        assert_eq!(test.session.setting_int("connections_limit"), Some(55));
        assert_eq!(test.session.settings().get_bool("enable_lsd"), Some(false));
        assert!(!test.service.reload_overrides().unwrap());

        // Dropping a key restores its baseline value.
        write_overrides(&test, "enable_lsd=false\n", now);
        assert!(test.service.reload_overrides().unwrap());
        assert_eq!(test.session.setting_int("connections_limit"), Some(200));
        assert_eq!(test.service.applied_overrides().len(), 1);
    }

    #[tokio::test]
    async fn test_rewrite_with_same_mtime_is_applied() {
        let test = TestService::new(|_| {});
        let stamp = SystemTime::now() - Duration::from_secs(60);
        write_overrides(&test, "connections_limit=55\n", stamp);
        assert!(test.service.reload_overrides().unwrap());
        assert_eq!(test.session.setting_int("connections_limit"), Some(55));

        write_overrides(&test, "connections_limit=77\n", stamp);
        assert!(test.service.reload_overrides().unwrap());
        assert_eq!(test.session.setting_int("connections_limit"), Some(77));
    }

    #[tokio::test]
    async fn test_removed_file_restores_baseline() {
        let test = TestService::new(|_| {});
        write_overrides(&test, "enable_dht=false\n", SystemTime::now());
        assert!(test.service.reload_overrides().unwrap());
        assert_eq!(test.session.settings().get_bool("enable_dht"), Some(false));

        std::fs::remove_file(test.service.config().overrides_path()).unwrap();
        assert!(test.service.reload_overrides().unwrap());
        assert_eq!(test.session.settings().get_bool("enable_dht"), Some(true));
        assert!(test.service.applied_overrides().is_empty());
    }

    #[tokio::test]
    async fn test_watcher_applies_rewritten_file() {
        let test = TestService::new(|_| {});
        let watcher = tokio::spawn(test.service.clone().run_config_watcher());
        tokio::time::sleep(Duration::from_millis(200)).await;

        std::fs::write(
            test.service.config().overrides_path(),
            "connections_limit=77\n",
        )
        .unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while test.session.setting_int("connections_limit") != Some(77) {
            assert!(tokio::time::Instant::now() < deadline, "override never applied");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        test.service.context().shutdown.cancel();
        watcher.await.unwrap();
    }
}
