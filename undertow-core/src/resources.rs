//! Host disk and memory queries.

use std::path::Path;

use sysinfo::{Disks, System};

/// Free space and memory as seen by the engine.
pub trait HostResources: Send + Sync {
    /// Bytes available to unprivileged writers on the filesystem holding `path`.
    ///
    /// # Errors
    /// - `std::io::Error` - no mounted filesystem contains `path`
    fn available_space(&self, path: &Path) -> std::io::Result<u64>;

    /// Bytes of memory the host can still hand out.
    fn free_memory(&self) -> u64;

    /// True when a file can be created inside directory `path`.
    fn is_writable(&self, path: &Path) -> bool {
        if std::fs::create_dir_all(path).is_err() {
            return false;
        }
        write_probe(path)
    }
}

fn write_probe(dir: &Path) -> bool {
    let probe = dir.join(format!(".undertow-probe-{}", std::process::id()));
    let writable = std::fs::write(&probe, b"").is_ok();
    let _ = std::fs::remove_file(&probe);
    writable
}

/// `sysinfo`-backed implementation.
#[derive(Debug, Default)]
pub struct SystemResources;

impl HostResources for SystemResources {
    fn available_space(&self, path: &Path) -> std::io::Result<u64> {
        let target = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no filesystem contains {}", path.display()),
                )
            })
    }

    fn free_memory(&self) -> u64 {
        let mut system = System::new();
        system.refresh_memory();
        system.available_memory()
    }
}

/// Fixed numbers for tests; adjustable while running.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug)]
pub struct FixedResources {
    space: std::sync::atomic::AtomicU64,
    memory: std::sync::atomic::AtomicU64,
    read_only: parking_lot::Mutex<Vec<std::path::PathBuf>>,
}

#[cfg(any(test, feature = "test-utils"))]
impl FixedResources {
    pub fn new(space: u64, memory: u64) -> Self {
        Self {
            space: std::sync::atomic::AtomicU64::new(space),
            memory: std::sync::atomic::AtomicU64::new(memory),
            read_only: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn set_space(&self, space: u64) {
        self.space.store(space, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set_memory(&self, memory: u64) {
        self.memory.store(memory, std::sync::atomic::Ordering::SeqCst);
    }

    /// Makes `is_writable` fail below `path`.
    pub fn deny_writes(&self, path: impl Into<std::path::PathBuf>) {
        self.read_only.lock().push(path.into());
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl HostResources for FixedResources {
    fn available_space(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(self.space.load(std::sync::atomic::Ordering::SeqCst))
    }

    fn free_memory(&self) -> u64 {
        self.memory.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn is_writable(&self, path: &Path) -> bool {
        if self.read_only.lock().iter().any(|denied| path.starts_with(denied)) {
            return false;
        }
        std::fs::create_dir_all(path).is_ok() && write_probe(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_memory_is_reported() {
        assert!(SystemResources.free_memory() > 0);
    }

    #[test]
    fn test_writable_probe() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        assert!(SystemResources.is_writable(&nested));
        assert!(nested.is_dir());
        assert_eq!(std::fs::read_dir(&nested).unwrap().count(), 0);
    }

    #[test]
    fn test_fixed_resources() {
        let dir = tempfile::tempdir().unwrap();
        let fixed = FixedResources::new(10, 20);
        fixed.set_space(5);
        assert_eq!(fixed.available_space(dir.path()).unwrap(), 5);
        assert_eq!(fixed.free_memory(), 20);
        fixed.set_memory(8);
        assert_eq!(fixed.free_memory(), 8);

        fixed.deny_writes(dir.path().join("locked"));
        assert!(!fixed.is_writable(&dir.path().join("locked").join("x")));
        assert!(fixed.is_writable(dir.path()));
    }
}
