//! Process lifecycle: single-instance lock and shutdown signals

use crate::error::{Error, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Lock file holding the pid of the running sidecar.
///
/// The file is removed when the lock is dropped.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    pid: u32,
}

impl ProcessLock {
    /// Take the lock at `path`, replacing a stale one left by a dead process
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        match fs::read_to_string(&path) {
            Ok(contents) => match contents.trim().parse::<u32>() {
                Ok(pid) if process_alive(pid) => return Err(Error::AlreadyRunning(pid)),
                Ok(pid) => {
                    warn!("🧹 Removing stale lock {} left by pid {}", path.display(), pid);
                    fs::remove_file(&path)?;
                }
                Err(_) => {
                    warn!("🧹 Removing unreadable lock {}", path.display());
                    fs::remove_file(&path)?;
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let pid = std::process::id();
        fs::write(&path, pid.to_string())?;
        info!("🔒 Acquired process lock {} (pid {})", path.display(), pid);

        Ok(Self { path, pid })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => info!("🔓 Released process lock {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove lock {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

// No portable liveness check; a leftover lock must be removed by hand
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Resolves on SIGINT or SIGTERM
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };

    let sigterm = async {
        match terminate.as_mut() {
            Some(stream) => {
                stream.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for SIGINT: {}", e);
            }
            info!("📥 Received SIGINT");
        }
        _ = sigterm => info!("📥 Received SIGTERM"),
    }
}

/// Resolves on Ctrl-C
#[cfg(not(unix))]
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
    }
    info!("📥 Received Ctrl-C");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_writes_pid_and_drop_removes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sidecar-server.lock");

        let lock = ProcessLock::acquire(&path).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, std::process::id().to_string());
        assert_eq!(lock.pid(), std::process::id());

        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_live_owner_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sidecar-server.lock");
        let _held = ProcessLock::acquire(&path).unwrap();

        match ProcessLock::acquire(&path) {
            Err(Error::AlreadyRunning(pid)) => assert_eq!(pid, std::process::id()),
            other => panic!("expected AlreadyRunning, got {:?}", other),
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_stale_lock_is_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sidecar-server.lock");
        // Above the kernel's pid_max ceiling, so never a live process
        fs::write(&path, "4194305").unwrap();

        let lock = ProcessLock::acquire(&path).unwrap();
        assert_eq!(fs::read_to_string(lock.path()).unwrap(), std::process::id().to_string());
    }

    #[test]
    fn test_garbage_lock_is_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("sidecar-server.lock");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "not a pid").unwrap();

        let _lock = ProcessLock::acquire(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), std::process::id().to_string());
    }
}
