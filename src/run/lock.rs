// ABOUTME: Exclusive lock files with owner info, heartbeat, and stale-break.
// ABOUTME: Backs the single-active-run guarantee and the backup store lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// A lock whose heartbeat is older than this belongs to a crashed process
/// and may be broken.
pub const STALE_AFTER: Duration = Duration::from_secs(120);

/// How often a held run lock refreshes its heartbeat.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Poll interval for bounded lock waits.
const ACQUIRE_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock held by {holder} (pid {pid}) since {since}")]
    Held {
        holder: String,
        pid: u32,
        since: DateTime<Utc>,
    },

    #[error("lock not acquired within {0:?}")]
    Timeout(Duration),

    #[error("lock I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Information about who holds a lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Hostname of the machine that holds the lock.
    pub holder: String,
    /// Process id of the lock holder.
    pub pid: u32,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// Last time the holder confirmed it was alive.
    pub heartbeat_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            holder: gethostname::gethostname().to_string_lossy().into_owned(),
            pid: std::process::id(),
            acquired_at: now,
            heartbeat_at: now,
        }
    }

    /// A crashed holder stops heartbeating; a live one does not.
    pub fn is_stale(&self, stale_after: Duration) -> bool {
        let age = Utc::now() - self.heartbeat_at;
        age.to_std().map(|a| a >= stale_after).unwrap_or(false)
    }
}

impl Default for LockInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// A held lock file, released (removed) on drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    info: LockInfo,
}

impl LockFile {
    /// Acquire the lock atomically, breaking a stale or corrupt one.
    ///
    /// Fails fast with [`LockError::Held`] when a live holder exists; there
    /// is no queueing.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let info = LockInfo::new();
        match Self::try_create(path, &info) {
            Ok(()) => return Ok(Self {
                path: path.to_path_buf(),
                info,
            }),
            Err(e) if e.kind() != std::io::ErrorKind::AlreadyExists => return Err(e.into()),
            Err(_) => {}
        }

        // Lock file exists. Break it only if the holder looks dead.
        match Self::read_info(path) {
            Ok(existing) if !existing.is_stale(STALE_AFTER) => {
                return Err(LockError::Held {
                    holder: existing.holder,
                    pid: existing.pid,
                    since: existing.acquired_at,
                });
            }
            Ok(existing) => {
                tracing::warn!(
                    holder = %existing.holder,
                    pid = existing.pid,
                    "breaking stale lock at {}",
                    path.display()
                );
            }
            Err(_) => {
                tracing::warn!("lock info unreadable, breaking lock at {}", path.display());
            }
        }

        std::fs::remove_file(path)?;
        match Self::try_create(path, &info) {
            Ok(()) => Ok(Self {
                path: path.to_path_buf(),
                info,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // Someone else won the race after the break.
                let existing = Self::read_info(path)?;
                Err(LockError::Held {
                    holder: existing.holder,
                    pid: existing.pid,
                    since: existing.acquired_at,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Retry acquisition for up to `wait`; used where brief contention is
    /// expected (the backup store lock) rather than an error.
    pub async fn acquire_wait(path: &Path, wait: Duration) -> Result<Self, LockError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match Self::acquire(path) {
                Ok(lock) => return Ok(lock),
                Err(LockError::Held { .. }) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(ACQUIRE_POLL).await;
                }
                Err(LockError::Held { .. }) => return Err(LockError::Timeout(wait)),
                Err(e) => return Err(e),
            }
        }
    }

    /// Rewrite the lock with a fresh heartbeat timestamp.
    pub fn refresh(&mut self) -> Result<(), LockError> {
        self.info.heartbeat_at = Utc::now();
        let json = serde_json::to_string(&self.info).expect("lock info serializes");
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn try_create(path: &Path, info: &LockInfo) -> std::io::Result<()> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        let json = serde_json::to_string(info).expect("lock info serializes");
        file.write_all(json.as_bytes())
    }

    fn read_info(path: &Path) -> Result<LockInfo, LockError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            LockError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

/// The system-wide deployment run lock.
///
/// Holds a [`LockFile`] and refreshes its heartbeat in the background so a
/// crashed run is distinguishable from a live one.
#[derive(Debug)]
pub struct RunLock {
    lock: LockFile,
    heartbeat: tokio::task::JoinHandle<()>,
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let lock = LockFile::acquire(path)?;

        let heartbeat_path = lock.path().to_path_buf();
        let mut heartbeat_info = lock.info().clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                heartbeat_info.heartbeat_at = Utc::now();
                let json =
                    serde_json::to_string(&heartbeat_info).expect("lock info serializes");
                if let Err(e) = std::fs::write(&heartbeat_path, json) {
                    tracing::warn!("run lock heartbeat failed: {}", e);
                }
            }
        });

        Ok(Self { lock, heartbeat })
    }

    pub fn info(&self) -> &LockInfo {
        self.lock.info()
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}
