// ABOUTME: Point-in-time snapshots of the data store and configuration.
// ABOUTME: Create before mutating, restore on rollback, prune by retention.

use crate::config::Config;
use crate::plan::ServiceDescriptor;
use crate::run::lock::{LockError, LockFile};
use crate::runtime::{RuntimeError, ServiceController, ServiceRuntime};
use crate::types::BackupId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const MANIFEST_FILE: &str = "manifest.json";
const DATA_FILE: &str = "data.dump";
const CONFIG_FILE: &str = "config.yml";

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("data store lock not acquired within {0:?}")]
    StoreLocked(Duration),

    #[error(transparent)]
    Lock(LockError),

    #[error("snapshot dump failed: {0}")]
    DumpFailed(String),

    #[error("restore of backup {backup} failed: {reason}")]
    RestoreFailed { backup: BackupId, reason: String },

    #[error("backup not found: {0}")]
    NotFound(BackupId),

    #[error("backup manifest malformed: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("backup I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An immutable snapshot. The manifest stores file names relative to the
/// snapshot directory so the state dir can be relocated wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub id: BackupId,
    pub created_at: DateTime<Utc>,
    data_file: String,
    config_file: Option<String>,

    #[serde(skip)]
    dir: PathBuf,
}

impl Backup {
    pub fn data_snapshot(&self) -> PathBuf {
        self.dir.join(&self.data_file)
    }

    pub fn config_snapshot(&self) -> Option<PathBuf> {
        self.config_file.as_ref().map(|f| self.dir.join(f))
    }

    fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Creates, restores, lists, and prunes snapshots.
pub struct BackupManager<'a, R> {
    runtime: &'a R,
    config: &'a Config,
}

impl<'a, R: ServiceRuntime> BackupManager<'a, R> {
    pub fn new(runtime: &'a R, config: &'a Config) -> Self {
        Self { runtime, config }
    }

    fn datastore_container(&self) -> Result<String, BackupError> {
        self.config
            .phases
            .service(&self.config.datastore.service)
            .map(|s| s.container_name().to_string())
            .ok_or_else(|| {
                BackupError::DumpFailed(format!(
                    "datastore service '{}' is not in the plan",
                    self.config.datastore.service
                ))
            })
    }

    /// Create a snapshot of the data store and the configuration file.
    ///
    /// Holds the exclusive store lock for the duration of the dump so no
    /// mutation interleaves with the snapshot.
    pub async fn create(&self) -> Result<Backup, BackupError> {
        let _store_lock = LockFile::acquire_wait(
            &self.config.store_lock_path(),
            self.config.backups.lock_wait,
        )
        .await
        .map_err(|e| match e {
            LockError::Timeout(wait) => BackupError::StoreLocked(wait),
            other => BackupError::Lock(other),
        })?;

        let container = self.datastore_container()?;
        let output = self
            .runtime
            .exec(&container, &self.config.datastore.dump, None)
            .await
            .map_err(|e| BackupError::DumpFailed(e.to_string()))?;

        if !output.success() {
            return Err(BackupError::DumpFailed(output.stderr_text()));
        }

        let (id, dir) = self.claim_snapshot_dir()?;
        tokio::fs::write(dir.join(DATA_FILE), &output.stdout).await?;

        let config_file = match &self.config.source {
            Some(source) => {
                tokio::fs::copy(source, dir.join(CONFIG_FILE)).await?;
                Some(CONFIG_FILE.to_string())
            }
            None => None,
        };

        let backup = Backup {
            id: id.clone(),
            created_at: Utc::now(),
            data_file: DATA_FILE.to_string(),
            config_file,
            dir: dir.clone(),
        };

        let manifest = serde_json::to_string_pretty(&backup)?;
        tokio::fs::write(dir.join(MANIFEST_FILE), manifest).await?;

        tracing::info!(backup = %id, "snapshot created");
        Ok(backup)
    }

    /// Restore a snapshot: stop everything, apply the data dump, restart the
    /// phase that serves the data.
    ///
    /// All-or-nothing: the first failure aborts with the backup id surfaced
    /// for manual recovery, and nothing further is attempted.
    pub async fn restore(
        &self,
        id: &BackupId,
        controller: &ServiceController<'_, R>,
    ) -> Result<(), BackupError> {
        let backup = self.load(id)?;
        let data = tokio::fs::read(backup.data_snapshot()).await?;

        let failed = |reason: String| BackupError::RestoreFailed {
            backup: id.clone(),
            reason,
        };

        // Stop in reverse plan order so dependents go down before their
        // dependencies.
        let mut shutdown: Vec<&ServiceDescriptor> = self.config.phases.services().collect();
        shutdown.reverse();
        for service in shutdown {
            controller
                .stop(service)
                .await
                .map_err(|e| failed(e.to_string()))?;
        }

        let container = self.datastore_container()?;
        let datastore = self
            .serving_services()
            .into_iter()
            .find(|s| s.name == self.config.datastore.service);

        // The restore command needs the datastore itself up.
        if let Some(service) = &datastore {
            self.start_for_restore(service).await.map_err(&failed)?;
        }

        let output = self
            .runtime
            .exec(&container, &self.config.datastore.restore, Some(&data))
            .await
            .map_err(|e| failed(e.to_string()))?;

        if !output.success() {
            return Err(failed(output.stderr_text()));
        }

        // Bring the rest of the serving set back.
        for service in self.serving_services() {
            if Some(&service.name) == datastore.as_ref().map(|s| &s.name) {
                continue;
            }
            self.start_for_restore(service).await.map_err(&failed)?;
        }

        tracing::info!(backup = %id, "snapshot restored");
        Ok(())
    }

    /// The minimal set that must run to serve restored data: the phase that
    /// declares the datastore service.
    fn serving_services(&self) -> Vec<&ServiceDescriptor> {
        self.config
            .phases
            .phase_index_of(&self.config.datastore.service)
            .and_then(|index| self.config.phases.phase(index))
            .map(|phase| phase.services.iter().collect())
            .unwrap_or_default()
    }

    /// Plain runtime start, bypassing the dependency gate: restore brings the
    /// serving set up as a unit without health ceremony.
    async fn start_for_restore(&self, service: &ServiceDescriptor) -> Result<(), String> {
        match self.runtime.start(service.container_name()).await {
            Ok(()) | Err(RuntimeError::AlreadyRunning(_)) => Ok(()),
            Err(e) => Err(format!("failed to start '{}': {}", service.name, e)),
        }
    }

    pub fn load(&self, id: &BackupId) -> Result<Backup, BackupError> {
        let dir = self.config.backups_dir().join(id.as_str());
        let manifest_path = dir.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            return Err(BackupError::NotFound(id.clone()));
        }
        let content = std::fs::read_to_string(manifest_path)?;
        let mut backup: Backup = serde_json::from_str(&content)?;
        backup.dir = dir;
        Ok(backup)
    }

    /// All snapshots on disk, newest first.
    pub fn list(&self) -> Result<Vec<Backup>, BackupError> {
        let dir = self.config.backups_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut backups = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = BackupId::new(entry.file_name().to_string_lossy().into_owned());
            match self.load(&id) {
                Ok(backup) => backups.push(backup),
                Err(e) => {
                    tracing::warn!(backup = %id, "skipping unreadable snapshot: {}", e);
                }
            }
        }

        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    /// Prune snapshots beyond the retention count or age. The backup
    /// referenced by an in-progress run is never pruned.
    pub fn prune(&self, in_use: Option<&BackupId>) -> Result<Vec<BackupId>, BackupError> {
        let now = Utc::now();
        let retention = &self.config.backups;
        let backups = self.list()?;

        let mut pruned = Vec::new();
        for (index, backup) in backups.iter().enumerate() {
            let expired =
                index >= retention.retain_count || backup.age(now) > retention.retain_age;
            if !expired || Some(&backup.id) == in_use {
                continue;
            }

            match std::fs::remove_dir_all(&backup.dir) {
                Ok(()) => {
                    tracing::info!(backup = %backup.id, "snapshot pruned");
                    pruned.push(backup.id.clone());
                }
                Err(e) => {
                    tracing::warn!(backup = %backup.id, "prune failed: {}", e);
                }
            }
        }

        Ok(pruned)
    }

    fn claim_snapshot_dir(&self) -> Result<(BackupId, PathBuf), BackupError> {
        let base = BackupId::from_timestamp(Utc::now());
        let root = self.config.backups_dir();
        std::fs::create_dir_all(&root)?;

        let mut id = base.clone();
        for attempt in 0u32.. {
            let dir = root.join(id.as_str());
            match std::fs::create_dir(&dir) {
                Ok(()) => return Ok((id, dir)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt < 8 => {
                    id = BackupId::new(format!("{}-{}", base, attempt + 1));
                }
                Err(e) => return Err(e.into()),
            }
        }
        unreachable!("snapshot dir claim loop always returns");
    }
}
