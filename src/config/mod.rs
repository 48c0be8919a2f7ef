// ABOUTME: Configuration types and parsing for klimaka.yml.
// ABOUTME: Handles YAML parsing, path discovery, and preflight requirements.

mod backoff;
mod probe;
mod restart_policy;

pub use backoff::BackoffPolicy;
pub use probe::ProbeConfig;
pub use restart_policy::RestartPolicy;

use crate::error::{Error, Result};
use crate::plan::DeploymentPlan;
use crate::types::ServiceName;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILENAME: &str = "klimaka.yml";
pub const CONFIG_FILENAME_ALT: &str = "klimaka.yaml";
pub const CONFIG_FILENAME_DIR: &str = ".klimaka/config.yml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    pub phases: DeploymentPlan,

    pub datastore: DatastoreConfig,

    #[serde(default)]
    pub backups: BackupConfig,

    #[serde(default)]
    pub environment: EnvConfig,

    #[serde(default)]
    pub preflight: PreflightConfig,

    /// Where this config was loaded from; snapshotted alongside backups.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    /// Unix socket of the container runtime. Defaults to the platform socket.
    #[serde(default)]
    pub socket: Option<String>,
}

/// The data store whose contents back every snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct DatastoreConfig {
    /// Plan service that owns the data. Must be declared in some phase.
    pub service: ServiceName,

    /// Command run inside the datastore container; its stdout is the data
    /// snapshot.
    pub dump: Vec<String>,

    /// Command run inside the datastore container; the data snapshot is fed
    /// to its stdin.
    pub restore: Vec<String>,

    /// Environment variable holding the data store connection string.
    #[serde(default = "default_connection_env")]
    pub connection_env: String,
}

fn default_connection_env() -> String {
    "DATABASE_URL".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    /// Snapshot directory, defaulting to `<state_dir>/backups`.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Keep at most this many snapshots.
    #[serde(default = "default_retain_count")]
    pub retain_count: usize,

    /// Prune snapshots older than this.
    #[serde(default = "default_retain_age", with = "humantime_serde")]
    pub retain_age: Duration,

    /// Bounded wait for the exclusive store lock.
    #[serde(default = "default_lock_wait", with = "humantime_serde")]
    pub lock_wait: Duration,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: None,
            retain_count: default_retain_count(),
            retain_age: default_retain_age(),
            lock_wait: default_lock_wait(),
        }
    }
}

fn default_retain_count() -> usize {
    7
}

fn default_retain_age() -> Duration {
    // 14 days
    Duration::from_secs(14 * 24 * 60 * 60)
}

fn default_lock_wait() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvConfig {
    /// Environment variables that must be present before anything mutates.
    #[serde(default)]
    pub required: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreflightConfig {
    /// Minimum free disk space for the state directory, e.g. "512m" or "2g".
    #[serde(
        default = "default_min_free_disk",
        deserialize_with = "deserialize_byte_size"
    )]
    pub min_free_disk: u64,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            min_free_disk: default_min_free_disk(),
        }
    }
}

fn default_min_free_disk() -> u64 {
    512 * 1024 * 1024
}

fn default_state_dir() -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
    home.join(".local/state/klimaka")
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&content)?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn discover(dir: &Path) -> Result<Self> {
        let candidates = [
            dir.join(CONFIG_FILENAME),
            dir.join(CONFIG_FILENAME_ALT),
            dir.join(CONFIG_FILENAME_DIR),
        ];

        for path in &candidates {
            if path.exists() {
                return Self::load(path);
            }
        }

        Err(Error::ConfigNotFound(dir.to_path_buf()))
    }

    fn validate(&self) -> Result<()> {
        self.phases.validate()?;

        if self.phases.service(&self.datastore.service).is_none() {
            return Err(Error::InvalidConfig(format!(
                "datastore service '{}' is not declared in any phase",
                self.datastore.service
            )));
        }
        if self.datastore.dump.is_empty() || self.datastore.restore.is_empty() {
            return Err(Error::InvalidConfig(
                "datastore dump and restore commands cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Every environment variable Preflight requires: the connection string,
    /// explicitly listed secrets, and per-service base URL overrides.
    pub fn required_env(&self) -> Vec<String> {
        let mut vars = vec![self.datastore.connection_env.clone()];
        vars.extend(self.environment.required.iter().cloned());
        vars.extend(
            self.phases
                .services()
                .filter_map(|s| s.base_url_env.clone()),
        );
        let mut seen = std::collections::HashSet::new();
        vars.retain(|v| seen.insert(v.clone()));
        vars
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.backups
            .dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("backups"))
    }

    pub fn audit_path(&self) -> PathBuf {
        self.state_dir.join("audit.log")
    }

    pub fn run_lock_path(&self) -> PathBuf {
        self.state_dir.join("run.lock")
    }

    pub fn store_lock_path(&self) -> PathBuf {
        self.state_dir.join("store.lock")
    }
}

/// Parse a size string like "512m" or "1g" into bytes.
fn parse_byte_size(spec: &str) -> Option<u64> {
    let spec = spec.trim().to_lowercase();
    let (num_str, multiplier) = if let Some(stripped) = spec.strip_suffix('g') {
        (stripped, 1024 * 1024 * 1024)
    } else if let Some(stripped) = spec.strip_suffix('m') {
        (stripped, 1024 * 1024)
    } else if let Some(stripped) = spec.strip_suffix('k') {
        (stripped, 1024)
    } else {
        (spec.as_str(), 1)
    };

    num_str.parse::<u64>().ok().map(|n| n * multiplier)
}

fn deserialize_byte_size<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_byte_size(&s)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid size: '{}'", s)))
}
