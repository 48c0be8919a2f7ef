// ABOUTME: Error taxonomy for deployment runs.
// ABOUTME: Distinguishes pre-mutation, phase, and rollback failures.

use super::lock::LockError;
use super::state::InvalidTransition;
use crate::audit::AuditError;
use crate::backup::BackupError;
use crate::runtime::StartError;
use crate::types::{BackupId, RunId};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    /// A second invocation while a run is active fails fast, never queues.
    #[error("a deployment run is already in progress (held by {holder}, pid {pid}, since {since})")]
    RunInProgress {
        holder: String,
        pid: u32,
        since: DateTime<Utc>,
    },

    #[error("preflight: required environment variable {0} is not set")]
    MissingEnv(String),

    #[error("preflight: container runtime unreachable: {0}")]
    RuntimeUnreachable(String),

    #[error("preflight: insufficient free storage: {available} bytes available, {required} required")]
    InsufficientStorage { available: u64, required: u64 },

    #[error(
        "prior run {run} did not finish; roll back with `klimaka rollback <backup-id>` or re-run with --force"
    )]
    PriorRunIncomplete { run: RunId },

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Start(#[from] StartError),

    #[error("required phase '{phase}' failed its health gate: {failures}")]
    PhaseUnhealthy { phase: String, failures: String },

    #[error("verification sweep failed: {failures}")]
    VerifyFailed { failures: String },

    /// Terminal. Never auto-retried; the backup id is surfaced for manual
    /// recovery.
    #[error("rollback failed, manual intervention required{}: {reason}", backup_hint(.backup))]
    RollbackFailed {
        backup: Option<BackupId>,
        reason: String,
    },

    #[error("deployment cancelled")]
    Cancelled,

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Lock(LockError),
}

fn backup_hint(backup: &Option<BackupId>) -> String {
    match backup {
        Some(id) => format!(" (backup {})", id),
        None => String::new(),
    }
}

impl From<LockError> for DeployError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Held { holder, pid, since } => DeployError::RunInProgress {
                holder,
                pid,
                since,
            },
            other => DeployError::Lock(other),
        }
    }
}
