// ABOUTME: DeploymentRun record and its status transition table.
// ABOUTME: Rollback idempotence and audit ordering hang off these states.

use crate::types::{BackupId, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Lifecycle states of a deployment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Preflight,
    BackingUp,
    PhaseRunning,
    Verifying,
    RolledBack,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// The allowed transition table. `PhaseRunning -> PhaseRunning` covers
    /// advancing to the next phase; `Idle -> RolledBack` is the operator
    /// rollback command, which ends in Completed when the restore succeeds.
    pub fn can_transition(self, to: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, to),
            (Idle, Preflight)
                | (Idle, RolledBack)
                | (Preflight, BackingUp)
                | (Preflight, Completed)
                | (Preflight, RolledBack)
                | (Preflight, Failed)
                | (BackingUp, PhaseRunning)
                | (BackingUp, RolledBack)
                | (BackingUp, Failed)
                | (PhaseRunning, PhaseRunning)
                | (PhaseRunning, Verifying)
                | (PhaseRunning, RolledBack)
                | (Verifying, Completed)
                | (Verifying, RolledBack)
                | (RolledBack, Completed)
                | (RolledBack, Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Idle => "idle",
            RunStatus::Preflight => "preflight",
            RunStatus::BackingUp => "backing-up",
            RunStatus::PhaseRunning => "phase-running",
            RunStatus::Verifying => "verifying",
            RunStatus::RolledBack => "rolled-back",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Error)]
#[error("invalid run transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: RunStatus,
    pub to: RunStatus,
}

/// The mutable record of one deployment invocation.
///
/// Mutated only by the orchestrator; every transition is validated against
/// the table above and mirrored into the audit log.
#[derive(Debug, Clone)]
pub struct DeploymentRun {
    pub id: RunId,
    pub started_at: DateTime<Utc>,
    pub status: RunStatus,
    pub current_phase: Option<usize>,
    pub backup: Option<BackupId>,
}

impl DeploymentRun {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: RunId::from_timestamp(now),
            started_at: now,
            status: RunStatus::Idle,
            current_phase: None,
            backup: None,
        }
    }

    /// Move to `to`, returning the prior status for audit.
    pub fn transition(&mut self, to: RunStatus) -> Result<RunStatus, InvalidTransition> {
        if !self.status.can_transition(to) {
            return Err(InvalidTransition {
                from: self.status,
                to,
            });
        }
        let from = self.status;
        self.status = to;
        Ok(from)
    }
}

impl Default for DeploymentRun {
    fn default() -> Self {
        Self::new()
    }
}
