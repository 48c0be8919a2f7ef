// ABOUTME: Append-only audit log of run transitions and health outcomes.
// ABOUTME: JSONL with monotonic sequence numbers; powers status and resume detection.

use crate::health::HealthStatus;
use crate::run::RunStatus;
use crate::types::{BackupId, RunId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit record malformed at line {line}: {source}")]
    Malformed {
        line: usize,
        source: serde_json::Error,
    },

    #[error("audit serialization failed: {0}")]
    Serialize(serde_json::Error),
}

/// One event in a run's history. Serialized with a `kind` tag so the log
/// stays greppable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    StatusChanged {
        from: RunStatus,
        to: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase: Option<String>,
    },
    PhaseStarted {
        phase: String,
        index: usize,
        required: bool,
    },
    PhaseHealthy {
        phase: String,
    },
    PhaseFailed {
        phase: String,
        required: bool,
        failures: Vec<String>,
    },
    HealthObserved {
        service: String,
        status: HealthStatus,
        attempts: u32,
        elapsed_ms: u64,
    },
    ServiceStarted {
        service: String,
    },
    ServiceStopped {
        service: String,
    },
    BackupCreated {
        backup: BackupId,
    },
    BackupSkipped {
        reason: String,
    },
    BackupRestored {
        backup: BackupId,
    },
    Warning {
        message: String,
    },
    ErrorRecorded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attempts: Option<u32>,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub run: RunId,
    #[serde(flatten)]
    pub event: AuditEvent,
}

/// Everything `status` needs to say about one run, derived from its records.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run: RunId,
    pub started_at: DateTime<Utc>,
    pub last_at: DateTime<Utc>,
    pub last_status: RunStatus,
    pub last_phase: Option<String>,
    pub backup: Option<BackupId>,
}

impl RunSummary {
    /// A run that never reached a terminal status was interrupted; the
    /// operator has to roll back or force past it.
    pub fn is_incomplete(&self) -> bool {
        !self.last_status.is_terminal()
    }
}

struct Inner {
    file: std::fs::File,
    next_seq: u64,
}

/// Append-only event log. Interior mutability keeps `append` usable behind a
/// shared reference.
pub struct AuditLog {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl AuditLog {
    /// Open (or create) the log, resuming the sequence counter from the last
    /// record on disk.
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let next_seq = match Self::read_records_at(path) {
            Ok(records) => records.last().map(|r| r.seq + 1).unwrap_or(0),
            Err(AuditError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner { file, next_seq }),
        })
    }

    /// Append one event, returning its sequence number.
    pub fn append(&self, run: &RunId, event: AuditEvent) -> Result<u64, AuditError> {
        let mut inner = self.inner.lock();
        let record = AuditRecord {
            seq: inner.next_seq,
            at: Utc::now(),
            run: run.clone(),
            event,
        };

        let json = serde_json::to_string(&record).map_err(AuditError::Serialize)?;
        writeln!(inner.file, "{}", json)?;
        inner.file.flush()?;

        inner.next_seq += 1;
        Ok(record.seq)
    }

    /// Every record in the log, in append order.
    pub fn records(&self) -> Result<Vec<AuditRecord>, AuditError> {
        Self::read_records_at(&self.path)
    }

    /// Per-run summaries, in order of each run's first record.
    pub fn run_summaries(&self) -> Result<Vec<RunSummary>, AuditError> {
        let mut summaries: Vec<RunSummary> = Vec::new();
        for record in self.records()? {
            let summary = match summaries.iter_mut().find(|s| s.run == record.run) {
                Some(summary) => summary,
                None => {
                    summaries.push(RunSummary {
                        run: record.run.clone(),
                        started_at: record.at,
                        last_at: record.at,
                        last_status: RunStatus::Idle,
                        last_phase: None,
                        backup: None,
                    });
                    summaries.last_mut().expect("just pushed")
                }
            };

            summary.last_at = record.at;
            match &record.event {
                AuditEvent::StatusChanged { to, .. } => summary.last_status = *to,
                AuditEvent::PhaseStarted { phase, .. } => {
                    summary.last_phase = Some(phase.clone())
                }
                AuditEvent::BackupCreated { backup } => summary.backup = Some(backup.clone()),
                _ => {}
            }
        }
        Ok(summaries)
    }

    pub fn last_run(&self) -> Result<Option<RunSummary>, AuditError> {
        Ok(self.run_summaries()?.pop())
    }

    /// The most recent run, if it was left without a terminal status.
    pub fn incomplete_run(&self) -> Result<Option<RunSummary>, AuditError> {
        Ok(self.last_run()?.filter(|s| s.is_incomplete()))
    }

    fn read_records_at(path: &Path) -> Result<Vec<AuditRecord>, AuditError> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let mut records = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|e| AuditError::Malformed {
                line: index + 1,
                source: e,
            })?;
            records.push(record);
        }
        Ok(records)
    }
}
