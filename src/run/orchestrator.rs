// ABOUTME: Drives a deployment run through preflight, backup, phases, and verify.
// ABOUTME: Decides rollback policy and guarantees it on failure or cancellation.

use super::error::DeployError;
use super::lock::{LockError, LockFile, RunLock};
use super::state::{DeploymentRun, RunStatus};
use crate::audit::{AuditEvent, AuditLog};
use crate::backup::BackupManager;
use crate::config::Config;
use crate::diagnostics::{Diagnostics, Warning};
use crate::health::{HealthCheckResult, HealthChecker, HealthStatus, Probe};
use crate::plan::Phase;
use crate::runtime::{ServiceController, ServiceRuntime};
use crate::types::{BackupId, RunId, ServiceName};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

/// What a finished (successful) deploy looked like.
#[derive(Debug)]
pub struct DeployOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    /// True when the system was already deployed and healthy, so nothing was
    /// backed up or restarted.
    pub no_op: bool,
    pub warnings: Vec<Warning>,
}

/// Orchestrates deployment runs over a container runtime and a health probe.
///
/// Holds no state of its own between invocations; everything durable lives in
/// the audit log, the lock files, and the backup store.
pub struct Orchestrator<'a, R, P> {
    config: &'a Config,
    runtime: &'a R,
    probe: &'a P,
    audit: &'a AuditLog,
    cancel: CancellationToken,
    diagnostics: Diagnostics,
}

impl<'a, R: ServiceRuntime, P: Probe> Orchestrator<'a, R, P> {
    pub fn new(
        config: &'a Config,
        runtime: &'a R,
        probe: &'a P,
        audit: &'a AuditLog,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            runtime,
            probe,
            audit,
            cancel,
            diagnostics: Diagnostics::default(),
        }
    }

    /// Run a full deployment. Exactly one run may be active system-wide; a
    /// concurrent invocation fails fast with `RunInProgress`.
    pub async fn deploy(&mut self, force: bool) -> Result<DeployOutcome, DeployError> {
        let _run_lock = RunLock::acquire(&self.config.run_lock_path())?;

        if let Some(prior) = self.audit.incomplete_run()? {
            if force {
                tracing::warn!(run = %prior.run, "forcing past incomplete prior run");
            } else {
                return Err(DeployError::PriorRunIncomplete { run: prior.run });
            }
        }

        let mut run = DeploymentRun::new();
        match self.drive(&mut run).await {
            Ok(no_op) => Ok(DeployOutcome {
                run_id: run.id.clone(),
                status: run.status,
                no_op,
                warnings: self.diagnostics.take(),
            }),
            Err(error) => {
                let phase = run
                    .current_phase
                    .and_then(|i| self.config.phases.phase(i))
                    .map(|p| p.name.clone());
                let _ = self.audit.append(
                    &run.id,
                    AuditEvent::ErrorRecorded {
                        phase,
                        service: None,
                        attempts: None,
                        message: error.to_string(),
                    },
                );
                Err(error)
            }
        }
    }

    async fn drive(&mut self, run: &mut DeploymentRun) -> Result<bool, DeployError> {
        self.transition(run, RunStatus::Preflight)?;
        if let Err(e) = self.preflight().await {
            // Nothing has mutated yet, so there is nothing to roll back.
            self.transition(run, RunStatus::Failed)?;
            return Err(e);
        }

        if self.cancel.is_cancelled() {
            return self.abort(run, DeployError::Cancelled).await;
        }

        // Re-deploying an already-completed, fully healthy system is a no-op:
        // no new backup, no restarts. The current run is already in the audit
        // log, so look at the one before it.
        let prior = self
            .audit
            .run_summaries()?
            .into_iter()
            .filter(|s| s.run != run.id)
            .next_back();
        if let Some(prior) = prior
            && prior.last_status == RunStatus::Completed
            && self.all_services_ready().await
        {
            tracing::info!("system already deployed and healthy, nothing to do");
            self.transition(run, RunStatus::Completed)?;
            return Ok(true);
        }

        self.transition(run, RunStatus::BackingUp)?;
        let live = self.live_deployment().await;
        let backups = BackupManager::new(self.runtime, self.config);
        match backups.create().await {
            Ok(backup) => {
                self.audit.append(
                    &run.id,
                    AuditEvent::BackupCreated {
                        backup: backup.id.clone(),
                    },
                )?;
                run.backup = Some(backup.id);
            }
            Err(e) if live => {
                // A live deployment with no snapshot to fall back to: refuse
                // to touch it.
                self.transition(run, RunStatus::Failed)?;
                return Err(e.into());
            }
            Err(e) => {
                self.audit.append(
                    &run.id,
                    AuditEvent::BackupSkipped {
                        reason: e.to_string(),
                    },
                )?;
                self.diagnostics
                    .warn(Warning::backup_skipped(format!("backup skipped: {}", e)));
            }
        }

        let mut healthy: HashSet<ServiceName> = HashSet::new();
        for (index, phase) in self.config.phases.phases().enumerate() {
            if self.cancel.is_cancelled() {
                return self.abort(run, DeployError::Cancelled).await;
            }

            run.current_phase = Some(index);
            self.transition(run, RunStatus::PhaseRunning)?;
            self.audit.append(
                &run.id,
                AuditEvent::PhaseStarted {
                    phase: phase.name.clone(),
                    index,
                    required: phase.required,
                },
            )?;
            tracing::info!(phase = %phase.name, required = phase.required, "phase starting");

            if let Err(error) = self.start_phase(run, phase, &healthy).await {
                if phase.required {
                    return self.abort(run, error).await;
                }
                self.diagnostics.warn(Warning::optional_phase_failed(format!(
                    "optional phase '{}' failed to start: {}",
                    phase.name, error
                )));
                continue;
            }

            let checker = HealthChecker::new(self.probe);
            let health = checker.wait_phase(phase, &self.cancel).await;
            for result in &health.results {
                self.audit_health(run, result)?;
            }

            if self.cancel.is_cancelled() {
                return self.abort(run, DeployError::Cancelled).await;
            }

            if health.passed() {
                healthy.extend(phase.service_names().cloned());
                self.audit.append(
                    &run.id,
                    AuditEvent::PhaseHealthy {
                        phase: phase.name.clone(),
                    },
                )?;
                tracing::info!(phase = %phase.name, "phase healthy");
            } else {
                let failures: Vec<String> = health
                    .failures()
                    .map(|r| {
                        format!(
                            "{} {} after {} attempt(s)",
                            r.service,
                            describe_status(r.status),
                            r.attempts
                        )
                    })
                    .collect();
                self.audit.append(
                    &run.id,
                    AuditEvent::PhaseFailed {
                        phase: phase.name.clone(),
                        required: phase.required,
                        failures: failures.clone(),
                    },
                )?;

                if phase.required {
                    let error = DeployError::PhaseUnhealthy {
                        phase: phase.name.clone(),
                        failures: failures.join(", "),
                    };
                    return self.abort(run, error).await;
                }
                self.diagnostics.warn(Warning::optional_phase_failed(format!(
                    "optional phase '{}' unhealthy: {}",
                    phase.name,
                    failures.join(", ")
                )));
            }
        }

        // Full sweep over everything declared healthy so far.
        self.transition(run, RunStatus::Verifying)?;
        let checker = HealthChecker::new(self.probe);
        let targets: Vec<_> = self
            .config
            .phases
            .services()
            .filter(|s| healthy.contains(&s.name))
            .collect();
        let results = checker.sweep(&targets).await;

        let mut required_failures = Vec::new();
        for result in &results {
            self.audit_health(run, result)?;
            if result.status == HealthStatus::Healthy {
                continue;
            }
            if self.service_is_required(&result.service) {
                required_failures.push(format!(
                    "{} {}",
                    result.service,
                    describe_status(result.status)
                ));
            } else {
                self.diagnostics.warn(Warning::verify_degraded(format!(
                    "'{}' degraded after deploy",
                    result.service
                )));
            }
        }

        if self.cancel.is_cancelled() {
            return self.abort(run, DeployError::Cancelled).await;
        }
        if !required_failures.is_empty() {
            let error = DeployError::VerifyFailed {
                failures: required_failures.join(", "),
            };
            return self.abort(run, error).await;
        }

        self.transition(run, RunStatus::Completed)?;

        // Retention is best-effort and never fails a completed deploy.
        match backups.prune(run.backup.as_ref()) {
            Ok(pruned) if !pruned.is_empty() => {
                tracing::info!(count = pruned.len(), "old snapshots pruned");
            }
            Ok(_) => {}
            Err(e) => self
                .diagnostics
                .warn(Warning::prune_failed(format!("snapshot pruning failed: {}", e))),
        }

        Ok(false)
    }

    /// Start a phase's services, refusing any whose dependencies are not yet
    /// healthy.
    async fn start_phase(
        &self,
        run: &DeploymentRun,
        phase: &Phase,
        healthy: &HashSet<ServiceName>,
    ) -> Result<(), DeployError> {
        let controller = ServiceController::new(self.runtime);
        for service in phase.services.iter() {
            match controller.start(service, healthy).await {
                Ok(_) => {
                    self.audit.append(
                        &run.id,
                        AuditEvent::ServiceStarted {
                            service: service.name.to_string(),
                        },
                    )?;
                }
                Err(e) => {
                    self.audit.append(
                        &run.id,
                        AuditEvent::ErrorRecorded {
                            phase: Some(phase.name.clone()),
                            service: Some(service.name.to_string()),
                            attempts: None,
                            message: e.to_string(),
                        },
                    )?;
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Roll back, mark the run failed, and surface `error` (or the rollback
    /// failure, which supersedes it).
    async fn abort(
        &mut self,
        run: &mut DeploymentRun,
        error: DeployError,
    ) -> Result<bool, DeployError> {
        match self.rollback_run(run).await {
            Ok(()) => {
                self.transition(run, RunStatus::Failed)?;
                Err(error)
            }
            Err(rollback_error) => {
                self.transition(run, RunStatus::Failed)?;
                Err(rollback_error)
            }
        }
    }

    /// Restore the run's backup (or stop everything when there is none).
    /// Re-entrant: a second invocation on the same run is a no-op.
    async fn rollback_run(&mut self, run: &mut DeploymentRun) -> Result<(), DeployError> {
        if run.status == RunStatus::RolledBack {
            return Ok(());
        }
        self.transition(run, RunStatus::RolledBack)?;
        tracing::warn!(run = %run.id, "rolling back");

        let controller = ServiceController::new(self.runtime);
        match &run.backup {
            Some(id) => {
                let backups = BackupManager::new(self.runtime, self.config);
                backups.restore(id, &controller).await.map_err(|e| {
                    DeployError::RollbackFailed {
                        backup: Some(id.clone()),
                        reason: e.to_string(),
                    }
                })?;
                self.audit.append(
                    &run.id,
                    AuditEvent::BackupRestored { backup: id.clone() },
                )?;
            }
            None => {
                // No snapshot was taken, so the known-good state is "nothing
                // this run started is left running".
                let mut shutdown: Vec<_> = self.config.phases.services().collect();
                shutdown.reverse();
                for service in shutdown {
                    controller.stop(service).await.map_err(|e| {
                        DeployError::RollbackFailed {
                            backup: None,
                            reason: e.to_string(),
                        }
                    })?;
                    self.audit.append(
                        &run.id,
                        AuditEvent::ServiceStopped {
                            service: service.name.to_string(),
                        },
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Operator-initiated restore of a specific snapshot.
    pub async fn manual_rollback(&mut self, id: &BackupId) -> Result<(), DeployError> {
        let _run_lock = RunLock::acquire(&self.config.run_lock_path())?;

        let mut run = DeploymentRun::new();
        run.backup = Some(id.clone());
        self.transition(&mut run, RunStatus::RolledBack)?;

        let controller = ServiceController::new(self.runtime);
        let backups = BackupManager::new(self.runtime, self.config);
        match backups.restore(id, &controller).await {
            Ok(()) => {
                self.audit
                    .append(&run.id, AuditEvent::BackupRestored { backup: id.clone() })?;
                self.transition(&mut run, RunStatus::Completed)?;
                Ok(())
            }
            Err(e) => {
                let error = DeployError::RollbackFailed {
                    backup: Some(id.clone()),
                    reason: e.to_string(),
                };
                self.audit.append(
                    &run.id,
                    AuditEvent::ErrorRecorded {
                        phase: None,
                        service: None,
                        attempts: None,
                        message: error.to_string(),
                    },
                )?;
                self.transition(&mut run, RunStatus::Failed)?;
                Err(error)
            }
        }
    }

    /// One-shot probe of every service in the plan.
    pub async fn health_sweep(&self) -> Vec<HealthCheckResult> {
        let checker = HealthChecker::new(self.probe);
        let services: Vec<_> = self.config.phases.services().collect();
        checker.sweep(&services).await
    }

    /// Prune old snapshots and break any stale run lock.
    pub fn cleanup(&mut self) -> Result<Vec<BackupId>, DeployError> {
        let in_use = self.audit.incomplete_run()?.and_then(|s| s.backup);
        let backups = BackupManager::new(self.runtime, self.config);
        let pruned = backups.prune(in_use.as_ref())?;

        // Acquiring breaks a stale lock; dropping releases it again. A live
        // lock stays untouched.
        match LockFile::acquire(&self.config.run_lock_path()) {
            Ok(lock) => drop(lock),
            Err(LockError::Held { holder, pid, .. }) => {
                tracing::debug!(%holder, pid, "run lock is live, leaving it");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(pruned)
    }

    pub fn warnings(&self) -> &[Warning] {
        self.diagnostics.warnings()
    }

    async fn preflight(&self) -> Result<(), DeployError> {
        for var in self.config.required_env() {
            if std::env::var_os(&var).is_none() {
                return Err(DeployError::MissingEnv(var));
            }
        }

        self.runtime
            .ping()
            .await
            .map_err(|e| DeployError::RuntimeUnreachable(e.to_string()))?;

        self.check_free_storage()
    }

    fn check_free_storage(&self) -> Result<(), DeployError> {
        let required = self.config.preflight.min_free_disk;
        let Some(available) = free_space_for(&self.config.state_dir) else {
            tracing::debug!("no disk matches the state dir, skipping storage check");
            return Ok(());
        };

        if available < required {
            return Err(DeployError::InsufficientStorage {
                available,
                required,
            });
        }
        Ok(())
    }

    async fn live_deployment(&self) -> bool {
        for service in self.config.phases.services() {
            if let Ok(state) = self.runtime.state(service.container_name()).await
                && state.is_running()
            {
                return true;
            }
        }
        false
    }

    async fn all_services_ready(&self) -> bool {
        self.health_sweep()
            .await
            .iter()
            .all(|r| r.status == HealthStatus::Healthy)
    }

    fn service_is_required(&self, service: &ServiceName) -> bool {
        self.config
            .phases
            .phase_index_of(service)
            .and_then(|i| self.config.phases.phase(i))
            .map(|p| p.required)
            .unwrap_or(true)
    }

    fn audit_health(
        &self,
        run: &DeploymentRun,
        result: &HealthCheckResult,
    ) -> Result<(), DeployError> {
        self.audit.append(
            &run.id,
            AuditEvent::HealthObserved {
                service: result.service.to_string(),
                status: result.status,
                attempts: result.attempts,
                elapsed_ms: result.elapsed.as_millis() as u64,
            },
        )?;
        Ok(())
    }

    fn transition(&self, run: &mut DeploymentRun, to: RunStatus) -> Result<(), DeployError> {
        let from = run.transition(to)?;
        let phase = run
            .current_phase
            .and_then(|i| self.config.phases.phase(i))
            .map(|p| p.name.clone());
        self.audit
            .append(&run.id, AuditEvent::StatusChanged { from, to, phase })?;
        Ok(())
    }
}

fn describe_status(status: HealthStatus) -> &'static str {
    match status {
        HealthStatus::Pending => "still pending",
        HealthStatus::Healthy => "healthy",
        HealthStatus::Unhealthy => "unhealthy",
        HealthStatus::TimedOut => "timed out",
    }
}

/// Free bytes on the disk holding `path`, if any mounted disk contains it.
fn free_space_for(path: &std::path::Path) -> Option<u64> {
    let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| target.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}
