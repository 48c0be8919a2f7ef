// ABOUTME: Idempotent start/stop/restart of plan services.
// ABOUTME: Classifies failures and refuses starts with unsatisfied dependencies.

use super::traits::{RuntimeError, ServiceRuntime, ServiceState};
use crate::plan::ServiceDescriptor;
use crate::types::ServiceName;
use std::collections::HashSet;
use thiserror::Error;

/// Start failures, classified so the orchestrator can decide phase policy.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("nothing to start for '{0}': no container artifact exists")]
    MissingArtifact(ServiceName),

    #[error("port conflict starting '{service}': {detail}")]
    PortConflict { service: ServiceName, detail: String },

    #[error("'{service}' depends on '{dependency}', which is not healthy")]
    DependencyNotSatisfied {
        service: ServiceName,
        dependency: ServiceName,
    },

    #[error("runtime error starting '{service}': {source}")]
    Runtime {
        service: ServiceName,
        source: RuntimeError,
    },
}

#[derive(Debug, Error)]
pub enum StopError {
    #[error("runtime error stopping '{service}': {source}")]
    Runtime {
        service: ServiceName,
        source: RuntimeError,
    },
}

/// What a start/stop actually did, for audit purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    Changed,
    NoOp,
}

/// Idempotent service lifecycle driver over a [`ServiceRuntime`].
pub struct ServiceController<'a, R> {
    runtime: &'a R,
}

impl<'a, R: ServiceRuntime> ServiceController<'a, R> {
    pub fn new(runtime: &'a R) -> Self {
        Self { runtime }
    }

    /// Start a service. Starting an already-running service is a no-op.
    /// Refuses up front if a declared dependency is not in the healthy set.
    pub async fn start(
        &self,
        service: &ServiceDescriptor,
        healthy: &HashSet<ServiceName>,
    ) -> Result<ControlOutcome, StartError> {
        for dep in &service.depends_on {
            if !healthy.contains(dep) {
                return Err(StartError::DependencyNotSatisfied {
                    service: service.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        let container = service.container_name();
        match self.runtime.state(container).await {
            Ok(ServiceState::Missing) => {
                return Err(StartError::MissingArtifact(service.name.clone()));
            }
            Ok(state) if state.is_running() => {
                tracing::debug!(service = %service.name, "already running, start is a no-op");
                return Ok(ControlOutcome::NoOp);
            }
            Ok(_) => {}
            Err(e) => {
                return Err(StartError::Runtime {
                    service: service.name.clone(),
                    source: e,
                });
            }
        }

        match self.runtime.start(container).await {
            Ok(()) => Ok(ControlOutcome::Changed),
            Err(RuntimeError::AlreadyRunning(_)) => Ok(ControlOutcome::NoOp),
            Err(RuntimeError::NotFound(_)) => {
                Err(StartError::MissingArtifact(service.name.clone()))
            }
            Err(RuntimeError::PortConflict(detail)) => Err(StartError::PortConflict {
                service: service.name.clone(),
                detail,
            }),
            Err(e) => Err(StartError::Runtime {
                service: service.name.clone(),
                source: e,
            }),
        }
    }

    /// Stop a service. Stopping an already-stopped or absent service is a
    /// no-op.
    pub async fn stop(&self, service: &ServiceDescriptor) -> Result<ControlOutcome, StopError> {
        let container = service.container_name();
        match self.runtime.state(container).await {
            Ok(ServiceState::Missing) | Ok(ServiceState::Exited) | Ok(ServiceState::Created) => {
                tracing::debug!(service = %service.name, "not running, stop is a no-op");
                return Ok(ControlOutcome::NoOp);
            }
            Ok(_) => {}
            Err(e) => {
                return Err(StopError::Runtime {
                    service: service.name.clone(),
                    source: e,
                });
            }
        }

        match self.runtime.stop(container, service.stop_timeout).await {
            Ok(()) => Ok(ControlOutcome::Changed),
            Err(RuntimeError::NotRunning(_)) | Err(RuntimeError::NotFound(_)) => {
                Ok(ControlOutcome::NoOp)
            }
            Err(e) => Err(StopError::Runtime {
                service: service.name.clone(),
                source: e,
            }),
        }
    }

    /// Restart a service regardless of current state. Missing artifacts are
    /// still classified, everything else is delegated to the runtime.
    pub async fn restart(
        &self,
        service: &ServiceDescriptor,
        healthy: &HashSet<ServiceName>,
    ) -> Result<ControlOutcome, StartError> {
        for dep in &service.depends_on {
            if !healthy.contains(dep) {
                return Err(StartError::DependencyNotSatisfied {
                    service: service.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        let container = service.container_name();
        match self.runtime.restart(container, service.stop_timeout).await {
            Ok(()) => Ok(ControlOutcome::Changed),
            Err(RuntimeError::NotFound(_)) => {
                Err(StartError::MissingArtifact(service.name.clone()))
            }
            Err(RuntimeError::PortConflict(detail)) => Err(StartError::PortConflict {
                service: service.name.clone(),
                detail,
            }),
            Err(e) => Err(StartError::Runtime {
                service: service.name.clone(),
                source: e,
            }),
        }
    }
}
