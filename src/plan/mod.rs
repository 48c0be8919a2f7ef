// ABOUTME: Deployment plan model: ordered phases of service descriptors.
// ABOUTME: Validates name uniqueness and dependency ordering at load time.

use crate::config::{BackoffPolicy, ProbeConfig, RestartPolicy};
use crate::types::ServiceName;
use nonempty::NonEmpty;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("service '{0}' is declared more than once")]
    DuplicateService(ServiceName),

    #[error("service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency {
        service: ServiceName,
        dependency: ServiceName,
    },

    #[error("service '{service}' depends on '{dependency}', which is declared in a later phase")]
    ForwardDependency {
        service: ServiceName,
        dependency: ServiceName,
    },

    #[error("service '{0}' depends on itself")]
    SelfDependency(ServiceName),

    #[error("phase '{0}' must declare max_attempts of at least 1")]
    NoAttempts(String),
}

/// An ordered, non-empty sequence of phases. Phase order is fixed for the
/// lifetime of the plan; later phases never run before an earlier required
/// phase reports healthy.
#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    phases: NonEmpty<Phase>,
}

impl<'de> serde::Deserialize<'de> for DeploymentPlan {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let phases = deserialize_phases(deserializer)?;
        Ok(Self { phases })
    }
}

impl DeploymentPlan {
    pub fn phases(&self) -> impl Iterator<Item = &Phase> {
        self.phases.iter()
    }

    pub fn phase(&self, index: usize) -> Option<&Phase> {
        self.phases.iter().nth(index)
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// All services in plan order.
    pub fn services(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.phases.iter().flat_map(|p| p.services.iter())
    }

    pub fn service(&self, name: &ServiceName) -> Option<&ServiceDescriptor> {
        self.services().find(|s| &s.name == name)
    }

    /// Index of the phase that declares the given service.
    pub fn phase_index_of(&self, name: &ServiceName) -> Option<usize> {
        self.phases
            .iter()
            .position(|p| p.services.iter().any(|s| &s.name == name))
    }

    /// Check structural invariants: unique service names, dependencies that
    /// exist, no self or forward dependencies, sane attempt budgets.
    pub fn validate(&self) -> Result<(), PlanError> {
        let mut seen = HashSet::new();
        for service in self.services() {
            if !seen.insert(service.name.clone()) {
                return Err(PlanError::DuplicateService(service.name.clone()));
            }
        }

        for phase in self.phases() {
            if phase.max_attempts == 0 {
                return Err(PlanError::NoAttempts(phase.name.clone()));
            }
        }

        for (index, phase) in self.phases.iter().enumerate() {
            for service in phase.services.iter() {
                for dep in &service.depends_on {
                    if dep == &service.name {
                        return Err(PlanError::SelfDependency(service.name.clone()));
                    }
                    match self.phase_index_of(dep) {
                        None => {
                            return Err(PlanError::UnknownDependency {
                                service: service.name.clone(),
                                dependency: dep.clone(),
                            });
                        }
                        Some(dep_index) if dep_index > index => {
                            return Err(PlanError::ForwardDependency {
                                service: service.name.clone(),
                                dependency: dep.clone(),
                            });
                        }
                        Some(_) => {}
                    }
                }
            }
        }

        Ok(())
    }
}

/// A named group of services deployed and health-verified together.
#[derive(Debug, Clone, Deserialize)]
pub struct Phase {
    pub name: String,

    /// A required phase gates progression; an optional one only warns.
    #[serde(default = "default_required")]
    pub required: bool,

    #[serde(deserialize_with = "deserialize_services")]
    pub services: NonEmpty<ServiceDescriptor>,

    #[serde(default)]
    pub backoff: BackoffPolicy,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Phase {
    /// Upper bound on this phase's health wait, excluding probe time.
    pub fn health_budget(&self) -> Duration {
        self.backoff.budget(self.max_attempts)
    }

    pub fn service_names(&self) -> impl Iterator<Item = &ServiceName> {
        self.services.iter().map(|s| &s.name)
    }
}

fn default_required() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    30
}

/// A single deployable service and how to reach its health signal.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceDescriptor {
    pub name: ServiceName,

    /// Container name, defaulting to the service name.
    #[serde(default)]
    container: Option<String>,

    pub probe: ProbeConfig,

    #[serde(default)]
    pub depends_on: Vec<ServiceName>,

    #[serde(default)]
    pub restart: RestartPolicy,

    /// Environment variable holding this service's base URL. When set, probes
    /// go to `$VAR + path` instead of localhost, and preflight requires the
    /// variable to be present.
    #[serde(default)]
    pub base_url_env: Option<String>,

    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,
}

impl ServiceDescriptor {
    pub fn container_name(&self) -> &str {
        self.container.as_deref().unwrap_or_else(|| self.name.as_str())
    }
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(30)
}

fn deserialize_phases<'de, D>(deserializer: D) -> Result<NonEmpty<Phase>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let phases: Vec<Phase> = Vec::deserialize(deserializer)?;
    NonEmpty::from_vec(phases)
        .ok_or_else(|| serde::de::Error::custom("plan must declare at least one phase"))
}

fn deserialize_services<'de, D>(deserializer: D) -> Result<NonEmpty<ServiceDescriptor>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let services: Vec<ServiceDescriptor> = Vec::deserialize(deserializer)?;
    NonEmpty::from_vec(services)
        .ok_or_else(|| serde::de::Error::custom("phase must declare at least one service"))
}
