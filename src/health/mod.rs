// ABOUTME: Health checking: per-service polling and phase-level gated waits.
// ABOUTME: Concurrent within a phase, fail-fast, cancellation-aware.

mod http;

pub use http::HttpProbe;

use crate::config::BackoffPolicy;
use crate::plan::{Phase, ServiceDescriptor};
use crate::types::ServiceName;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Terminal and in-flight health states of a single service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Not yet determined (still polling, or the wait was cancelled).
    Pending,
    Healthy,
    /// The service signalled a terminal failure, e.g. its process exited.
    Unhealthy,
    /// The attempt budget ran out without a healthy signal.
    TimedOut,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Pending => "pending",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::TimedOut => "timed-out",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one health wait for one service.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub service: ServiceName,
    pub status: HealthStatus,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// A single observation of a service's health signal.
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    Ready,
    NotReady(String),
    /// No amount of further polling can succeed.
    Terminal(String),
}

/// One health observation of one service.
///
/// Implementations decide what "the health signal" is; the checker only
/// supplies pacing, budgets, and fail-fast semantics.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self, service: &ServiceDescriptor) -> ProbeOutcome;
}

/// Result of waiting on a whole phase.
#[derive(Debug, Clone)]
pub struct PhaseHealth {
    pub results: Vec<HealthCheckResult>,
}

impl PhaseHealth {
    /// The phase gate passes only if every service reached Healthy.
    pub fn passed(&self) -> bool {
        self.results
            .iter()
            .all(|r| r.status == HealthStatus::Healthy)
    }

    pub fn failures(&self) -> impl Iterator<Item = &HealthCheckResult> {
        self.results
            .iter()
            .filter(|r| r.status != HealthStatus::Healthy)
    }
}

pub struct HealthChecker<'a, P> {
    probe: &'a P,
}

impl<'a, P: Probe> HealthChecker<'a, P> {
    pub fn new(probe: &'a P) -> Self {
        Self { probe }
    }

    /// Poll one service until it is healthy, terminally unhealthy, the
    /// attempt budget is exhausted, or the wait is cancelled.
    ///
    /// The wait is bounded by `backoff.budget(max_attempts)` plus probe time;
    /// there is no unbounded polling path.
    pub async fn wait_service(
        &self,
        service: &ServiceDescriptor,
        backoff: BackoffPolicy,
        max_attempts: u32,
        cancel: &CancellationToken,
    ) -> HealthCheckResult {
        let started = tokio::time::Instant::now();
        let mut attempts = 0;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                break;
            }
            attempts = attempt;

            match self.probe.check(service).await {
                ProbeOutcome::Ready => {
                    return HealthCheckResult {
                        service: service.name.clone(),
                        status: HealthStatus::Healthy,
                        attempts,
                        elapsed: started.elapsed(),
                    };
                }
                ProbeOutcome::Terminal(reason) => {
                    tracing::warn!(service = %service.name, %reason, "terminal health failure");
                    return HealthCheckResult {
                        service: service.name.clone(),
                        status: HealthStatus::Unhealthy,
                        attempts,
                        elapsed: started.elapsed(),
                    };
                }
                ProbeOutcome::NotReady(reason) => {
                    tracing::debug!(service = %service.name, %reason, attempt, "not ready");
                }
            }

            if attempt < max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff.delay(attempt)) => {}
                }
            }
        }

        let status = if cancel.is_cancelled() && attempts < max_attempts {
            HealthStatus::Pending
        } else {
            HealthStatus::TimedOut
        };

        HealthCheckResult {
            service: service.name.clone(),
            status,
            attempts,
            elapsed: started.elapsed(),
        }
    }

    /// Wait for every service in a phase, polling concurrently.
    ///
    /// The first non-healthy result cancels the remaining waits at their next
    /// poll boundary; the returned results still carry the last observed
    /// state of every service in the phase.
    pub async fn wait_phase(&self, phase: &Phase, cancel: &CancellationToken) -> PhaseHealth {
        let phase_cancel = cancel.child_token();

        let mut waits: FuturesUnordered<_> = phase
            .services
            .iter()
            .map(|service| {
                let phase_cancel = phase_cancel.clone();
                async move {
                    self.wait_service(service, phase.backoff, phase.max_attempts, &phase_cancel)
                        .await
                }
            })
            .collect();

        let mut results = Vec::with_capacity(phase.services.len());
        while let Some(result) = waits.next().await {
            if result.status != HealthStatus::Healthy {
                phase_cancel.cancel();
            }
            results.push(result);
        }

        // Keep plan order for reporting regardless of completion order.
        results.sort_by_key(|r| {
            phase
                .services
                .iter()
                .position(|s| s.name == r.service)
                .unwrap_or(usize::MAX)
        });

        PhaseHealth { results }
    }

    /// One-shot sweep: probe each service once, concurrently.
    pub async fn sweep(&self, services: &[&ServiceDescriptor]) -> Vec<HealthCheckResult> {
        let mut checks: FuturesUnordered<_> = services
            .iter()
            .map(|service| async move {
                let started = tokio::time::Instant::now();
                let status = match self.probe.check(service).await {
                    ProbeOutcome::Ready => HealthStatus::Healthy,
                    ProbeOutcome::Terminal(_) => HealthStatus::Unhealthy,
                    ProbeOutcome::NotReady(_) => HealthStatus::TimedOut,
                };
                HealthCheckResult {
                    service: service.name.clone(),
                    status,
                    attempts: 1,
                    elapsed: started.elapsed(),
                }
            })
            .collect();

        let mut results = Vec::with_capacity(services.len());
        while let Some(result) = checks.next().await {
            results.push(result);
        }
        results.sort_by_key(|r| {
            services
                .iter()
                .position(|s| s.name == r.service)
                .unwrap_or(usize::MAX)
        });
        results
    }
}
