// ABOUTME: HTTP health probe backed by reqwest, with container-state awareness.
// ABOUTME: 2xx from the well-known path is the only healthy signal.

use super::{Probe, ProbeOutcome};
use crate::plan::ServiceDescriptor;
use crate::runtime::{ServiceRuntime, ServiceState};
use async_trait::async_trait;

/// Probes a service's health endpoint over HTTP.
///
/// Before each request the container state is inspected: an exited or missing
/// container is a terminal failure, not something further polling can fix.
pub struct HttpProbe<'a, R> {
    runtime: &'a R,
    client: reqwest::Client,
}

impl<'a, R> HttpProbe<'a, R> {
    pub fn new(runtime: &'a R) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { runtime, client })
    }

    fn url_for(service: &ServiceDescriptor) -> String {
        let path = &service.probe.path;
        if let Some(var) = &service.base_url_env
            && let Ok(base) = std::env::var(var)
        {
            return format!("{}{}", base.trim_end_matches('/'), path);
        }
        format!("http://127.0.0.1:{}{}", service.probe.port, path)
    }
}

#[async_trait]
impl<R: ServiceRuntime> Probe for HttpProbe<'_, R> {
    async fn check(&self, service: &ServiceDescriptor) -> ProbeOutcome {
        match self.runtime.state(service.container_name()).await {
            Ok(ServiceState::Exited) => {
                return ProbeOutcome::Terminal("container exited".to_string());
            }
            Ok(ServiceState::Missing) => {
                return ProbeOutcome::Terminal("container missing".to_string());
            }
            Ok(_) => {}
            Err(e) => return ProbeOutcome::NotReady(format!("state inspect failed: {}", e)),
        }

        let url = Self::url_for(service);
        match self
            .client
            .get(&url)
            .timeout(service.probe.timeout)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => ProbeOutcome::Ready,
            Ok(resp) => ProbeOutcome::NotReady(format!("{} returned {}", url, resp.status())),
            Err(e) => ProbeOutcome::NotReady(format!("{} unreachable: {}", url, e)),
        }
    }
}
