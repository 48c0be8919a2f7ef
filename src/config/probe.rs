// ABOUTME: Health probe configuration for a service.
// ABOUTME: HTTP GET against a well-known path; 2xx is the only healthy signal.

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProbeConfig {
    pub port: u16,

    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_path() -> String {
    "/health".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}
