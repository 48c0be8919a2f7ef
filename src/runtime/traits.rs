// ABOUTME: Container runtime trait: the orchestrator's only view of Docker/Podman.
// ABOUTME: Start, stop, restart, inspect state, and exec inside containers.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Observed state of a service's container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// No container with that name exists.
    Missing,
    Created,
    Running,
    Restarting,
    Paused,
    Exited,
}

impl ServiceState {
    pub fn is_running(self) -> bool {
        matches!(self, ServiceState::Running | ServiceState::Restarting)
    }
}

/// Result of running a command inside a container.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Errors from the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container already running: {0}")]
    AlreadyRunning(String),

    #[error("container not running: {0}")]
    NotRunning(String),

    #[error("port conflict: {0}")]
    PortConflict(String),

    #[error("runtime unreachable: {0}")]
    Unreachable(String),

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("runtime error: {0}")]
    Api(String),
}

/// Operations the orchestrator needs from a container runtime.
///
/// Implemented by [`BollardRuntime`](super::BollardRuntime) for Docker and
/// Podman; tests substitute scripted doubles.
#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    /// Cheap reachability check, used during preflight.
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Current state of the named container.
    async fn state(&self, container: &str) -> Result<ServiceState, RuntimeError>;

    async fn start(&self, container: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, container: &str, timeout: Duration) -> Result<(), RuntimeError>;

    async fn restart(&self, container: &str, timeout: Duration) -> Result<(), RuntimeError>;

    /// Run a command inside a running container, optionally feeding stdin,
    /// and collect its output.
    async fn exec(
        &self,
        container: &str,
        cmd: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, RuntimeError>;
}
