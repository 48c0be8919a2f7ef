// ABOUTME: Bollard-based container runtime implementation.
// ABOUTME: Supports both Docker and Podman via the Docker-compatible API.

use super::traits::{ExecOutput, RuntimeError, ServiceRuntime, ServiceState};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::query_parameters::{
    InspectContainerOptions, RestartContainerOptions, StartContainerOptions, StopContainerOptions,
};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

// =============================================================================
// Error Mapping Helpers
// =============================================================================

fn map_start_error(e: bollard::errors::Error, container: &str) -> RuntimeError {
    match &e {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message: _,
        } if *status_code == 404 => RuntimeError::NotFound(container.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message: _,
        } if *status_code == 304 => RuntimeError::AlreadyRunning(container.to_string()),
        bollard::errors::Error::DockerResponseServerError { message, .. }
            if is_port_conflict(message) =>
        {
            RuntimeError::PortConflict(message.clone())
        }
        _ => RuntimeError::Api(e.to_string()),
    }
}

fn map_stop_error(e: bollard::errors::Error, container: &str) -> RuntimeError {
    match &e {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message: _,
        } if *status_code == 404 => RuntimeError::NotFound(container.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message: _,
        } if *status_code == 304 => RuntimeError::NotRunning(container.to_string()),
        _ => RuntimeError::Api(e.to_string()),
    }
}

fn map_exec_error(e: bollard::errors::Error, container: &str) -> RuntimeError {
    match &e {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message: _,
        } if *status_code == 404 => RuntimeError::NotFound(container.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } if *status_code == 409 => RuntimeError::NotRunning(message.clone()),
        _ => RuntimeError::Exec(e.to_string()),
    }
}

fn is_port_conflict(message: &str) -> bool {
    let m = message.to_lowercase();
    m.contains("port is already allocated") || m.contains("address already in use")
}

// =============================================================================
// BollardRuntime
// =============================================================================

/// Container runtime client over the local Docker/Podman socket.
pub struct BollardRuntime {
    client: Docker,
}

impl BollardRuntime {
    /// Connect to the runtime, using the given socket path or the platform
    /// default when none is configured.
    pub fn connect(socket: Option<&str>) -> Result<Self, RuntimeError> {
        let client = match socket {
            Some(path) => Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| RuntimeError::Unreachable(e.to_string()))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl ServiceRuntime for BollardRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.client
            .ping()
            .await
            .map_err(|e| RuntimeError::Unreachable(e.to_string()))?;
        Ok(())
    }

    async fn state(&self, container: &str) -> Result<ServiceState, RuntimeError> {
        let details = match self
            .client
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => details,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(ServiceState::Missing),
            Err(e) => return Err(RuntimeError::Api(e.to_string())),
        };

        let state = details
            .state
            .as_ref()
            .and_then(|s| s.status)
            .map(|s| match s {
                bollard::models::ContainerStateStatusEnum::CREATED => ServiceState::Created,
                bollard::models::ContainerStateStatusEnum::RUNNING => ServiceState::Running,
                bollard::models::ContainerStateStatusEnum::PAUSED => ServiceState::Paused,
                bollard::models::ContainerStateStatusEnum::RESTARTING => ServiceState::Restarting,
                _ => ServiceState::Exited,
            })
            .unwrap_or(ServiceState::Exited);

        Ok(state)
    }

    async fn start(&self, container: &str) -> Result<(), RuntimeError> {
        self.client
            .start_container(container, None::<StartContainerOptions>)
            .await
            .map_err(|e| map_start_error(e, container))
    }

    async fn stop(
        &self,
        container: &str,
        timeout: std::time::Duration,
    ) -> Result<(), RuntimeError> {
        let opts = StopContainerOptions {
            t: Some(timeout.as_secs() as i32),
            signal: None,
        };

        self.client
            .stop_container(container, Some(opts))
            .await
            .map_err(|e| map_stop_error(e, container))
    }

    async fn restart(
        &self,
        container: &str,
        timeout: std::time::Duration,
    ) -> Result<(), RuntimeError> {
        let opts = RestartContainerOptions {
            t: Some(timeout.as_secs() as i32),
            ..Default::default()
        };

        self.client
            .restart_container(container, Some(opts))
            .await
            .map_err(|e| map_start_error(e, container))
    }

    async fn exec(
        &self,
        container: &str,
        cmd: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, RuntimeError> {
        let create = CreateExecOptions {
            cmd: Some(cmd.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            attach_stdin: Some(stdin.is_some()),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(container, create)
            .await
            .map_err(|e| map_exec_error(e, container))?;

        let started = self
            .client
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(|e| map_exec_error(e, container))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match started {
            StartExecResults::Attached { mut output, mut input } => {
                if let Some(data) = stdin {
                    input
                        .write_all(data)
                        .await
                        .map_err(|e| RuntimeError::Exec(format!("stdin write failed: {}", e)))?;
                    input
                        .shutdown()
                        .await
                        .map_err(|e| RuntimeError::Exec(format!("stdin close failed: {}", e)))?;
                }

                while let Some(chunk) = output.next().await {
                    match chunk.map_err(|e| RuntimeError::Exec(e.to_string()))? {
                        LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                        LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                        LogOutput::Console { message } => stdout.extend_from_slice(&message),
                        LogOutput::StdIn { .. } => {}
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| map_exec_error(e, container))?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(0),
            stdout,
            stderr,
        })
    }
}
