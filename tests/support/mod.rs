// ABOUTME: Shared test support: scripted runtime and probe doubles.
// ABOUTME: Lets orchestration tests run without a container daemon.

#![allow(dead_code)]

use async_trait::async_trait;
use klimaka::config::Config;
use klimaka::health::{Probe, ProbeOutcome};
use klimaka::plan::ServiceDescriptor;
use klimaka::runtime::{ExecOutput, RuntimeError, ServiceRuntime, ServiceState};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// In-memory container runtime with an operation log.
///
/// Containers must be seeded before they can be started; starting an unknown
/// name reports `NotFound` just like the real runtime.
pub struct FakeRuntime {
    state: Mutex<HashMap<String, ServiceState>>,
    /// Mutating operations in invocation order, e.g. "start postgres".
    pub ops: Mutex<Vec<String>>,
    /// Bytes the dump command emits on stdout.
    pub dump_output: Mutex<Vec<u8>>,
    /// Stdin payloads passed to the restore command.
    pub restored: Mutex<Vec<Vec<u8>>>,
    fail_dump: Mutex<bool>,
    fail_ping: Mutex<bool>,
    port_conflicts: Mutex<HashSet<String>>,
}

impl FakeRuntime {
    /// Seed the runtime with stopped containers for the given names.
    pub fn with_services(names: &[&str]) -> Self {
        let state = names
            .iter()
            .map(|n| (n.to_string(), ServiceState::Exited))
            .collect();
        Self {
            state: Mutex::new(state),
            ops: Mutex::new(Vec::new()),
            dump_output: Mutex::new(b"snapshot-bytes".to_vec()),
            restored: Mutex::new(Vec::new()),
            fail_dump: Mutex::new(false),
            fail_ping: Mutex::new(false),
            port_conflicts: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_state(&self, container: &str, state: ServiceState) {
        self.state.lock().insert(container.to_string(), state);
    }

    pub fn fail_dump(&self) {
        *self.fail_dump.lock() = true;
    }

    pub fn fail_ping(&self) {
        *self.fail_ping.lock() = true;
    }

    pub fn conflict_on(&self, container: &str) {
        self.port_conflicts.lock().insert(container.to_string());
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }

    fn record(&self, op: String) {
        self.ops.lock().push(op);
    }
}

#[async_trait]
impl ServiceRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        if *self.fail_ping.lock() {
            return Err(RuntimeError::Unreachable("no daemon".to_string()));
        }
        Ok(())
    }

    async fn state(&self, container: &str) -> Result<ServiceState, RuntimeError> {
        Ok(*self
            .state
            .lock()
            .get(container)
            .unwrap_or(&ServiceState::Missing))
    }

    async fn start(&self, container: &str) -> Result<(), RuntimeError> {
        self.record(format!("start {container}"));
        if self.port_conflicts.lock().contains(container) {
            return Err(RuntimeError::PortConflict(format!(
                "bind for {container} failed: port is already allocated"
            )));
        }
        let mut state = self.state.lock();
        match state.get(container) {
            None => Err(RuntimeError::NotFound(container.to_string())),
            Some(ServiceState::Running) => {
                Err(RuntimeError::AlreadyRunning(container.to_string()))
            }
            Some(_) => {
                state.insert(container.to_string(), ServiceState::Running);
                Ok(())
            }
        }
    }

    async fn stop(&self, container: &str, _timeout: Duration) -> Result<(), RuntimeError> {
        self.record(format!("stop {container}"));
        let mut state = self.state.lock();
        match state.get(container) {
            None => Err(RuntimeError::NotFound(container.to_string())),
            Some(ServiceState::Exited) => Err(RuntimeError::NotRunning(container.to_string())),
            Some(_) => {
                state.insert(container.to_string(), ServiceState::Exited);
                Ok(())
            }
        }
    }

    async fn restart(&self, container: &str, _timeout: Duration) -> Result<(), RuntimeError> {
        self.record(format!("restart {container}"));
        let mut state = self.state.lock();
        match state.get(container) {
            None => Err(RuntimeError::NotFound(container.to_string())),
            Some(_) => {
                state.insert(container.to_string(), ServiceState::Running);
                Ok(())
            }
        }
    }

    async fn exec(
        &self,
        container: &str,
        _cmd: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, RuntimeError> {
        self.record(format!("exec {container}"));
        match stdin {
            // Restore: capture the payload.
            Some(data) => {
                self.restored.lock().push(data.to_vec());
                Ok(ExecOutput {
                    exit_code: 0,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                })
            }
            // Dump: emit the scripted snapshot.
            None => {
                if *self.fail_dump.lock() {
                    return Ok(ExecOutput {
                        exit_code: 1,
                        stdout: Vec::new(),
                        stderr: b"dump refused".to_vec(),
                    });
                }
                Ok(ExecOutput {
                    exit_code: 0,
                    stdout: self.dump_output.lock().clone(),
                    stderr: Vec::new(),
                })
            }
        }
    }
}

/// Probe double driven by per-service scripts.
///
/// Each service becomes Ready after a configured number of observations;
/// `never` and `terminal` services stay down.
#[derive(Default)]
pub struct ScriptProbe {
    healthy_after: Mutex<HashMap<String, u32>>,
    terminal: Mutex<HashSet<String>>,
    counts: Mutex<HashMap<String, u32>>,
}

impl ScriptProbe {
    /// Every service is ready on its first observation.
    pub fn all_healthy() -> Self {
        Self::default()
    }

    pub fn healthy_after(self, service: &str, observations: u32) -> Self {
        self.healthy_after
            .lock()
            .insert(service.to_string(), observations);
        self
    }

    pub fn never_healthy(self, service: &str) -> Self {
        self.healthy_after
            .lock()
            .insert(service.to_string(), u32::MAX);
        self
    }

    pub fn terminal(self, service: &str) -> Self {
        self.terminal.lock().insert(service.to_string());
        self
    }

    pub fn observations(&self, service: &str) -> u32 {
        self.counts.lock().get(service).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Probe for ScriptProbe {
    async fn check(&self, service: &ServiceDescriptor) -> ProbeOutcome {
        let name = service.name.to_string();
        if self.terminal.lock().contains(&name) {
            return ProbeOutcome::Terminal("process exited".to_string());
        }

        let count = {
            let mut counts = self.counts.lock();
            let count = counts.entry(name.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let needed = self.healthy_after.lock().get(&name).copied().unwrap_or(1);
        if count >= needed {
            ProbeOutcome::Ready
        } else {
            ProbeOutcome::NotReady(format!("observation {count}/{needed}"))
        }
    }
}

/// Write `yaml` to `dir/klimaka.yml` and load it.
pub fn load_config(dir: &Path, yaml: &str) -> Config {
    let path = dir.join("klimaka.yml");
    std::fs::write(&path, yaml).expect("config should write");
    Config::load(&path).expect("config should parse")
}

/// The three-phase reference plan: required infra and core, optional
/// monitoring. `PATH` stands in for the connection string so preflight
/// passes without touching the environment.
pub fn reference_plan_yaml(state_dir: &Path) -> String {
    format!(
        r#"
state_dir: {state}

phases:
  - name: infra
    required: true
    max_attempts: 30
    backoff:
      strategy: fixed
      interval: 2s
    services:
      - name: postgres
        probe:
          port: 5433
  - name: core
    required: true
    max_attempts: 45
    backoff:
      strategy: fixed
      interval: 2s
    services:
      - name: api
        probe:
          port: 8080
          path: /healthz
        depends_on: [postgres]
  - name: monitoring
    required: false
    max_attempts: 15
    backoff:
      strategy: fixed
      interval: 2s
    services:
      - name: grafana
        probe:
          port: 3000

datastore:
  service: postgres
  dump: [pg_dump, -U, app, appdb]
  restore: [psql, -U, app, appdb]
  connection_env: PATH

preflight:
  min_free_disk: "1k"
"#,
        state = state_dir.display()
    )
}

/// All containers the reference plan expects to exist.
pub fn reference_services() -> Vec<&'static str> {
    vec!["postgres", "api", "grafana"]
}
