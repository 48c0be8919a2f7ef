// ABOUTME: Container runtime abstraction and its bollard implementation.
// ABOUTME: The trait seam keeps the orchestrator testable without a daemon.

mod bollard;
mod controller;
mod traits;

pub use self::bollard::BollardRuntime;
pub use controller::{ControlOutcome, ServiceController, StartError, StopError};
pub use traits::{ExecOutput, RuntimeError, ServiceRuntime, ServiceState};
