// ABOUTME: Integration tests for the health checker.
// ABOUTME: Paused-clock tests pin down budgets and fail-fast behavior.

mod support;

use klimaka::health::{HealthChecker, HealthStatus};
use klimaka::plan::Phase;
use std::time::Duration;
use support::ScriptProbe;
use tokio_util::sync::CancellationToken;

fn phase_yaml(max_attempts: u32, interval: &str, services: &[(&str, u16)]) -> String {
    let mut yaml = format!(
        "name: under-test\nrequired: true\nmax_attempts: {max_attempts}\nbackoff:\n  strategy: fixed\n  interval: {interval}\nservices:\n"
    );
    for (name, port) in services {
        yaml.push_str(&format!("  - name: {name}\n    probe:\n      port: {port}\n"));
    }
    yaml
}

fn parse_phase(yaml: &str) -> Phase {
    serde_yaml::from_str(yaml).expect("phase should parse")
}

#[tokio::test(start_paused = true)]
async fn wait_terminates_exactly_at_the_attempt_budget() {
    let phase = parse_phase(&phase_yaml(5, "2s", &[("slowpoke", 9000)]));
    let probe = ScriptProbe::all_healthy().never_healthy("slowpoke");
    let checker = HealthChecker::new(&probe);

    let service = phase.services.first();
    let result = checker
        .wait_service(
            service,
            phase.backoff,
            phase.max_attempts,
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(result.status, HealthStatus::TimedOut);
    assert_eq!(result.attempts, 5);
    // 5 attempts with 4 sleeps between them; probes themselves take no time
    // under the paused clock, so the elapsed time IS the backoff budget.
    assert_eq!(result.elapsed, Duration::from_secs(8));
    assert_eq!(result.elapsed, phase.health_budget());
}

#[tokio::test(start_paused = true)]
async fn healthy_service_stops_polling_early() {
    let phase = parse_phase(&phase_yaml(30, "2s", &[("warmup", 9000)]));
    let probe = ScriptProbe::all_healthy().healthy_after("warmup", 3);
    let checker = HealthChecker::new(&probe);

    let result = checker
        .wait_service(
            phase.services.first(),
            phase.backoff,
            phase.max_attempts,
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(result.status, HealthStatus::Healthy);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.elapsed, Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn terminal_signal_short_circuits_the_phase() {
    let phase = parse_phase(&phase_yaml(
        1000,
        "1s",
        &[("doomed", 9000), ("slow", 9001)],
    ));
    let probe = ScriptProbe::all_healthy()
        .terminal("doomed")
        .healthy_after("slow", 500);
    let checker = HealthChecker::new(&probe);

    let health = checker.wait_phase(&phase, &CancellationToken::new()).await;
    assert!(!health.passed());

    let doomed = health
        .results
        .iter()
        .find(|r| r.service.as_str() == "doomed")
        .unwrap();
    assert_eq!(doomed.status, HealthStatus::Unhealthy);
    assert_eq!(doomed.attempts, 1);

    // The sibling was cancelled at its next poll boundary instead of running
    // out its 500-observation script; its last observed state is reported.
    let slow = health
        .results
        .iter()
        .find(|r| r.service.as_str() == "slow")
        .unwrap();
    assert_eq!(slow.status, HealthStatus::Pending);
    assert!(slow.attempts < 500);
}

#[tokio::test(start_paused = true)]
async fn phase_passes_only_when_all_services_are_healthy() {
    let phase = parse_phase(&phase_yaml(10, "1s", &[("a", 9000), ("b", 9001)]));
    let probe = ScriptProbe::all_healthy()
        .healthy_after("a", 2)
        .healthy_after("b", 7);
    let checker = HealthChecker::new(&probe);

    let health = checker.wait_phase(&phase, &CancellationToken::new()).await;
    assert!(health.passed());
    assert!(health.failures().next().is_none());
}

#[tokio::test(start_paused = true)]
async fn sweep_reports_every_service_once() {
    let phase = parse_phase(&phase_yaml(10, "1s", &[("up", 9000), ("down", 9001)]));
    let probe = ScriptProbe::all_healthy().never_healthy("down");
    let checker = HealthChecker::new(&probe);

    let services: Vec<_> = phase.services.iter().collect();
    let results = checker.sweep(&services).await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].service.as_str(), "up");
    assert_eq!(results[0].status, HealthStatus::Healthy);
    assert_eq!(results[1].status, HealthStatus::TimedOut);
    assert_eq!(probe.observations("up"), 1);
    assert_eq!(probe.observations("down"), 1);
}
