// ABOUTME: Integration tests for the append-only audit log.
// ABOUTME: Sequence monotonicity, reopening, and incomplete-run detection.

use klimaka::audit::{AuditEvent, AuditLog};
use klimaka::run::RunStatus;
use klimaka::types::{BackupId, RunId};

fn status_event(from: RunStatus, to: RunStatus) -> AuditEvent {
    AuditEvent::StatusChanged {
        from,
        to,
        phase: None,
    }
}

#[test]
fn sequence_numbers_are_monotonic_across_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("audit.log");
    let run = RunId::new("run-a");

    {
        let log = AuditLog::open(&path).unwrap();
        assert_eq!(
            log.append(&run, status_event(RunStatus::Idle, RunStatus::Preflight))
                .unwrap(),
            0
        );
        assert_eq!(
            log.append(
                &run,
                AuditEvent::PhaseStarted {
                    phase: "infra".to_string(),
                    index: 0,
                    required: true,
                },
            )
            .unwrap(),
            1
        );
    }

    // A new process picks up where the last one stopped.
    let log = AuditLog::open(&path).unwrap();
    assert_eq!(
        log.append(&run, status_event(RunStatus::Preflight, RunStatus::Failed))
            .unwrap(),
        2
    );

    let records = log.records().unwrap();
    let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![0, 1, 2]);
}

#[test]
fn incomplete_run_is_detected_until_a_terminal_status() {
    let tmp = tempfile::tempdir().unwrap();
    let log = AuditLog::open(&tmp.path().join("audit.log")).unwrap();
    let run = RunId::new("run-b");

    assert!(log.incomplete_run().unwrap().is_none(), "empty log");

    log.append(&run, status_event(RunStatus::Idle, RunStatus::Preflight))
        .unwrap();
    log.append(&run, status_event(RunStatus::Preflight, RunStatus::BackingUp))
        .unwrap();

    let incomplete = log.incomplete_run().unwrap().expect("run is mid-flight");
    assert_eq!(incomplete.run, run);
    assert_eq!(incomplete.last_status, RunStatus::BackingUp);

    log.append(
        &run,
        status_event(RunStatus::BackingUp, RunStatus::PhaseRunning),
    )
    .unwrap();
    log.append(
        &run,
        status_event(RunStatus::PhaseRunning, RunStatus::RolledBack),
    )
    .unwrap();
    log.append(&run, status_event(RunStatus::RolledBack, RunStatus::Failed))
        .unwrap();

    // Failed is terminal: the run ended, however badly.
    assert!(log.incomplete_run().unwrap().is_none());
}

#[test]
fn summaries_track_phase_and_backup_references() {
    let tmp = tempfile::tempdir().unwrap();
    let log = AuditLog::open(&tmp.path().join("audit.log")).unwrap();

    let first = RunId::new("run-1");
    log.append(&first, status_event(RunStatus::Idle, RunStatus::Preflight))
        .unwrap();
    log.append(&first, status_event(RunStatus::Preflight, RunStatus::Completed))
        .unwrap();

    let second = RunId::new("run-2");
    log.append(&second, status_event(RunStatus::Idle, RunStatus::Preflight))
        .unwrap();
    log.append(
        &second,
        AuditEvent::BackupCreated {
            backup: BackupId::new("20260805T101500000"),
        },
    )
    .unwrap();
    log.append(
        &second,
        AuditEvent::PhaseStarted {
            phase: "core".to_string(),
            index: 1,
            required: true,
        },
    )
    .unwrap();

    let summaries = log.run_summaries().unwrap();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].run, first);
    assert!(!summaries[0].is_incomplete());

    let last = log.last_run().unwrap().unwrap();
    assert_eq!(last.run, second);
    assert!(last.is_incomplete());
    assert_eq!(last.last_phase.as_deref(), Some("core"));
    assert_eq!(
        last.backup,
        Some(BackupId::new("20260805T101500000"))
    );
}

#[test]
fn health_outcomes_keep_attempt_context() {
    let tmp = tempfile::tempdir().unwrap();
    let log = AuditLog::open(&tmp.path().join("audit.log")).unwrap();
    let run = RunId::new("run-c");

    log.append(
        &run,
        AuditEvent::HealthObserved {
            service: "api".to_string(),
            status: klimaka::health::HealthStatus::TimedOut,
            attempts: 45,
            elapsed_ms: 90_000,
        },
    )
    .unwrap();

    let records = log.records().unwrap();
    match &records[0].event {
        AuditEvent::HealthObserved {
            service,
            attempts,
            elapsed_ms,
            ..
        } => {
            assert_eq!(service, "api");
            assert_eq!(*attempts, 45);
            assert_eq!(*elapsed_ms, 90_000);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}
