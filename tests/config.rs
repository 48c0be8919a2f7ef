// ABOUTME: Integration tests for configuration parsing and plan validation.
// ABOUTME: Tests YAML parsing, defaults, and structural invariants.

use klimaka::config::{BackoffPolicy, Config};
use klimaka::error::Error;
use klimaka::plan::PlanError;
use std::time::Duration;

const MINIMAL: &str = r#"
phases:
  - name: infra
    services:
      - name: postgres
        probe:
          port: 5433
datastore:
  service: postgres
  dump: [pg_dump, appdb]
  restore: [psql, appdb]
"#;

mod parsing {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.phases.len(), 1);

        let phase = config.phases.phases().next().unwrap();
        assert!(phase.required, "phases are required by default");
        assert_eq!(phase.max_attempts, 30);
        assert_eq!(
            phase.backoff,
            BackoffPolicy::Fixed {
                interval: Duration::from_secs(2)
            }
        );

        let service = phase.services.first();
        assert_eq!(service.name.as_str(), "postgres");
        assert_eq!(service.container_name(), "postgres");
        assert_eq!(service.probe.path, "/health");
        assert_eq!(config.datastore.connection_env, "DATABASE_URL");
    }

    #[test]
    fn parse_full_config() {
        let yaml = r#"
state_dir: /var/lib/acme
phases:
  - name: infra
    required: true
    max_attempts: 60
    backoff:
      strategy: exponential
      initial: 1s
      cap: 10s
    services:
      - name: postgres
        container: acme-postgres
        probe:
          port: 5433
          path: /ready
          timeout: 2s
        restart: on-failure:3
        stop_timeout: 10s
  - name: edge
    required: false
    services:
      - name: gateway
        probe:
          port: 443
        depends_on: [postgres]
        base_url_env: GATEWAY_URL
datastore:
  service: postgres
  dump: [pg_dump, -U, acme, acmedb]
  restore: [psql, -U, acme, acmedb]
  connection_env: ACME_DATABASE_URL
backups:
  retain_count: 3
  retain_age: 7d
  lock_wait: 10s
environment:
  required: [ACME_SECRET]
preflight:
  min_free_disk: "2g"
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.state_dir.to_str(), Some("/var/lib/acme"));
        assert_eq!(config.backups.retain_count, 3);
        assert_eq!(config.backups.lock_wait, Duration::from_secs(10));
        assert_eq!(config.preflight.min_free_disk, 2 * 1024 * 1024 * 1024);

        let infra = config.phases.phases().next().unwrap();
        assert_eq!(
            infra.backoff,
            BackoffPolicy::Exponential {
                initial: Duration::from_secs(1),
                cap: Duration::from_secs(10),
            }
        );
        // 1+2+4+8 then capped at 10 for the remaining 55 gaps.
        assert_eq!(
            infra.health_budget(),
            Duration::from_secs(1 + 2 + 4 + 8 + 55 * 10)
        );

        let postgres = infra.services.first();
        assert_eq!(postgres.container_name(), "acme-postgres");
        assert_eq!(postgres.stop_timeout, Duration::from_secs(10));

        let edge = config.phases.phases().nth(1).unwrap();
        assert!(!edge.required);
        assert_eq!(
            edge.services.first().depends_on[0].as_str(),
            "postgres"
        );
    }

    #[test]
    fn required_env_collects_connection_secret_and_base_urls() {
        let yaml = r#"
phases:
  - name: infra
    services:
      - name: postgres
        probe:
          port: 5433
      - name: api
        probe:
          port: 8080
        base_url_env: API_URL
datastore:
  service: postgres
  dump: [dump]
  restore: [restore]
environment:
  required: [APP_SECRET, DATABASE_URL]
"#;
        let config = Config::from_yaml(yaml).unwrap();
        // DATABASE_URL appears once despite being both the connection string
        // and an explicit requirement.
        assert_eq!(
            config.required_env(),
            vec!["DATABASE_URL", "APP_SECRET", "API_URL"]
        );
    }

    #[test]
    fn state_dir_defaults_under_home() {
        temp_env::with_var("HOME", Some("/home/deployer"), || {
            let config = Config::from_yaml(MINIMAL).unwrap();
            assert_eq!(
                config.state_dir.to_str(),
                Some("/home/deployer/.local/state/klimaka")
            );
            assert_eq!(
                config.audit_path().to_str(),
                Some("/home/deployer/.local/state/klimaka/audit.log")
            );
            assert_eq!(
                config.backups_dir().to_str(),
                Some("/home/deployer/.local/state/klimaka/backups")
            );
        });
    }
}

mod validation {
    use super::*;

    fn plan_error(yaml: &str) -> PlanError {
        match Config::from_yaml(yaml).unwrap_err() {
            Error::Plan(e) => e,
            other => panic!("expected plan error, got: {other}"),
        }
    }

    #[test]
    fn rejects_duplicate_service_names() {
        let yaml = r#"
phases:
  - name: a
    services:
      - name: api
        probe: { port: 1 }
  - name: b
    services:
      - name: api
        probe: { port: 2 }
datastore:
  service: api
  dump: [d]
  restore: [r]
"#;
        assert!(matches!(plan_error(yaml), PlanError::DuplicateService(_)));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let yaml = r#"
phases:
  - name: a
    services:
      - name: api
        probe: { port: 1 }
        depends_on: [ghost]
datastore:
  service: api
  dump: [d]
  restore: [r]
"#;
        assert!(matches!(
            plan_error(yaml),
            PlanError::UnknownDependency { .. }
        ));
    }

    #[test]
    fn rejects_dependency_on_a_later_phase() {
        let yaml = r#"
phases:
  - name: a
    services:
      - name: api
        probe: { port: 1 }
        depends_on: [worker]
  - name: b
    services:
      - name: worker
        probe: { port: 2 }
datastore:
  service: api
  dump: [d]
  restore: [r]
"#;
        assert!(matches!(
            plan_error(yaml),
            PlanError::ForwardDependency { .. }
        ));
    }

    #[test]
    fn rejects_self_dependency() {
        let yaml = r#"
phases:
  - name: a
    services:
      - name: api
        probe: { port: 1 }
        depends_on: [api]
datastore:
  service: api
  dump: [d]
  restore: [r]
"#;
        assert!(matches!(plan_error(yaml), PlanError::SelfDependency(_)));
    }

    #[test]
    fn rejects_zero_attempt_budget() {
        let yaml = r#"
phases:
  - name: a
    max_attempts: 0
    services:
      - name: api
        probe: { port: 1 }
datastore:
  service: api
  dump: [d]
  restore: [r]
"#;
        assert!(matches!(plan_error(yaml), PlanError::NoAttempts(_)));
    }

    #[test]
    fn rejects_empty_plan_and_empty_phase() {
        let empty_plan = r#"
phases: []
datastore:
  service: api
  dump: [d]
  restore: [r]
"#;
        assert!(Config::from_yaml(empty_plan).is_err());

        let empty_phase = r#"
phases:
  - name: a
    services: []
datastore:
  service: api
  dump: [d]
  restore: [r]
"#;
        assert!(Config::from_yaml(empty_phase).is_err());
    }

    #[test]
    fn rejects_datastore_outside_the_plan() {
        let yaml = r#"
phases:
  - name: a
    services:
      - name: api
        probe: { port: 1 }
datastore:
  service: mystery
  dump: [d]
  restore: [r]
"#;
        match Config::from_yaml(yaml).unwrap_err() {
            Error::InvalidConfig(msg) => assert!(msg.contains("mystery")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_invalid_service_names() {
        let yaml = r#"
phases:
  - name: a
    services:
      - name: Not_Valid
        probe: { port: 1 }
datastore:
  service: api
  dump: [d]
  restore: [r]
"#;
        assert!(matches!(Config::from_yaml(yaml), Err(Error::Yaml(_))));
    }
}
