// ABOUTME: Entry point for the klimaka CLI application.
// ABOUTME: Parses arguments and dispatches to appropriate command handlers.

mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use klimaka::audit::AuditLog;
use klimaka::config::Config;
use klimaka::error::Result;
use klimaka::health::{HealthStatus, HttpProbe};
use klimaka::output::{Output, OutputMode};
use klimaka::run::{DeployError, Orchestrator};
use klimaka::runtime::BollardRuntime;
use klimaka::types::BackupId;
use std::env;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing subscriber based on verbose flag
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let mode = if cli.json {
        OutputMode::Json
    } else if cli.quiet {
        OutputMode::Quiet
    } else {
        OutputMode::Normal
    };
    let mut output = Output::new(mode);

    if let Err(e) = run(cli, &mut output).await {
        output.error(&e.to_string());
        std::process::exit(1);
    }
}

async fn run(cli: Cli, output: &mut Output) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => {
            let cwd = env::current_dir()?;
            Config::discover(&cwd)?
        }
    };

    let runtime = BollardRuntime::connect(config.runtime.socket.as_deref())?;
    let probe = HttpProbe::new(&runtime)?;
    let audit = AuditLog::open(&config.audit_path())?;

    // Cancellation is cooperative: the interrupt only flips the token, and
    // the orchestrator rolls back at the next poll boundary before exiting.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, rolling back before exit");
                cancel.cancel();
            }
        });
    }

    let mut orchestrator = Orchestrator::new(&config, &runtime, &probe, &audit, cancel);

    match cli.command {
        Commands::Deploy { force } => {
            output.start_timer();
            output.progress(&format!(
                "Deploying {} phase(s) from {}",
                config.phases.len(),
                config
                    .source
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "inline config".to_string())
            ));

            let outcome = orchestrator.deploy(force).await?;
            for warning in &outcome.warnings {
                output.warning(&warning.message);
            }
            if outcome.no_op {
                output.success("Already deployed and healthy, nothing to do");
            } else {
                output.success(&format!("Deployment {} complete", outcome.run_id));
            }
            Ok(())
        }
        Commands::Rollback { backup_id } => {
            output.start_timer();
            let id = BackupId::new(backup_id);
            output.progress(&format!("Restoring backup {}", id));
            orchestrator.manual_rollback(&id).await?;
            output.success("Rollback complete");
            Ok(())
        }
        Commands::HealthCheck => {
            let results = orchestrator.health_sweep().await;
            let mut failures = Vec::new();
            for result in &results {
                let healthy = result.status == HealthStatus::Healthy;
                output.progress(&format!(
                    "  {} {}: {}",
                    if healthy { "✓" } else { "✗" },
                    result.service,
                    result.status
                ));
                if !healthy {
                    failures.push(format!("{} {}", result.service, result.status));
                }
            }

            if failures.is_empty() {
                output.success(&format!("All {} service(s) healthy", results.len()));
                Ok(())
            } else {
                Err(DeployError::VerifyFailed {
                    failures: failures.join(", "),
                }
                .into())
            }
        }
        Commands::Status => {
            match audit.last_run()? {
                None => output.success("No runs recorded"),
                Some(run) => {
                    let hint = if run.is_incomplete() {
                        " (incomplete: rollback or deploy --force)"
                    } else {
                        ""
                    };
                    output.success(&format!("Run {}: {}{}", run.run, run.last_status, hint));
                    if let Some(phase) = &run.last_phase {
                        output.progress(&format!("  last phase: {}", phase));
                    }
                    if let Some(backup) = &run.backup {
                        output.progress(&format!("  backup: {}", backup));
                    }
                }
            }
            Ok(())
        }
        Commands::Cleanup => {
            output.start_timer();
            let pruned = orchestrator.cleanup()?;
            output.success(&format!("Pruned {} snapshot(s)", pruned.len()));
            Ok(())
        }
    }
}
