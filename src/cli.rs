// ABOUTME: Command-line interface definition using clap derive macros.
// ABOUTME: Defines all subcommands and their arguments.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "klimaka")]
#[command(about = "Phased deployment orchestrator with health gates and rollback")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the configuration file (default: discover klimaka.yml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Minimal output for CI
    #[arg(short, long, global = true, conflicts_with = "json")]
    pub quiet: bool,

    /// JSON lines output for scripting
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Deploy the plan phase by phase, rolling back on failure
    Deploy {
        /// Proceed even if a prior run was left incomplete
        #[arg(long)]
        force: bool,
    },

    /// Restore a snapshot and restart the data-serving phase
    Rollback {
        /// Id of the backup to restore
        backup_id: String,
    },

    /// One-shot health sweep across every service in the plan
    HealthCheck,

    /// Show the most recent run recorded in the audit log
    Status,

    /// Prune old snapshots and break stale locks
    Cleanup,
}
