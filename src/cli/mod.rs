//! Command-line interface definitions for the `berth` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Top-level CLI for the `berth` binary.
#[derive(Debug, Parser)]
#[command(
    name = "berth",
    about = "Provision a Scaleway VM and deploy a Rust service or static site to it",
    version,
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Path to the project descriptor.
    #[arg(long, short, global = true, default_value = "berth.yaml", value_name = "PATH")]
    pub(crate) config: PathBuf,
    /// Log at debug level unless `BERTH_LOG` says otherwise.
    #[arg(long, short, global = true)]
    pub(crate) verbose: bool,
    /// Action to perform.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of `berth`.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Write a starter descriptor in the current directory.
    Init,
    /// Save Scaleway credentials to berth.toml.
    Auth(AuthCommand),
    /// Create the server, wait for SSH, and bootstrap it.
    Provision(ProvisionCommand),
    /// Re-run the bootstrap steps on the existing server.
    Setup,
    /// Build locally and ship the artifact to the server.
    Deploy,
    /// Show the server and service state.
    Status,
    /// Print or follow the service journal.
    Logs(LogsCommand),
    /// Open an interactive shell on the server.
    Ssh,
    /// Start the service.
    Start,
    /// Stop the service.
    Stop,
    /// Restart the service.
    Restart,
    /// Delete the server.
    Destroy(DestroyCommand),
    /// Render the sidecar compose file locally.
    Compose(ComposeCommand),
}

/// Arguments for `berth auth`.
#[derive(Debug, Parser)]
pub(crate) struct AuthCommand {
    /// Scaleway API secret key.
    #[arg(long, value_name = "KEY")]
    pub(crate) secret_key: String,
    /// Scaleway project identifier.
    #[arg(long, value_name = "ID")]
    pub(crate) project_id: Option<String>,
}

/// Arguments for `berth provision`.
#[derive(Debug, Parser)]
pub(crate) struct ProvisionCommand {
    /// Registered SSH key name or identifier; defaults to the first key.
    #[arg(long, value_name = "NAME")]
    pub(crate) ssh_key: Option<String>,
}

/// Arguments for `berth logs`.
#[derive(Debug, Parser)]
pub(crate) struct LogsCommand {
    /// Keep streaming new entries until interrupted.
    #[arg(long, short)]
    pub(crate) follow: bool,
    /// Number of lines to show.
    #[arg(long, short = 'n', default_value_t = 50)]
    pub(crate) lines: u32,
}

/// Arguments for `berth destroy`.
#[derive(Debug, Parser)]
pub(crate) struct DestroyCommand {
    /// Skip the confirmation prompt.
    #[arg(long)]
    pub(crate) force: bool,
}

/// Arguments for `berth compose`.
#[derive(Debug, Parser)]
pub(crate) struct ComposeCommand {
    /// Where to write the rendered file.
    #[arg(long, short, default_value = "docker-compose.yml", value_name = "PATH")]
    pub(crate) output: PathBuf,
}
