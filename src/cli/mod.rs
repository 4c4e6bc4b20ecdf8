//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{
    CancelCommand, LifecycleCommand, LogsCommand, RunCommand, RunsCommand, ServiceCommand,
    ServicesCommand, StartCommand, TemplatesCommand,
};

/// Provisioning orchestrator for template-driven service delivery
#[derive(Debug, Parser, Clone)]
#[command(name = "opsforge")]
#[command(version = "0.1.0")]
#[command(about = "Provision services through templated GitOps pipelines", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to a YAML file with additional template definitions
    #[arg(long, global = true)]
    pub templates: Option<String>,

    /// Keep state in memory instead of the on-disk registry
    #[arg(long, global = true)]
    pub ephemeral: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Provision a new service
    Start(StartCommand),

    /// List services
    Services(ServicesCommand),

    /// Show one service
    Service(ServiceCommand),

    /// List runs for a service
    Runs(RunsCommand),

    /// Show one run with its step outcomes
    Run(RunCommand),

    /// Show a run's log events
    Logs(LogsCommand),

    /// Transition a service's lifecycle state
    Lifecycle(LifecycleCommand),

    /// Cancel a running pipeline
    Cancel(CancelCommand),

    /// List known templates
    Templates(TemplatesCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}

use std::ffi::OsString;
