//! CLI command definitions

use clap::Args;
use serde_json::Value;

/// Provision a new service
#[derive(Debug, Args, Clone)]
pub struct StartCommand {
    /// Service name (DNS label: lowercase alphanumerics and hyphens)
    pub name: String,

    /// Template to provision from
    #[arg(short, long, default_value = "simple-service")]
    pub template: String,

    /// Target namespace (defaults to a namespace derived from the name)
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Configuration overrides (key=value, value parsed as JSON when possible)
    #[arg(short, long, value_parser = parse_config_pair)]
    pub config: Vec<(String, Value)>,

    /// Extra environment variables for the external tools (key=value)
    #[arg(short, long, value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,

    /// Return immediately instead of following the run's log stream
    #[arg(long)]
    pub detach: bool,
}

/// List services
#[derive(Debug, Args, Clone)]
pub struct ServicesCommand {
    /// Include soft-deleted services
    #[arg(long)]
    pub all: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show one service
#[derive(Debug, Args, Clone)]
pub struct ServiceCommand {
    /// Service identifier
    pub id: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// List runs for a service
#[derive(Debug, Args, Clone)]
pub struct RunsCommand {
    /// Service identifier
    pub service_id: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show one run with its step outcomes
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Run identifier
    pub run_id: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show or follow a run's log events
#[derive(Debug, Args, Clone)]
pub struct LogsCommand {
    /// Run identifier
    pub run_id: String,

    /// Sequence number to start from
    #[arg(long, default_value_t = 0)]
    pub from: u64,

    /// Output events as JSON lines
    #[arg(long)]
    pub json: bool,
}

/// Transition a service's lifecycle state
#[derive(Debug, Args, Clone)]
pub struct LifecycleCommand {
    /// Service identifier
    pub service_id: String,

    /// Target state (active, inactive, deleted)
    pub state: String,
}

/// Cancel a running pipeline
#[derive(Debug, Args, Clone)]
pub struct CancelCommand {
    /// Run identifier
    pub run_id: String,
}

/// List known templates
#[derive(Debug, Args, Clone)]
pub struct TemplatesCommand {
    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, '=').collect();
    if parts.len() != 2 {
        return Err(format!("Invalid key=value pair: {}", s));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

/// Parse key=value pairs where the value may be any JSON scalar
pub fn parse_config_pair(s: &str) -> Result<(String, Value), String> {
    let (key, raw) = parse_key_value(s)?;
    let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
    Ok((key, value))
}
