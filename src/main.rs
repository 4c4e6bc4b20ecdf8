use anyhow::{Context, Result};
use opsforge::broker::StreamMessage;
use opsforge::cli::commands::*;
use opsforge::cli::output::*;
use opsforge::cli::{Cli, Command};
use opsforge::core::{RunStatus, ServiceState, TemplateCatalog};
use opsforge::generator::GeneratorRegistry;
use opsforge::orchestrator::{Orchestrator, Principal, StartRequest};
use opsforge::registry::{InMemoryRegistry, ServiceRegistry};
use opsforge::runner::{ProcessRunner, ToolConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    let catalog = load_catalog(cli.templates.as_deref())?;
    let registry = build_registry(cli.ephemeral).await?;
    let runner = Arc::new(ProcessRunner::new(
        tool_config_from_env(),
        Arc::new(GeneratorRegistry::builtin()),
    ));
    let orchestrator = Orchestrator::new(registry, runner, catalog);
    let principal = Principal::local_admin();

    match &cli.command {
        Command::Start(cmd) => start_service(&orchestrator, &principal, cmd).await?,
        Command::Services(cmd) => list_services(&orchestrator, cmd).await?,
        Command::Service(cmd) => show_service(&orchestrator, cmd).await?,
        Command::Runs(cmd) => list_runs(&orchestrator, cmd).await?,
        Command::Run(cmd) => show_run(&orchestrator, cmd).await?,
        Command::Logs(cmd) => show_logs(&orchestrator, cmd).await?,
        Command::Lifecycle(cmd) => set_lifecycle(&orchestrator, &principal, cmd).await?,
        Command::Cancel(cmd) => cancel_run(&orchestrator, cmd).await?,
        Command::Templates(cmd) => list_templates(&orchestrator, cmd)?,
    }

    Ok(())
}

fn load_catalog(path: Option<&str>) -> Result<TemplateCatalog> {
    match path {
        Some(path) => {
            let yaml = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read template file {}", path))?;
            TemplateCatalog::from_yaml(&yaml).map_err(anyhow::Error::msg)
        }
        None => Ok(TemplateCatalog::builtin()),
    }
}

async fn build_registry(ephemeral: bool) -> Result<Arc<dyn ServiceRegistry>> {
    #[cfg(feature = "sqlite")]
    if !ephemeral {
        let registry = opsforge::registry::SqliteRegistry::with_default_path()
            .await
            .context("Failed to open service registry")?;
        return Ok(Arc::new(registry));
    }

    let _ = ephemeral;
    Ok(Arc::new(InMemoryRegistry::new()))
}

fn tool_config_from_env() -> ToolConfig {
    let mut tools = ToolConfig::default();
    if let Ok(registry) = std::env::var("OPSFORGE_IMAGE_REGISTRY") {
        tools.image_registry = registry;
    }
    if let Ok(dir) = std::env::var("OPSFORGE_WORKSPACE") {
        tools.workspace_dir = PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("OPSFORGE_GITOPS_DIR") {
        tools.gitops_dir = PathBuf::from(dir);
    }
    tools
}

async fn start_service(
    orchestrator: &Orchestrator,
    principal: &Principal,
    cmd: &StartCommand,
) -> Result<()> {
    let mut request = StartRequest::new(&cmd.name, &cmd.template);
    request.namespace = cmd.namespace.clone();
    request.config.extend(cmd.config.iter().cloned());
    request.env.extend(cmd.env.iter().cloned());

    let receipt = orchestrator.start(principal, request).await?;
    println!(
        "{} Provisioning {} from template {}",
        ROCKET,
        style(&receipt.service.name).bold(),
        style(&receipt.service.template).cyan()
    );
    println!("  service: {}", style(&receipt.service.id).bold());
    println!("  run:     {}", style(receipt.run_id).dim());

    if cmd.detach {
        return Ok(());
    }

    println!();
    let status = follow_stream(orchestrator, receipt.run_id, 0, false).await?;

    match status {
        Some(RunStatus::Succeeded) => {
            println!(
                "\n{} {} is now {}",
                CHECK,
                style(&receipt.service.name).bold(),
                style("active").green()
            );
        }
        Some(status) => {
            println!(
                "\n{} Provisioning of {} {}",
                CROSS,
                style(&receipt.service.name).bold(),
                style(status.as_str()).red()
            );
            std::process::exit(1);
        }
        None => {
            println!("{} Log stream ended without a final status", WARN);
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Follow a run's log stream to its terminal marker.
async fn follow_stream(
    orchestrator: &Orchestrator,
    run_id: Uuid,
    from: u64,
    json: bool,
) -> Result<Option<RunStatus>> {
    let mut stream = orchestrator.subscribe(run_id, from).await?;
    while let Some(message) = stream.next().await {
        match message {
            StreamMessage::Event(event) => {
                if json {
                    println!("{}", serde_json::to_string(&event)?);
                } else {
                    print_event(&event);
                }
            }
            StreamMessage::Gap { missed } => print_gap(missed),
            StreamMessage::Completed { status } => return Ok(Some(status)),
        }
    }
    Ok(None)
}

async fn list_services(orchestrator: &Orchestrator, cmd: &ServicesCommand) -> Result<()> {
    let services = orchestrator.list_services(cmd.all).await?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&services)?);
        return Ok(());
    }

    if services.is_empty() {
        println!("{} No services found", INFO);
        return Ok(());
    }
    for service in &services {
        print_service(service);
    }
    Ok(())
}

async fn show_service(orchestrator: &Orchestrator, cmd: &ServiceCommand) -> Result<()> {
    let service = orchestrator.get_service(&cmd.id).await?;
    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&service)?);
    } else {
        print_service_detail(&service);
    }
    Ok(())
}

async fn list_runs(orchestrator: &Orchestrator, cmd: &RunsCommand) -> Result<()> {
    let runs = orchestrator.list_runs(&cmd.service_id).await?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("{} No runs found for {}", INFO, cmd.service_id);
        return Ok(());
    }
    for run in &runs {
        print_run(run);
    }
    Ok(())
}

async fn show_run(orchestrator: &Orchestrator, cmd: &RunCommand) -> Result<()> {
    let run_id = Uuid::parse_str(&cmd.run_id).context("Invalid run ID format")?;
    let run = orchestrator.get_run(run_id).await?;
    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_run_detail(&run);
    }
    Ok(())
}

async fn show_logs(orchestrator: &Orchestrator, cmd: &LogsCommand) -> Result<()> {
    let run_id = Uuid::parse_str(&cmd.run_id).context("Invalid run ID format")?;

    // a live run streams; a finished one replays from the registry behind
    // the same subscription surface
    follow_stream(orchestrator, run_id, cmd.from, cmd.json).await?;
    Ok(())
}

async fn set_lifecycle(
    orchestrator: &Orchestrator,
    principal: &Principal,
    cmd: &LifecycleCommand,
) -> Result<()> {
    let state: ServiceState = cmd.state.parse().map_err(anyhow::Error::msg)?;
    let service = orchestrator
        .set_lifecycle(principal, &cmd.service_id, state)
        .await?;
    println!(
        "{} {} is now {}",
        CHECK,
        style(&service.id).bold(),
        style(service.state.as_str()).cyan()
    );
    Ok(())
}

async fn cancel_run(orchestrator: &Orchestrator, cmd: &CancelCommand) -> Result<()> {
    let run_id = Uuid::parse_str(&cmd.run_id).context("Invalid run ID format")?;
    orchestrator.cancel(run_id).await?;
    println!(
        "{} Cancellation requested for run {}; it settles at the next step boundary",
        WARN,
        style(run_id).dim()
    );
    Ok(())
}

fn list_templates(orchestrator: &Orchestrator, cmd: &TemplatesCommand) -> Result<()> {
    let catalog = orchestrator.catalog();

    if cmd.json {
        let data: Vec<_> = catalog
            .ids()
            .iter()
            .filter_map(|id| catalog.get(id))
            .map(|t| {
                serde_json::json!({
                    "id": t.id,
                    "name": t.name,
                    "description": t.description,
                    "steps": t.steps.iter().map(|s| &s.name).collect::<Vec<_>>(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    for id in catalog.ids() {
        if let Some(template) = catalog.get(&id) {
            println!(
                "{} ({} steps): {}",
                style(&template.id).bold(),
                style(template.steps.len()).cyan(),
                template.description
            );
            for step in &template.steps {
                println!("    {} [{}]", step.name, style(step.kind).dim());
            }
        }
    }
    Ok(())
}
