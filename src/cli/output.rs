//! Terminal output helpers

use crate::core::{LogEvent, LogLevel, PipelineRun, Service, StepState};
use console::Emoji;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

pub fn print_event(event: &LogEvent) {
    let step = event.step.as_deref().unwrap_or("-");
    let prefix = match event.level {
        LogLevel::Info => style("INFO").dim(),
        LogLevel::Warning => style("WARN").yellow(),
        LogLevel::Error => style("FAIL").red().bold(),
        LogLevel::Success => style(" OK ").green(),
    };
    println!(
        "{} [{}] {} {}",
        style(format!("#{:<4}", event.sequence)).dim(),
        prefix,
        style(format!("{:<14}", step)).cyan(),
        event.message
    );
}

pub fn print_gap(missed: u64) {
    println!(
        "{}",
        style(format!("... {} earlier events no longer buffered ...", missed)).dim()
    );
}

pub fn print_service(service: &Service) {
    let state = match service.state.as_str() {
        "active" => style(service.state.as_str()).green(),
        "failed" => style(service.state.as_str()).red(),
        "deleted" => style(service.state.as_str()).dim(),
        other => style(other).yellow(),
    };
    println!(
        "{:<32} {:<16} {:<16} {:<10} {}",
        style(&service.id).bold(),
        service.name,
        service.template,
        state,
        service.created_at.format("%Y-%m-%d %H:%M:%S")
    );
}

pub fn print_service_detail(service: &Service) {
    println!("{}: {}", style("Service").bold(), service.id);
    println!("  name:      {}", service.name);
    println!("  namespace: {}", service.namespace);
    println!("  template:  {}", service.template);
    println!("  state:     {}", service.state);
    println!("  created:   {}", service.created_at.to_rfc3339());
    println!("  updated:   {}", service.updated_at.to_rfc3339());
    if let Some(deleted) = service.deleted_at {
        println!("  deleted:   {}", deleted.to_rfc3339());
    }
    if !service.config.is_empty() {
        println!("  config:");
        for (key, value) in &service.config {
            println!("    {} = {}", key, value);
        }
    }
}

pub fn print_run(run: &PipelineRun) {
    let status = match run.status.as_str() {
        "succeeded" => style(run.status.as_str()).green(),
        "failed" => style(run.status.as_str()).red(),
        "cancelled" => style(run.status.as_str()).yellow(),
        other => style(other).cyan(),
    };
    println!(
        "{} {:<10} {:<32} {}",
        run.id,
        status,
        run.service_id,
        run.started_at.format("%Y-%m-%d %H:%M:%S")
    );
}

pub fn print_run_detail(run: &PipelineRun) {
    println!("{}: {}", style("Run").bold(), run.id);
    println!("  service:  {}", run.service_id);
    println!("  template: {}", run.template);
    println!("  status:   {}", run.status);
    println!("  started:  {}", run.started_at.to_rfc3339());
    if let Some(finished) = run.finished_at {
        println!("  finished: {}", finished.to_rfc3339());
    }
    println!("  steps:");
    for step in &run.steps {
        let marker = match &step.state {
            StepState::Pending => style("·").dim(),
            StepState::Running { .. } => style("▸").cyan(),
            StepState::Succeeded { .. } => style("✓").green(),
            StepState::Failed { .. } => style("✗").red(),
        };
        match &step.state {
            StepState::Failed { error, attempts, .. } => {
                println!(
                    "    {} {} ({} attempts): {}",
                    marker, step.name, attempts, error
                );
            }
            StepState::Succeeded { attempts, .. } => {
                println!("    {} {} ({} attempts)", marker, step.name, attempts);
            }
            _ => println!("    {} {}", marker, step.name),
        }
    }
}
