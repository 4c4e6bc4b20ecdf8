//! opsforge: a provisioning orchestrator
//!
//! Validates service requests, runs template-driven provisioning pipelines
//! as supervised background jobs, streams step-attributed log events to
//! subscribers and tracks each service through its lifecycle state machine.

pub mod broker;
pub mod cli;
pub mod core;
pub mod execution;
pub mod generator;
pub mod orchestrator;
pub mod registry;
pub mod runner;

pub use broker::{LogBroker, LogStream, StreamMessage};
pub use self::core::{
    LogEvent, LogLevel, OperationKind, OrchestratorError, PipelineRun, RunStatus, Service,
    ServiceState, StepDefinition, Template, TemplateCatalog,
};
pub use orchestrator::{Orchestrator, Principal, Role, StartReceipt, StartRequest};
pub use registry::{InMemoryRegistry, RegistryError, ServiceRegistry};
pub use runner::{OperationContext, OperationRunner, ProcessRunner, ToolConfig};
