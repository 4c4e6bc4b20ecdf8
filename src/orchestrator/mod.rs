//! Orchestrator facade
//!
//! Front door for provisioning: validates requests, enforces roles,
//! allocates runs and hands them to the executor as supervised background
//! tasks. All synchronous failures come back as [`OrchestratorError`];
//! anything that happens after a run starts surfaces through the log
//! stream and the run's terminal status.

use crate::broker::{BrokerError, LogBroker, LogStream};
use crate::core::{
    normalize_namespace, validate_service_name, LogEvent, LogLevel, OrchestratorError,
    PipelineRun, RunStatus, Service, ServiceState, TemplateCatalog,
};
use crate::execution::PipelineExecutor;
use crate::registry::{RegistryError, ServiceRegistry};
use crate::runner::{OperationContext, OperationRunner};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, info};
use uuid::Uuid;

/// Role attached to a principal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Developer,
    Viewer,
}

/// Caller identity for role checks
#[derive(Debug, Clone)]
pub struct Principal {
    pub name: String,
    pub role: Role,
}

impl Principal {
    pub fn new(name: &str, role: Role) -> Self {
        Principal {
            name: name.to_string(),
            role,
        }
    }

    /// Identity used by the local CLI, which owns its own registry.
    pub fn local_admin() -> Self {
        Principal::new("local", Role::Admin)
    }

    fn can_provision(&self) -> bool {
        matches!(self.role, Role::Admin | Role::Developer)
    }

    fn can_delete(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Request to provision a new service
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub name: String,
    /// Target namespace; derived from the name when not given
    pub namespace: Option<String>,
    pub template: String,
    pub config: BTreeMap<String, Value>,
    /// Extra environment passed through to the external tools
    pub env: BTreeMap<String, String>,
}

impl StartRequest {
    pub fn new(name: &str, template: &str) -> Self {
        StartRequest {
            name: name.to_string(),
            namespace: None,
            template: template.to_string(),
            config: BTreeMap::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn in_namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }
}

/// What a successful start returns: the persisted service record and the
/// run to follow
#[derive(Debug, Clone)]
pub struct StartReceipt {
    pub service: Service,
    pub run_id: Uuid,
}

pub struct Orchestrator {
    registry: Arc<dyn ServiceRegistry>,
    broker: Arc<LogBroker>,
    executor: Arc<PipelineExecutor>,
    catalog: TemplateCatalog,
    cancels: Arc<Mutex<HashMap<Uuid, Arc<AtomicBool>>>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        runner: Arc<dyn OperationRunner>,
        catalog: TemplateCatalog,
    ) -> Self {
        let broker = Arc::new(LogBroker::default());
        let executor = Arc::new(PipelineExecutor::new(
            registry.clone(),
            broker.clone(),
            runner,
        ));
        Orchestrator {
            registry,
            broker,
            executor,
            catalog,
            cancels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn catalog(&self) -> &TemplateCatalog {
        &self.catalog
    }

    /// Validate a provisioning request, persist the service record, claim
    /// the run slot and launch the pipeline in the background.
    pub async fn start(
        &self,
        principal: &Principal,
        request: StartRequest,
    ) -> Result<StartReceipt, OrchestratorError> {
        if !principal.can_provision() {
            return Err(OrchestratorError::Forbidden(format!(
                "role {:?} cannot provision services",
                principal.role
            )));
        }

        validate_service_name(&request.name).map_err(OrchestratorError::Validation)?;

        let template = self
            .catalog
            .get(&request.template)
            .ok_or_else(|| OrchestratorError::NotFound(format!(
                "template '{}'",
                request.template
            )))?;

        let mut config = request.config;
        template
            .schema
            .validate(&mut config)
            .map_err(|errors| OrchestratorError::Validation(errors.join("; ")))?;

        let namespace =
            normalize_namespace(request.namespace.as_deref().unwrap_or(&request.name));
        validate_service_name(&namespace)
            .map_err(|e| OrchestratorError::Validation(format!("namespace: {}", e)))?;
        let service = self
            .resolve_service(&request.name, &namespace, &request.template, config.clone())
            .await?;

        let run = PipelineRun::new(&service.id, &template);
        let locked = self.registry.acquire_run_lock(&service.id, run.id).await?;
        if !locked {
            return Err(OrchestratorError::Conflict(format!(
                "a provisioning run is already in progress for '{}'",
                service.name
            )));
        }

        self.broker.register(run.id);
        if let Err(e) = self.registry.save_run(&run).await {
            self.abort_start(&service.id, run.id).await;
            return Err(e.into());
        }
        self.broker.publish(
            run.id,
            Some("initialization"),
            LogLevel::Info,
            &format!(
                "Validated request for service '{}' in namespace '{}'",
                service.name, service.namespace
            ),
        );
        self.broker.publish(
            run.id,
            Some("initialization"),
            LogLevel::Info,
            &format!(
                "Using template '{}' ({} steps)",
                template.id,
                template.steps.len()
            ),
        );

        let ctx = OperationContext {
            service_id: service.id.clone(),
            service_name: service.name.clone(),
            namespace: service.namespace.clone(),
            template_id: template.id.clone(),
            config,
            env: request.env,
        };

        let cancel = Arc::new(AtomicBool::new(false));
        let lock_result = match self.cancels.lock() {
            Ok(mut cancels) => {
                cancels.insert(run.id, cancel.clone());
                Ok(())
            }
            Err(e) => Err(poisoned(e)),
        };
        if let Err(e) = lock_result {
            self.abort_start(&service.id, run.id).await;
            return Err(e);
        }

        let executor = self.executor.clone();
        let cancels = self.cancels.clone();
        let run_id = run.id;
        let service_clone = service.clone();
        let run_clone = run.clone();
        tokio::spawn(async move {
            executor
                .run(run_clone, service_clone, template, ctx, cancel)
                .await;
            if let Ok(mut cancels) = cancels.lock() {
                cancels.remove(&run_id);
            }
        });

        info!(
            "provisioning '{}' started by {} (run {})",
            service.name, principal.name, run.id
        );
        Ok(StartReceipt {
            service,
            run_id: run.id,
        })
    }

    /// Reuse or create the service record for a start request.
    ///
    /// A live service in any state past `creating` means the name is
    /// taken. A `creating` record without an active run is an abandoned
    /// or cancelled creation and gets picked up by the new run. Create
    /// races collapse onto the existing record, where the run lock
    /// decides the winner.
    async fn resolve_service(
        &self,
        name: &str,
        namespace: &str,
        template: &str,
        config: BTreeMap<String, Value>,
    ) -> Result<Service, OrchestratorError> {
        if let Some(existing) = self.registry.find_by_name(name, namespace).await? {
            return Self::reusable(existing, name);
        }

        let service = Service::new(name, namespace, template, config);
        match self.registry.create_service(&service).await {
            Ok(()) => Ok(service),
            Err(RegistryError::DuplicateName(_, _)) => {
                match self.registry.find_by_name(name, namespace).await? {
                    Some(existing) => Self::reusable(existing, name),
                    None => Err(OrchestratorError::Conflict(format!(
                        "service '{}' was created and deleted concurrently",
                        name
                    ))),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Undo the side effects of a start that failed after claiming the
    /// run slot but before the executor took over, so the service can be
    /// provisioned again.
    async fn abort_start(&self, service_id: &str, run_id: Uuid) {
        self.broker.remove(run_id);
        if let Err(e) = self.registry.release_run_lock(service_id, run_id).await {
            error!("failed to release run lock for {}: {}", service_id, e);
        }
    }

    fn reusable(existing: Service, name: &str) -> Result<Service, OrchestratorError> {
        if existing.state == ServiceState::Creating {
            Ok(existing)
        } else {
            Err(OrchestratorError::Validation(format!(
                "service '{}' already exists (state: {})",
                name, existing.state
            )))
        }
    }

    /// Request cooperative cancellation of a running pipeline. The run
    /// settles to `cancelled` at the next step boundary.
    pub async fn cancel(&self, run_id: Uuid) -> Result<(), OrchestratorError> {
        let run = self.registry.get_run(run_id).await.map_err(not_found)?;
        if run.status.is_terminal() {
            return Err(OrchestratorError::Conflict(format!(
                "run {} already finished ({})",
                run_id, run.status
            )));
        }

        let cancels = self.cancels.lock().map_err(poisoned)?;
        match cancels.get(&run_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                info!("cancellation requested for run {}", run_id);
                Ok(())
            }
            None => Err(OrchestratorError::NotFound(format!(
                "no cancellable run {}",
                run_id
            ))),
        }
    }

    /// Subscribe to a run's log stream from a sequence number. Live runs
    /// stream through the broker; finished runs replay their persisted
    /// snapshot and close with the terminal marker.
    pub async fn subscribe(
        &self,
        run_id: Uuid,
        from_seq: u64,
    ) -> Result<LogStream, OrchestratorError> {
        match self.broker.subscribe(run_id, from_seq) {
            Ok(stream) => Ok(stream),
            Err(BrokerError::UnknownRun(_)) => {
                let run = self.registry.get_run(run_id).await.map_err(not_found)?;
                if !run.status.is_terminal() {
                    return Err(OrchestratorError::Internal(format!(
                        "run {} has no live log stream",
                        run_id
                    )));
                }
                let events = self.registry.load_logs(run_id).await.map_err(not_found)?;
                Ok(LogStream::from_history(events, from_seq, run.status))
            }
        }
    }

    /// Log events of a finished run, loaded from the registry. Covers
    /// runs from earlier process lifetimes that the broker never saw.
    pub async fn replay_logs(&self, run_id: Uuid) -> Result<Vec<LogEvent>, OrchestratorError> {
        self.registry.load_logs(run_id).await.map_err(not_found)
    }

    /// Apply an operator-driven lifecycle transition.
    ///
    /// Soft delete requires the admin role. Transitions are refused while
    /// a run holds the service's slot.
    pub async fn set_lifecycle(
        &self,
        principal: &Principal,
        service_id: &str,
        to: ServiceState,
    ) -> Result<Service, OrchestratorError> {
        if to == ServiceState::Deleted && !principal.can_delete() {
            return Err(OrchestratorError::Forbidden(
                "only admins can delete services".to_string(),
            ));
        }

        if let Some(run_id) = self.registry.active_run(service_id).await.map_err(not_found)? {
            return Err(OrchestratorError::Conflict(format!(
                "run {} is in progress for '{}'",
                run_id, service_id
            )));
        }

        match self.registry.update_state(service_id, to).await {
            Ok(service) => {
                info!(
                    "service {} moved to {} by {}",
                    service_id, to, principal.name
                );
                Ok(service)
            }
            Err(RegistryError::InvalidTransition(from, to)) => Err(OrchestratorError::Conflict(
                format!("cannot move service from {} to {}", from, to),
            )),
            Err(e) => Err(not_found(e)),
        }
    }

    pub async fn get_service(&self, service_id: &str) -> Result<Service, OrchestratorError> {
        self.registry.get_service(service_id).await.map_err(not_found)
    }

    pub async fn list_services(
        &self,
        include_deleted: bool,
    ) -> Result<Vec<Service>, OrchestratorError> {
        Ok(self.registry.list_services(include_deleted).await?)
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun, OrchestratorError> {
        self.registry.get_run(run_id).await.map_err(not_found)
    }

    pub async fn list_runs(&self, service_id: &str) -> Result<Vec<PipelineRun>, OrchestratorError> {
        Ok(self.registry.list_runs(service_id).await?)
    }

    /// Wait for a run to reach a terminal status by following its stream.
    pub async fn wait_for(&self, run_id: Uuid) -> Result<RunStatus, OrchestratorError> {
        let stream = self.subscribe(run_id, 0).await?;
        let (_, status) = stream.collect().await;
        status.ok_or_else(|| {
            OrchestratorError::Internal(format!("stream for run {} closed without status", run_id))
        })
    }
}

fn not_found(e: RegistryError) -> OrchestratorError {
    match e {
        RegistryError::ServiceNotFound(id) => {
            OrchestratorError::NotFound(format!("service '{}'", id))
        }
        RegistryError::RunNotFound(id) => OrchestratorError::NotFound(format!("run {}", id)),
        other => other.into(),
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> OrchestratorError {
    OrchestratorError::Internal("cancellation registry poisoned".to_string())
}
