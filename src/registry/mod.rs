//! Service registry
//!
//! Durable record of services, their lifecycle state, pipeline runs, and
//! the per-service run lock. The lock is the single arbiter for "at most
//! one active run per service": whichever caller wins the compare-and-set
//! owns the run, everyone else is turned away.

#[cfg(feature = "sqlite")]
pub mod store;

use crate::core::{LogEvent, PipelineRun, Service, ServiceState};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[cfg(feature = "sqlite")]
pub use store::SqliteRegistry;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("service '{0}' already exists in namespace '{1}'")]
    DuplicateName(String, String),

    #[error("service '{0}' not found")]
    ServiceNotFound(String),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("invalid lifecycle transition: {0} -> {1}")]
    InvalidTransition(ServiceState, ServiceState),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Persistence boundary for services and runs
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Insert a new service record. Fails with [`RegistryError::DuplicateName`]
    /// when a non-deleted service with the same name exists in the namespace.
    async fn create_service(&self, service: &Service) -> Result<(), RegistryError>;

    async fn get_service(&self, service_id: &str) -> Result<Service, RegistryError>;

    /// Look up a non-deleted service by name within a namespace.
    async fn find_by_name(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Service>, RegistryError>;

    /// List services, newest first. Soft-deleted records are excluded
    /// unless `include_deleted` is set.
    async fn list_services(&self, include_deleted: bool) -> Result<Vec<Service>, RegistryError>;

    /// Apply a lifecycle transition. Rejects moves the state machine does
    /// not allow and stamps `deleted_at` on soft delete.
    async fn update_state(
        &self,
        service_id: &str,
        to: ServiceState,
    ) -> Result<Service, RegistryError>;

    /// Atomically claim the service's run slot for `run_id`. Returns
    /// `false` when another run already holds it.
    async fn acquire_run_lock(&self, service_id: &str, run_id: Uuid)
        -> Result<bool, RegistryError>;

    /// Release the run slot if `run_id` currently holds it.
    async fn release_run_lock(&self, service_id: &str, run_id: Uuid) -> Result<(), RegistryError>;

    /// The run currently holding the service's slot, if any.
    async fn active_run(&self, service_id: &str) -> Result<Option<Uuid>, RegistryError>;

    /// Insert or update a run snapshot.
    async fn save_run(&self, run: &PipelineRun) -> Result<(), RegistryError>;

    async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun, RegistryError>;

    /// Runs for one service, newest first.
    async fn list_runs(&self, service_id: &str) -> Result<Vec<PipelineRun>, RegistryError>;

    /// Persist the log events captured for a finished run.
    async fn save_logs(&self, run_id: Uuid, events: &[LogEvent]) -> Result<(), RegistryError>;

    async fn load_logs(&self, run_id: Uuid) -> Result<Vec<LogEvent>, RegistryError>;
}

#[derive(Default)]
struct Tables {
    services: HashMap<String, Service>,
    runs: HashMap<Uuid, PipelineRun>,
    locks: HashMap<String, Uuid>,
    logs: HashMap<Uuid, Vec<LogEvent>>,
}

/// In-memory registry used in tests and for ephemeral setups
#[derive(Default)]
pub struct InMemoryRegistry {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceRegistry for InMemoryRegistry {
    async fn create_service(&self, service: &Service) -> Result<(), RegistryError> {
        let mut tables = self.tables.write().await;
        let duplicate = tables.services.values().any(|s| {
            s.name == service.name
                && s.namespace == service.namespace
                && s.state != ServiceState::Deleted
        });
        if duplicate {
            return Err(RegistryError::DuplicateName(
                service.name.clone(),
                service.namespace.clone(),
            ));
        }
        tables
            .services
            .insert(service.id.clone(), service.clone());
        Ok(())
    }

    async fn get_service(&self, service_id: &str) -> Result<Service, RegistryError> {
        let tables = self.tables.read().await;
        tables
            .services
            .get(service_id)
            .cloned()
            .ok_or_else(|| RegistryError::ServiceNotFound(service_id.to_string()))
    }

    async fn find_by_name(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Service>, RegistryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .services
            .values()
            .find(|s| {
                s.name == name && s.namespace == namespace && s.state != ServiceState::Deleted
            })
            .cloned())
    }

    async fn list_services(&self, include_deleted: bool) -> Result<Vec<Service>, RegistryError> {
        let tables = self.tables.read().await;
        let mut services: Vec<Service> = tables
            .services
            .values()
            .filter(|s| include_deleted || s.state != ServiceState::Deleted)
            .cloned()
            .collect();
        services.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(services)
    }

    async fn update_state(
        &self,
        service_id: &str,
        to: ServiceState,
    ) -> Result<Service, RegistryError> {
        let mut tables = self.tables.write().await;
        let service = tables
            .services
            .get_mut(service_id)
            .ok_or_else(|| RegistryError::ServiceNotFound(service_id.to_string()))?;

        if !service.state.can_transition(to) {
            return Err(RegistryError::InvalidTransition(service.state, to));
        }

        service.state = to;
        service.updated_at = Utc::now();
        if to == ServiceState::Deleted {
            service.deleted_at = Some(service.updated_at);
        }
        Ok(service.clone())
    }

    async fn acquire_run_lock(
        &self,
        service_id: &str,
        run_id: Uuid,
    ) -> Result<bool, RegistryError> {
        let mut tables = self.tables.write().await;
        if !tables.services.contains_key(service_id) {
            return Err(RegistryError::ServiceNotFound(service_id.to_string()));
        }
        match tables.locks.get(service_id) {
            Some(holder) => Ok(*holder == run_id),
            None => {
                tables.locks.insert(service_id.to_string(), run_id);
                Ok(true)
            }
        }
    }

    async fn release_run_lock(&self, service_id: &str, run_id: Uuid) -> Result<(), RegistryError> {
        let mut tables = self.tables.write().await;
        if tables.locks.get(service_id) == Some(&run_id) {
            tables.locks.remove(service_id);
        }
        Ok(())
    }

    async fn active_run(&self, service_id: &str) -> Result<Option<Uuid>, RegistryError> {
        let tables = self.tables.read().await;
        Ok(tables.locks.get(service_id).copied())
    }

    async fn save_run(&self, run: &PipelineRun) -> Result<(), RegistryError> {
        let mut tables = self.tables.write().await;
        tables.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun, RegistryError> {
        let tables = self.tables.read().await;
        tables
            .runs
            .get(&run_id)
            .cloned()
            .ok_or(RegistryError::RunNotFound(run_id))
    }

    async fn list_runs(&self, service_id: &str) -> Result<Vec<PipelineRun>, RegistryError> {
        let tables = self.tables.read().await;
        let mut runs: Vec<PipelineRun> = tables
            .runs
            .values()
            .filter(|r| r.service_id == service_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    async fn save_logs(&self, run_id: Uuid, events: &[LogEvent]) -> Result<(), RegistryError> {
        let mut tables = self.tables.write().await;
        tables.logs.insert(run_id, events.to_vec());
        Ok(())
    }

    async fn load_logs(&self, run_id: Uuid) -> Result<Vec<LogEvent>, RegistryError> {
        let tables = self.tables.read().await;
        Ok(tables.logs.get(&run_id).cloned().unwrap_or_default())
    }
}
