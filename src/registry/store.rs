//! SQLite-backed service registry

use crate::core::{LogEvent, PipelineRun, Service, ServiceState};
use crate::registry::{RegistryError, ServiceRegistry};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

/// SQLite registry
pub struct SqliteRegistry {
    pool: SqlitePool,
}

impl SqliteRegistry {
    /// Create a new SQLite registry
    pub async fn new(db_path: &str) -> Result<Self, RegistryError> {
        let options = SqliteConnectOptions::from_str(db_path)
            .map_err(storage)?
            .create_if_missing(true);
        // a single connection keeps the run-lock CAS serialized and makes
        // :memory: databases behave under pooling
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(storage)?;

        let registry = Self { pool };
        registry.init().await?;

        Ok(registry)
    }

    /// Create registry with default path
    pub async fn with_default_path() -> Result<Self, RegistryError> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("opsforge");
        std::fs::create_dir_all(&db_dir).map_err(|e| RegistryError::Storage(e.to_string()))?;

        let db_path = db_dir.join("registry.db");
        Self::new(&db_path.to_string_lossy()).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<(), RegistryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS services (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                namespace TEXT NOT NULL,
                template TEXT NOT NULL,
                config_json TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT,
                run_lock TEXT
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_live_name
                ON services(name, namespace) WHERE state != 'deleted';
            CREATE INDEX IF NOT EXISTS idx_service_state ON services(state);

            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                service_id TEXT NOT NULL,
                template TEXT NOT NULL,
                status TEXT NOT NULL,
                current_step INTEGER NOT NULL DEFAULT 0,
                steps_json TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                logs_json TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_run_service ON runs(service_id);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(())
    }

    /// Convert DateTime<Utc> to NaiveDateTime for SQLite
    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    /// Convert NaiveDateTime to DateTime<Utc>
    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn service_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Service, RegistryError> {
        let state: ServiceState = row
            .get::<String, _>("state")
            .parse()
            .map_err(RegistryError::Storage)?;
        let config = serde_json::from_str(&row.get::<String, _>("config_json"))
            .map_err(|e| RegistryError::Storage(e.to_string()))?;

        Ok(Service {
            id: row.get("id"),
            name: row.get("name"),
            namespace: row.get("namespace"),
            template: row.get("template"),
            config,
            state,
            created_at: Self::from_naive(row.get("created_at")),
            updated_at: Self::from_naive(row.get("updated_at")),
            deleted_at: row
                .get::<Option<NaiveDateTime>, _>("deleted_at")
                .map(Self::from_naive),
        })
    }

    fn run_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<PipelineRun, RegistryError> {
        let status = row
            .get::<String, _>("status")
            .parse()
            .map_err(RegistryError::Storage)?;
        let steps = serde_json::from_str(&row.get::<String, _>("steps_json"))
            .map_err(|e| RegistryError::Storage(e.to_string()))?;

        Ok(PipelineRun {
            id: Uuid::parse_str(&row.get::<String, _>("id"))
                .map_err(|e| RegistryError::Storage(e.to_string()))?,
            service_id: row.get("service_id"),
            template: row.get("template"),
            status,
            current_step: row.get::<i64, _>("current_step") as usize,
            steps,
            started_at: Self::from_naive(row.get("started_at")),
            finished_at: row
                .get::<Option<NaiveDateTime>, _>("finished_at")
                .map(Self::from_naive),
        })
    }
}

fn storage(e: sqlx::Error) -> RegistryError {
    RegistryError::Storage(e.to_string())
}

#[async_trait::async_trait]
impl ServiceRegistry for SqliteRegistry {
    async fn create_service(&self, service: &Service) -> Result<(), RegistryError> {
        let config_json = serde_json::to_string(&service.config)
            .map_err(|e| RegistryError::Storage(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO services
            (id, name, namespace, template, config_json, state, created_at, updated_at, deleted_at, run_lock)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL)
            "#,
        )
        .bind(&service.id)
        .bind(&service.name)
        .bind(&service.namespace)
        .bind(&service.template)
        .bind(config_json)
        .bind(service.state.as_str())
        .bind(Self::to_naive(service.created_at))
        .bind(Self::to_naive(service.updated_at))
        .bind(service.deleted_at.map(Self::to_naive))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let unique = e
                    .as_database_error()
                    .map(|d| d.is_unique_violation())
                    .unwrap_or(false);
                if unique {
                    Err(RegistryError::DuplicateName(
                        service.name.clone(),
                        service.namespace.clone(),
                    ))
                } else {
                    Err(storage(e))
                }
            }
        }
    }

    async fn get_service(&self, service_id: &str) -> Result<Service, RegistryError> {
        let row = sqlx::query("SELECT * FROM services WHERE id = ?1")
            .bind(service_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .ok_or_else(|| RegistryError::ServiceNotFound(service_id.to_string()))?;

        Self::service_from_row(&row)
    }

    async fn find_by_name(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Service>, RegistryError> {
        let row = sqlx::query(
            "SELECT * FROM services WHERE name = ?1 AND namespace = ?2 AND state != 'deleted'",
        )
        .bind(name)
        .bind(namespace)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.map(|r| Self::service_from_row(&r)).transpose()
    }

    async fn list_services(&self, include_deleted: bool) -> Result<Vec<Service>, RegistryError> {
        let query = if include_deleted {
            "SELECT * FROM services ORDER BY created_at DESC"
        } else {
            "SELECT * FROM services WHERE state != 'deleted' ORDER BY created_at DESC"
        };
        let rows = sqlx::query(query)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;

        rows.iter().map(Self::service_from_row).collect()
    }

    async fn update_state(
        &self,
        service_id: &str,
        to: ServiceState,
    ) -> Result<Service, RegistryError> {
        // read-check-write; the state column only moves forward so a lost
        // race surfaces as InvalidTransition on the retry
        let current = self.get_service(service_id).await?;
        if !current.state.can_transition(to) {
            return Err(RegistryError::InvalidTransition(current.state, to));
        }

        let now = Utc::now();
        let deleted_at = if to == ServiceState::Deleted {
            Some(now)
        } else {
            current.deleted_at
        };

        let updated = sqlx::query(
            r#"
            UPDATE services SET state = ?2, updated_at = ?3, deleted_at = ?4
            WHERE id = ?1 AND state = ?5
            "#,
        )
        .bind(service_id)
        .bind(to.as_str())
        .bind(Self::to_naive(now))
        .bind(deleted_at.map(Self::to_naive))
        .bind(current.state.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if updated.rows_affected() == 0 {
            let actual = self.get_service(service_id).await?;
            return Err(RegistryError::InvalidTransition(actual.state, to));
        }

        self.get_service(service_id).await
    }

    async fn acquire_run_lock(
        &self,
        service_id: &str,
        run_id: Uuid,
    ) -> Result<bool, RegistryError> {
        let result = sqlx::query(
            r#"
            UPDATE services SET run_lock = ?2
            WHERE id = ?1 AND (run_lock IS NULL OR run_lock = ?2)
            "#,
        )
        .bind(service_id)
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        // distinguish "lock held" from "no such service"
        self.get_service(service_id).await?;
        Ok(false)
    }

    async fn release_run_lock(&self, service_id: &str, run_id: Uuid) -> Result<(), RegistryError> {
        sqlx::query("UPDATE services SET run_lock = NULL WHERE id = ?1 AND run_lock = ?2")
            .bind(service_id)
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn active_run(&self, service_id: &str) -> Result<Option<Uuid>, RegistryError> {
        let row = sqlx::query("SELECT run_lock FROM services WHERE id = ?1")
            .bind(service_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .ok_or_else(|| RegistryError::ServiceNotFound(service_id.to_string()))?;

        row.get::<Option<String>, _>("run_lock")
            .map(|s| Uuid::parse_str(&s).map_err(|e| RegistryError::Storage(e.to_string())))
            .transpose()
    }

    async fn save_run(&self, run: &PipelineRun) -> Result<(), RegistryError> {
        let steps_json = serde_json::to_string(&run.steps)
            .map_err(|e| RegistryError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO runs (id, service_id, template, status, current_step, steps_json, started_at, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                current_step = excluded.current_step,
                steps_json = excluded.steps_json,
                finished_at = excluded.finished_at
            "#,
        )
        .bind(run.id.to_string())
        .bind(&run.service_id)
        .bind(&run.template)
        .bind(run.status.as_str())
        .bind(run.current_step as i64)
        .bind(steps_json)
        .bind(Self::to_naive(run.started_at))
        .bind(run.finished_at.map(Self::to_naive))
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun, RegistryError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?1")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .ok_or(RegistryError::RunNotFound(run_id))?;

        Self::run_from_row(&row)
    }

    async fn list_runs(&self, service_id: &str) -> Result<Vec<PipelineRun>, RegistryError> {
        let rows = sqlx::query(
            "SELECT * FROM runs WHERE service_id = ?1 ORDER BY started_at DESC",
        )
        .bind(service_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter().map(Self::run_from_row).collect()
    }

    async fn save_logs(&self, run_id: Uuid, events: &[LogEvent]) -> Result<(), RegistryError> {
        let logs_json =
            serde_json::to_string(events).map_err(|e| RegistryError::Storage(e.to_string()))?;

        sqlx::query("UPDATE runs SET logs_json = ?2 WHERE id = ?1")
            .bind(run_id.to_string())
            .bind(logs_json)
            .execute(&self.pool)
            .await
            .map_err(storage)?;

        Ok(())
    }

    async fn load_logs(&self, run_id: Uuid) -> Result<Vec<LogEvent>, RegistryError> {
        let row = sqlx::query("SELECT logs_json FROM runs WHERE id = ?1")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .ok_or(RegistryError::RunNotFound(run_id))?;

        match row.get::<Option<String>, _>("logs_json") {
            Some(json) => {
                serde_json::from_str(&json).map_err(|e| RegistryError::Storage(e.to_string()))
            }
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{LogLevel, RunStatus, TemplateCatalog};
    use std::collections::BTreeMap;

    async fn registry() -> SqliteRegistry {
        SqliteRegistry::new(":memory:").await.unwrap()
    }

    fn service(name: &str) -> Service {
        Service::new(name, name, "simple-service", BTreeMap::new())
    }

    #[tokio::test]
    async fn test_service_round_trip() {
        let registry = registry().await;
        let mut svc = service("my-api");
        svc.config
            .insert("port".to_string(), serde_json::Value::from(9000));
        registry.create_service(&svc).await.unwrap();

        let loaded = registry.get_service(&svc.id).await.unwrap();
        assert_eq!(loaded.name, "my-api");
        assert_eq!(loaded.state, ServiceState::Creating);
        assert_eq!(loaded.config["port"], serde_json::Value::from(9000));
    }

    #[tokio::test]
    async fn test_unique_violation_maps_to_duplicate() {
        let registry = registry().await;
        registry.create_service(&service("api")).await.unwrap();

        let mut other = service("api");
        other.id = format!("{}-b", other.id);
        let err = registry.create_service(&other).await.unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName(_, _)));
    }

    #[tokio::test]
    async fn test_name_reusable_after_soft_delete() {
        let registry = registry().await;
        let first = service("api");
        registry.create_service(&first).await.unwrap();
        registry
            .update_state(&first.id, ServiceState::Active)
            .await
            .unwrap();
        registry
            .update_state(&first.id, ServiceState::Deleted)
            .await
            .unwrap();

        let mut second = service("api");
        second.id = format!("{}-b", second.id);
        registry.create_service(&second).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_lock_cas() {
        let registry = registry().await;
        let svc = service("api");
        registry.create_service(&svc).await.unwrap();

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        assert!(registry.acquire_run_lock(&svc.id, first).await.unwrap());
        assert!(!registry.acquire_run_lock(&svc.id, second).await.unwrap());
        assert_eq!(registry.active_run(&svc.id).await.unwrap(), Some(first));

        registry.release_run_lock(&svc.id, first).await.unwrap();
        assert!(registry.acquire_run_lock(&svc.id, second).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_and_logs_round_trip() {
        let registry = registry().await;
        let svc = service("api");
        registry.create_service(&svc).await.unwrap();

        let catalog = TemplateCatalog::builtin();
        let template = catalog.get("simple-service").unwrap();
        let mut run = PipelineRun::new(&svc.id, &template);
        registry.save_run(&run).await.unwrap();

        run.mark_step_running(0);
        run.mark_step_succeeded(0, 1);
        run.finish(RunStatus::Succeeded);
        registry.save_run(&run).await.unwrap();

        let loaded = registry.get_run(run.id).await.unwrap();
        assert_eq!(loaded.status, RunStatus::Succeeded);
        assert_eq!(loaded.succeeded_steps(), 1);
        assert!(loaded.finished_at.is_some());

        let events = vec![LogEvent {
            run_id: run.id,
            sequence: 0,
            step: Some("generate".to_string()),
            level: LogLevel::Info,
            message: "starting".to_string(),
            timestamp: Utc::now(),
        }];
        registry.save_logs(run.id, &events).await.unwrap();

        let loaded = registry.load_logs(run.id).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].sequence, 0);
        assert_eq!(loaded[0].level, LogLevel::Info);
    }
}
