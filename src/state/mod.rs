//! Instance persistence layer
//!
//! One durable record per orchestration instance. Writes are guarded by an
//! optimistic version check so two engines can never silently overwrite each
//! other's checkpoints.

use crate::error::UnderwritingError;
use crate::models::Phase;
use crate::workflow::OrchestrationInstance;
use crate::Result;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

#[async_trait::async_trait]
pub trait InstanceStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Persist a brand-new instance.
    async fn insert(&self, instance: &OrchestrationInstance) -> Result<()>;

    /// Replace the stored record, provided it is still at `expected_version`.
    async fn save(&self, instance: &OrchestrationInstance, expected_version: u64) -> Result<()>;

    async fn load(&self, instance_id: Uuid) -> Result<Option<OrchestrationInstance>>;

    async fn list(&self) -> Result<Vec<OrchestrationInstance>>;

    async fn list_in_phases(&self, phases: &[Phase]) -> Result<Vec<OrchestrationInstance>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|instance| phases.contains(&instance.phase))
            .collect())
    }
}

//
// ================= In-Memory =================
//

/// In-memory store for development and tests
pub struct InMemoryInstanceStore {
    instances: Arc<RwLock<HashMap<Uuid, OrchestrationInstance>>>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self {
            instances: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryInstanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl InstanceStore for InMemoryInstanceStore {
    fn backend(&self) -> &'static str {
        "in-memory"
    }

    async fn insert(&self, instance: &OrchestrationInstance) -> Result<()> {
        let mut instances = self.instances.write().await;
        if instances.contains_key(&instance.instance_id) {
            return Err(UnderwritingError::StateConflict(instance.instance_id));
        }
        instances.insert(instance.instance_id, instance.clone());
        Ok(())
    }

    async fn save(&self, instance: &OrchestrationInstance, expected_version: u64) -> Result<()> {
        let mut instances = self.instances.write().await;
        let stored = instances
            .get_mut(&instance.instance_id)
            .ok_or(UnderwritingError::InstanceNotFound(instance.instance_id))?;

        if stored.version != expected_version {
            return Err(UnderwritingError::StateConflict(instance.instance_id));
        }
        *stored = instance.clone();
        Ok(())
    }

    async fn load(&self, instance_id: Uuid) -> Result<Option<OrchestrationInstance>> {
        let instances = self.instances.read().await;
        Ok(instances.get(&instance_id).cloned())
    }

    async fn list(&self) -> Result<Vec<OrchestrationInstance>> {
        let instances = self.instances.read().await;
        let mut all: Vec<_> = instances.values().cloned().collect();
        all.sort_by_key(|instance| instance.created_at);
        Ok(all)
    }
}

//
// ================= Postgres =================
//

pub struct PostgresInstanceStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresInstanceStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)?;
        Ok(Self::new(pool))
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS underwriting_instances (
                      instance_id UUID PRIMARY KEY,
                      applicant_id TEXT NOT NULL,
                      phase TEXT NOT NULL,
                      record_json TEXT NOT NULL,
                      version BIGINT NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL,
                      updated_at TIMESTAMPTZ NOT NULL
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_underwriting_instances_phase
                    ON underwriting_instances (phase, updated_at);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                UnderwritingError::DatabaseError(format!(
                    "Failed to initialize underwriting schema: {}",
                    e
                ))
            })?;

        Ok(())
    }

    fn decode(record_json: &str) -> Result<OrchestrationInstance> {
        Ok(serde_json::from_str(record_json)?)
    }
}

fn db_error(context: &str) -> impl Fn(sqlx::Error) -> UnderwritingError + '_ {
    move |e| UnderwritingError::DatabaseError(format!("{}: {}", context, e))
}

#[async_trait::async_trait]
impl InstanceStore for PostgresInstanceStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn insert(&self, instance: &OrchestrationInstance) -> Result<()> {
        self.ensure_schema().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO underwriting_instances
              (instance_id, applicant_id, phase, record_json, version, created_at, updated_at)
            VALUES
              ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (instance_id) DO NOTHING
            "#,
        )
        .bind(instance.instance_id)
        .bind(&instance.application.applicant_id)
        .bind(instance.phase.as_str())
        .bind(serde_json::to_string(instance)?)
        .bind(instance.version as i64)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to insert instance"))?;

        if result.rows_affected() == 0 {
            return Err(UnderwritingError::StateConflict(instance.instance_id));
        }
        Ok(())
    }

    async fn save(&self, instance: &OrchestrationInstance, expected_version: u64) -> Result<()> {
        self.ensure_schema().await?;

        let result = sqlx::query(
            r#"
            UPDATE underwriting_instances
            SET phase = $2, record_json = $3, version = $4, updated_at = $5
            WHERE instance_id = $1 AND version = $6
            "#,
        )
        .bind(instance.instance_id)
        .bind(instance.phase.as_str())
        .bind(serde_json::to_string(instance)?)
        .bind(instance.version as i64)
        .bind(instance.updated_at)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to save instance"))?;

        if result.rows_affected() == 0 {
            return match self.load(instance.instance_id).await? {
                Some(_) => Err(UnderwritingError::StateConflict(instance.instance_id)),
                None => Err(UnderwritingError::InstanceNotFound(instance.instance_id)),
            };
        }
        Ok(())
    }

    async fn load(&self, instance_id: Uuid) -> Result<Option<OrchestrationInstance>> {
        self.ensure_schema().await?;

        let row = sqlx::query("SELECT record_json FROM underwriting_instances WHERE instance_id = $1")
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to load instance"))?;

        match row {
            Some(row) => {
                let record_json: String = row.try_get("record_json")?;
                Ok(Some(Self::decode(&record_json)?))
            }
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<OrchestrationInstance>> {
        self.ensure_schema().await?;

        let rows = sqlx::query("SELECT record_json FROM underwriting_instances ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to list instances"))?;

        rows.iter()
            .map(|row| Self::decode(&row.try_get::<String, _>("record_json")?))
            .collect()
    }

    async fn list_in_phases(&self, phases: &[Phase]) -> Result<Vec<OrchestrationInstance>> {
        self.ensure_schema().await?;

        let labels: Vec<String> = phases.iter().map(|p| p.as_str().to_string()).collect();
        let rows = sqlx::query(
            "SELECT record_json FROM underwriting_instances WHERE phase = ANY($1) ORDER BY created_at ASC",
        )
        .bind(labels)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list instances by phase"))?;

        rows.iter()
            .map(|row| Self::decode(&row.try_get::<String, _>("record_json")?))
            .collect()
    }
}

/// Postgres when `database_url` is set, otherwise in-memory.
pub fn build_instance_store(database_url: Option<&str>) -> Arc<dyn InstanceStore> {
    if let Some(url) = database_url {
        match PostgresInstanceStore::connect_lazy(url) {
            Ok(store) => {
                info!("Instance store backend: postgres");
                return Arc::new(store);
            }
            Err(error) => {
                warn!(
                    "Failed to initialize postgres instance store, falling back to in-memory: {}",
                    error
                );
            }
        }
    }

    info!("Instance store backend: in-memory");
    Arc::new(InMemoryInstanceStore::new())
}
