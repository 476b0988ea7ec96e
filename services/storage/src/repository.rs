use crate::config::DatabaseConfig;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tierflow_pipeline::{Classify, ErrorClass};
use tracing::{debug, info, instrument};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

/// Errors raised by the persistence layer
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Database unavailable: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => RepositoryError::Connection(e.to_string()),
            other => RepositoryError::Query(other.to_string()),
        }
    }
}

impl Classify for RepositoryError {
    fn class(&self) -> ErrorClass {
        match self {
            RepositoryError::Connection(_) => ErrorClass::TransientInfra,
            RepositoryError::Query(_) | RepositoryError::Migration(_) => ErrorClass::Processing,
        }
    }
}

/// An indexed tenant file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Deterministic id, see [`FileRecord::id_for`]
    pub id: Uuid,
    pub tenant_id: String,
    /// Path inside the tenant directory
    pub path: String,
    /// Full object key
    pub s3_key: String,
    pub size_bytes: i64,
    pub content_type: Option<String>,
    /// Tier that processed the file
    pub tier: String,
    pub metadata: serde_json::Value,
}

impl FileRecord {
    /// UUIDv5 over `"<tenant_id>:<path>"`, stable across redeliveries
    pub fn id_for(tenant_id: &str, path: &str) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_DNS, format!("{}:{}", tenant_id, path).as_bytes())
    }
}

/// A resource derived from a file's content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: Uuid,
    pub file_id: Uuid,
    pub tenant_id: String,
    /// Position of the resource within the file
    pub ordinal: i32,
    pub name: String,
    pub content: String,
    pub metadata: serde_json::Value,
}

impl ResourceRecord {
    pub fn id_for(file_id: Uuid, ordinal: i32) -> Uuid {
        Uuid::new_v5(&file_id, ordinal.to_string().as_bytes())
    }
}

/// Persistence capability used by the workers. Every operation is idempotent.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait Repository: Send + Sync {
    /// Insert or replace a file and its resources. Returns the number of
    /// resources written.
    async fn upsert_file(
        &self,
        file: &FileRecord,
        resources: &[ResourceRecord],
    ) -> Result<usize, RepositoryError>;

    /// Remove a file and its resources. Returns false if nothing was indexed.
    async fn delete_file(&self, tenant_id: &str, file_id: Uuid) -> Result<bool, RepositoryError>;

    /// Liveness probe
    async fn ping(&self) -> Result<(), RepositoryError>;

    /// Release connections
    async fn close(&self);
}

/// PostgreSQL-backed repository
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    /// Create a new repository with its own connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .map_err(|e| RepositoryError::Connection(e.to_string()))?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), RepositoryError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| RepositoryError::Migration(e.to_string()))?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait::async_trait]
impl Repository for PostgresRepository {
    #[instrument(skip(self, file, resources), fields(file_id = %file.id, tenant_id = %file.tenant_id))]
    async fn upsert_file(
        &self,
        file: &FileRecord,
        resources: &[ResourceRecord],
    ) -> Result<usize, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO files (
                id, tenant_id, path, s3_key, size_bytes,
                content_type, tier, metadata, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, NOW(), NOW()
            )
            ON CONFLICT (id) DO UPDATE SET
                s3_key = EXCLUDED.s3_key,
                size_bytes = EXCLUDED.size_bytes,
                content_type = EXCLUDED.content_type,
                tier = EXCLUDED.tier,
                metadata = EXCLUDED.metadata,
                updated_at = NOW()
            "#,
        )
        .bind(file.id)
        .bind(&file.tenant_id)
        .bind(&file.path)
        .bind(&file.s3_key)
        .bind(file.size_bytes)
        .bind(&file.content_type)
        .bind(&file.tier)
        .bind(&file.metadata)
        .execute(&mut *tx)
        .await?;

        for resource in resources {
            sqlx::query(
                r#"
                INSERT INTO resources (
                    id, file_id, tenant_id, ordinal, name,
                    content, metadata, created_at, updated_at
                ) VALUES (
                    $1, $2, $3, $4, $5, $6, $7, NOW(), NOW()
                )
                ON CONFLICT (file_id, ordinal) DO UPDATE SET
                    name = EXCLUDED.name,
                    content = EXCLUDED.content,
                    metadata = EXCLUDED.metadata,
                    updated_at = NOW()
                "#,
            )
            .bind(resource.id)
            .bind(resource.file_id)
            .bind(&resource.tenant_id)
            .bind(resource.ordinal)
            .bind(&resource.name)
            .bind(&resource.content)
            .bind(&resource.metadata)
            .execute(&mut *tx)
            .await?;
        }

        // A shorter re-extraction leaves no stale trailing resources
        sqlx::query("DELETE FROM resources WHERE file_id = $1 AND ordinal >= $2")
            .bind(file.id)
            .bind(resources.len() as i32)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(resources = resources.len(), "File indexed");
        Ok(resources.len())
    }

    #[instrument(skip(self))]
    async fn delete_file(&self, tenant_id: &str, file_id: Uuid) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM resources WHERE file_id = $1 AND tenant_id = $2")
            .bind(file_id)
            .bind(tenant_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM files WHERE id = $1 AND tenant_id = $2")
            .bind(file_id)
            .bind(tenant_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed");
    }
}
