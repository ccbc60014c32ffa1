//! Postgres implementation of [`ResourceStore`]

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::ResourceStore;
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::model::{
    AuditEntry, ClusterIdentity, ConnectionInfo, JobStatus, JobType, Resource, ResourceStatus,
};

const RESOURCE_COLUMNS: &str = r#"
    r.id, r.name, r.team_id, rt.name AS resource_type, r.lifecycle_mode, r.config,
    r.namespace, r.status, r.k8s_namespace, r.k8s_resource_name, r.k8s_resource_type,
    r.connection_info, r.deleted_at
"#;

/// Open the connection pool; failure here is fatal at startup
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    let password = config
        .password
        .as_deref()
        .ok_or_else(|| Error::ConfigError("DB_PASSWORD is required".to_string()))?;

    let options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .password(password)
        .database(&config.name)
        .ssl_mode(config.ssl_mode()?);

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await?;

    info!(
        "Connected to database {}@{}:{}/{}",
        config.user, config.host, config.port, config.name
    );
    Ok(pool)
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_resources(&self, filter: &str) -> Result<Vec<Resource>> {
        let query = format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources r \
             JOIN resource_types rt ON rt.id = r.resource_type_id \
             WHERE {filter} ORDER BY r.created_at"
        );
        let rows: Vec<PgRow> = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(resource_from_row).collect()
    }
}

fn resource_from_row(row: &PgRow) -> Result<Resource> {
    let lifecycle_mode: String = row.try_get("lifecycle_mode")?;
    let status: String = row.try_get("status")?;
    let config: Option<serde_json::Value> = row.try_get("config")?;

    Ok(Resource {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        team_id: row.try_get("team_id")?,
        resource_type: row.try_get("resource_type")?,
        lifecycle_mode: lifecycle_mode.parse()?,
        config: config.unwrap_or(serde_json::Value::Null),
        namespace: row.try_get("namespace")?,
        status: status.parse()?,
        k8s_namespace: row.try_get("k8s_namespace")?,
        k8s_resource_name: row.try_get("k8s_resource_name")?,
        k8s_resource_type: row.try_get("k8s_resource_type")?,
        connection_info: row.try_get("connection_info")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

#[async_trait]
impl ResourceStore for PgStore {
    async fn list_managed(&self) -> Result<Vec<Resource>> {
        self.fetch_resources("r.lifecycle_mode = 'full' AND r.deleted_at IS NULL")
            .await
    }

    async fn list_pending_deletions(&self) -> Result<Vec<Resource>> {
        self.fetch_resources(
            "r.lifecycle_mode = 'full' AND r.deleted_at IS NOT NULL AND r.status <> 'deleted'",
        )
        .await
    }

    async fn get_resource(&self, id: Uuid) -> Result<Option<Resource>> {
        let query = format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources r \
             JOIN resource_types rt ON rt.id = r.resource_type_id \
             WHERE r.id = $1"
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(resource_from_row).transpose()
    }

    async fn find_by_cluster_object(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Resource>> {
        let query = format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources r \
             JOIN resource_types rt ON rt.id = r.resource_type_id \
             WHERE r.k8s_namespace = $1 AND r.k8s_resource_name = $2 \
             ORDER BY r.deleted_at NULLS FIRST LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(namespace)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(resource_from_row).transpose()
    }

    async fn update_status(&self, id: Uuid, status: ResourceStatus) -> Result<()> {
        debug!(resource_id = %id, status = %status, "Updating resource status");
        sqlx::query("UPDATE resources SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_error(&self, id: Uuid, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE resources
            SET status = 'error',
                connection_info = COALESCE(connection_info, '{}'::jsonb)
                    || jsonb_build_object('error', $2::text),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_cluster_object(&self, id: Uuid, identity: &ClusterIdentity) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE resources
            SET k8s_namespace = $2, k8s_resource_name = $3, k8s_resource_type = $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&identity.namespace)
        .bind(&identity.name)
        .bind(&identity.kind)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_connection_info(
        &self,
        id: Uuid,
        info: &ConnectionInfo,
        status: ResourceStatus,
    ) -> Result<()> {
        let info = serde_json::to_value(info)?;
        sqlx::query(
            "UPDATE resources SET connection_info = $2, status = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(info)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn open_job(&self, resource_id: Uuid, job_type: JobType) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO provisioning_jobs (id, resource_id, job_type, status, started_at, logs)
            VALUES ($1, $2, $3, $4, NOW(), '')
            "#,
        )
        .bind(id)
        .bind(resource_id)
        .bind(job_type.as_str())
        .bind(JobStatus::Running.as_str())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn complete_job(&self, job_id: Uuid, logs: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE provisioning_jobs
            SET status = $2, logs = $3, completed_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(JobStatus::Completed.as_str())
        .bind(logs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_job(&self, job_id: Uuid, logs: &str, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE provisioning_jobs
            SET status = $2, logs = $3, error_message = $4, completed_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(JobStatus::Failed.as_str())
        .bind(logs)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (id, team_id, resource_id, action, details, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.team_id)
        .bind(entry.resource_id)
        .bind(&entry.action)
        .bind(&entry.details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
