use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres};

use expense_core::models::{ApprovalInstance, InstanceStatus};
use expense_core::PipelineError;

use crate::traits::InstanceStore;

const INSTANCE_COLUMNS: &str = r#"
    instance_id,
    status,
    applicant_id,
    applicant_name,
    submitted_at,
    approved_at,
    form_data,
    expense_items,
    audit_summary,
    created_at,
    updated_at
"#;

/// `approval_instances` repository. Rows are mirrored from the approval
/// platform; the pipeline only touches status and the audit summary.
#[derive(Clone)]
pub struct PgInstanceRepository {
    pool: PgPool,
}

impl PgInstanceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// `approved_at` is only overwritten when a value is given.
    #[tracing::instrument(skip(conn))]
    pub async fn update_status_tx(
        conn: &mut PgConnection,
        instance_id: &str,
        status: InstanceStatus,
        approved_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE approval_instances
            SET status = $2,
                approved_at = COALESCE($3, approved_at),
                updated_at = NOW()
            WHERE instance_id = $1
            "#,
        )
        .bind(instance_id)
        .bind(status.as_str())
        .bind(approved_at)
        .execute(&mut *conn)
        .await
        .context("Failed to update instance status")?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::NotFound(format!("instance {}", instance_id)).into());
        }

        Ok(())
    }

    #[tracing::instrument(skip(conn, summary))]
    pub async fn update_audit_summary_tx(
        conn: &mut PgConnection,
        instance_id: &str,
        summary: serde_json::Value,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE approval_instances
            SET audit_summary = $2,
                updated_at = NOW()
            WHERE instance_id = $1
            "#,
        )
        .bind(instance_id)
        .bind(summary)
        .execute(&mut *conn)
        .await
        .context("Failed to store audit summary")?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::NotFound(format!("instance {}", instance_id)).into());
        }

        Ok(())
    }
}

#[async_trait]
impl InstanceStore for PgInstanceRepository {
    #[tracing::instrument(skip(self))]
    async fn get_by_id(&self, instance_id: &str) -> Result<Option<ApprovalInstance>> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM approval_instances WHERE instance_id = $1");

        let instance = sqlx::query_as::<Postgres, ApprovalInstance>(&sql)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch approval instance")?;

        Ok(instance)
    }

    #[tracing::instrument(skip(self))]
    async fn list_non_terminal(&self, limit: i64) -> Result<Vec<ApprovalInstance>> {
        let terminal: Vec<String> = InstanceStatus::TERMINAL
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM approval_instances \
             WHERE status <> ALL($1) ORDER BY updated_at ASC LIMIT $2"
        );

        let rows = sqlx::query_as::<Postgres, ApprovalInstance>(&sql)
            .bind(terminal)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list non-terminal instances")?;

        Ok(rows)
    }

    async fn update_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        approved_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire database connection")?;
        Self::update_status_tx(&mut conn, instance_id, status, approved_at).await
    }

    async fn update_audit_summary(&self, instance_id: &str, summary: serde_json::Value) -> Result<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire database connection")?;
        Self::update_audit_summary_tx(&mut conn, instance_id, summary).await
    }
}
