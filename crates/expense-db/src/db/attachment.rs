use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgConnection, PgPool, Postgres};
use uuid::Uuid;

use expense_core::models::{Attachment, AttachmentStatus};
use expense_core::PipelineError;

use crate::traits::AttachmentStore;

const ATTACHMENT_COLUMNS: &str = r#"
    id,
    item_id,
    instance_id,
    file_name,
    source_url,
    file_path,
    file_size,
    mime_type,
    status,
    error_message,
    audit_result,
    created_at,
    downloaded_at,
    processed_at
"#;

/// `expense_attachments` repository.
///
/// Every status write is a compare-and-set on the target's allowed
/// predecessors, so concurrent workers cannot move a row along an edge the
/// transition table forbids.
#[derive(Clone)]
pub struct PgAttachmentRepository {
    pool: PgPool,
}

fn predecessor_strings(status: AttachmentStatus) -> Vec<String> {
    status
        .allowed_predecessors()
        .into_iter()
        .map(|s| s.as_str().to_string())
        .collect()
}

impl PgAttachmentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn list_by_status(&self, status: AttachmentStatus, limit: i64) -> Result<Vec<Attachment>> {
        let sql = format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM expense_attachments \
             WHERE status = $1 ORDER BY created_at ASC LIMIT $2"
        );

        let rows = sqlx::query_as::<Postgres, Attachment>(&sql)
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to list {} attachments", status))?;

        Ok(rows)
    }

    /// Explain why a guarded update touched no row.
    async fn rejected_update(
        conn: &mut PgConnection,
        id: Uuid,
        to: AttachmentStatus,
    ) -> anyhow::Error {
        let current: Result<Option<String>, sqlx::Error> =
            sqlx::query_scalar("SELECT status FROM expense_attachments WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await;

        match current {
            Ok(Some(from)) => match from.parse::<AttachmentStatus>() {
                Ok(from) => PipelineError::InvalidTransition {
                    id: id.to_string(),
                    from,
                    to,
                }
                .into(),
                Err(e) => PipelineError::InvalidState(format!(
                    "attachment {} has unknown status: {}",
                    id, e
                ))
                .into(),
            },
            Ok(None) => PipelineError::NotFound(format!("attachment {}", id)).into(),
            Err(e) => anyhow::Error::new(e).context("Failed to read attachment status"),
        }
    }

    /// Guarded status write on a caller-supplied connection.
    #[tracing::instrument(skip(conn))]
    pub async fn update_status_tx(
        conn: &mut PgConnection,
        id: Uuid,
        status: AttachmentStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE expense_attachments
            SET status = $2,
                error_message = $3
            WHERE id = $1 AND status = ANY($4)
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error_message)
        .bind(predecessor_strings(status))
        .execute(&mut *conn)
        .await
        .context("Failed to update attachment status")?;

        if result.rows_affected() == 0 {
            return Err(Self::rejected_update(conn, id, status).await);
        }

        tracing::debug!(attachment_id = %id, status = %status, "Attachment status updated");
        Ok(())
    }

    #[tracing::instrument(skip(conn))]
    pub async fn mark_download_completed_tx(
        conn: &mut PgConnection,
        id: Uuid,
        file_path: &str,
        file_size: i64,
        mime_type: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE expense_attachments
            SET status = $2,
                file_path = $3,
                file_size = $4,
                mime_type = COALESCE($5, mime_type),
                error_message = NULL,
                downloaded_at = NOW()
            WHERE id = $1 AND status = ANY($6)
            "#,
        )
        .bind(id)
        .bind(AttachmentStatus::Completed.as_str())
        .bind(file_path)
        .bind(file_size)
        .bind(mime_type)
        .bind(vec![AttachmentStatus::Pending.as_str().to_string()])
        .execute(&mut *conn)
        .await
        .context("Failed to mark attachment downloaded")?;

        if result.rows_affected() == 0 {
            return Err(Self::rejected_update(conn, id, AttachmentStatus::Completed).await);
        }

        Ok(())
    }

    /// Audit-stage write. `processed_at` is stamped when the row reaches a
    /// terminal status.
    #[tracing::instrument(skip(conn, audit_result))]
    pub async fn update_processing_status_tx(
        conn: &mut PgConnection,
        id: Uuid,
        status: AttachmentStatus,
        audit_result: Option<serde_json::Value>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE expense_attachments
            SET status = $2,
                audit_result = COALESCE($3, audit_result),
                error_message = $4,
                processed_at = CASE WHEN $5 THEN NOW() ELSE processed_at END
            WHERE id = $1 AND status = ANY($6)
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(audit_result)
        .bind(error_message)
        .bind(status.is_processed())
        .bind(predecessor_strings(status))
        .execute(&mut *conn)
        .await
        .context("Failed to update attachment processing status")?;

        if result.rows_affected() == 0 {
            return Err(Self::rejected_update(conn, id, status).await);
        }

        tracing::debug!(attachment_id = %id, status = %status, "Attachment processing status updated");
        Ok(())
    }
}

#[async_trait]
impl AttachmentStore for PgAttachmentRepository {
    #[tracing::instrument(skip(self))]
    async fn get_pending(&self, limit: i64) -> Result<Vec<Attachment>> {
        self.list_by_status(AttachmentStatus::Pending, limit).await
    }

    #[tracing::instrument(skip(self))]
    async fn get_completed(&self, limit: i64) -> Result<Vec<Attachment>> {
        self.list_by_status(AttachmentStatus::Completed, limit).await
    }

    #[tracing::instrument(skip(self))]
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Attachment>> {
        let sql = format!("SELECT {ATTACHMENT_COLUMNS} FROM expense_attachments WHERE id = $1");

        let attachment = sqlx::query_as::<Postgres, Attachment>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch attachment")?;

        Ok(attachment)
    }

    #[tracing::instrument(skip(self))]
    async fn get_by_instance_id(&self, instance_id: &str) -> Result<Vec<Attachment>> {
        let sql = format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM expense_attachments \
             WHERE instance_id = $1 ORDER BY created_at ASC"
        );

        let rows = sqlx::query_as::<Postgres, Attachment>(&sql)
            .bind(instance_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list attachments for instance")?;

        Ok(rows)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: AttachmentStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire database connection")?;
        Self::update_status_tx(&mut conn, id, status, error_message).await
    }

    async fn mark_download_completed(
        &self,
        id: Uuid,
        file_path: &str,
        file_size: i64,
        mime_type: Option<&str>,
    ) -> Result<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire database connection")?;
        Self::mark_download_completed_tx(&mut conn, id, file_path, file_size, mime_type).await
    }

    async fn update_processing_status(
        &self,
        id: Uuid,
        status: AttachmentStatus,
        audit_result: Option<serde_json::Value>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire database connection")?;
        Self::update_processing_status_tx(&mut conn, id, status, audit_result, error_message).await
    }

    #[tracing::instrument(skip(self))]
    async fn get_total_count(&self, instance_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM expense_attachments WHERE instance_id = $1")
                .bind(instance_id)
                .fetch_one(&self.pool)
                .await
                .context("Failed to count attachments")?;

        Ok(count)
    }

    #[tracing::instrument(skip(self))]
    async fn get_unprocessed_count(&self, instance_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM expense_attachments
            WHERE instance_id = $1 AND status <> ALL($2)
            "#,
        )
        .bind(instance_id)
        .bind(vec![
            AttachmentStatus::Processed.as_str().to_string(),
            AttachmentStatus::AuditFailed.as_str().to_string(),
        ])
        .fetch_one(&self.pool)
        .await
        .context("Failed to count unprocessed attachments")?;

        Ok(count)
    }

    #[tracing::instrument(skip(self))]
    async fn requeue_failed(&self, instance_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE expense_attachments
            SET status = $2, error_message = NULL
            WHERE instance_id = $1 AND status = $3
            "#,
        )
        .bind(instance_id)
        .bind(AttachmentStatus::Pending.as_str())
        .bind(AttachmentStatus::Failed.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to requeue failed attachments")?;

        let count = result.rows_affected();
        if count > 0 {
            tracing::info!(instance_id = %instance_id, count = count, "Requeued failed attachments");
        }
        Ok(count)
    }

    #[tracing::instrument(skip(self))]
    async fn reset_stale_processing(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE expense_attachments SET status = $1 WHERE status = $2")
            .bind(AttachmentStatus::Completed.as_str())
            .bind(AttachmentStatus::Processing.as_str())
            .execute(&self.pool)
            .await
            .context("Failed to reset stale processing attachments")?;

        let count = result.rows_affected();
        if count > 0 {
            tracing::warn!(count = count, "Reset attachments stuck in PROCESSING");
        }
        Ok(count)
    }
}
