use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use expense_core::models::{AuditNotification, NotificationSnapshot, NotificationStatus};
use expense_core::PipelineError;

use crate::traits::NotificationStore;

const NOTIFICATION_COLUMNS: &str = r#"
    id,
    instance_id,
    status,
    decision,
    confidence,
    total_amount,
    violations,
    approver_count,
    error_message,
    created_at,
    updated_at,
    sent_at
"#;

/// `audit_notifications` repository; `instance_id` is unique.
#[derive(Clone)]
pub struct PgNotificationRepository {
    pool: PgPool,
}

impl PgNotificationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn finish(
        &self,
        id: Uuid,
        status: NotificationStatus,
        approver_count: i32,
        error_message: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE audit_notifications
            SET status = $2,
                approver_count = $3,
                error_message = $4,
                sent_at = CASE WHEN $5 THEN NOW() ELSE sent_at END,
                updated_at = NOW()
            WHERE id = $1 AND status <> $6
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(approver_count)
        .bind(error_message)
        .bind(status == NotificationStatus::Sent)
        .bind(NotificationStatus::Sent.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to mark notification {}", status))?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::InvalidState(format!(
                "notification {} is missing or already sent",
                id
            ))
            .into());
        }

        Ok(())
    }
}

#[async_trait]
impl NotificationStore for PgNotificationRepository {
    #[tracing::instrument(skip(self))]
    async fn get_by_instance_id(&self, instance_id: &str) -> Result<Option<AuditNotification>> {
        let sql = format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM audit_notifications WHERE instance_id = $1"
        );

        let row = sqlx::query_as::<Postgres, AuditNotification>(&sql)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch audit notification")?;

        Ok(row)
    }

    /// The conflict arm skips `SENT` rows, so a row that was sent is never
    /// reopened; that case surfaces as `InvalidState`.
    #[tracing::instrument(skip(self, snapshot), fields(instance_id = %snapshot.instance_id))]
    async fn upsert_pending(&self, snapshot: &NotificationSnapshot) -> Result<AuditNotification> {
        let sql = format!(
            r#"
            INSERT INTO audit_notifications (
                id, instance_id, status, decision, confidence, total_amount,
                violations, approver_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (instance_id) DO UPDATE
            SET status = EXCLUDED.status,
                decision = EXCLUDED.decision,
                confidence = EXCLUDED.confidence,
                total_amount = EXCLUDED.total_amount,
                violations = EXCLUDED.violations,
                approver_count = EXCLUDED.approver_count,
                error_message = NULL,
                updated_at = NOW()
            WHERE audit_notifications.status <> $9
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<Postgres, AuditNotification>(&sql)
            .bind(Uuid::new_v4())
            .bind(&snapshot.instance_id)
            .bind(NotificationStatus::Pending.as_str())
            .bind(snapshot.decision.as_str())
            .bind(snapshot.confidence)
            .bind(snapshot.total_amount)
            .bind(sqlx::types::Json(&snapshot.violations))
            .bind(snapshot.approver_count)
            .bind(NotificationStatus::Sent.as_str())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to upsert audit notification")?;

        row.ok_or_else(|| {
            PipelineError::InvalidState(format!(
                "notification for instance {} already sent",
                snapshot.instance_id
            ))
            .into()
        })
    }

    async fn mark_sent(&self, id: Uuid, approver_count: i32) -> Result<()> {
        self.finish(id, NotificationStatus::Sent, approver_count, None)
            .await
    }

    async fn mark_failed(&self, id: Uuid, approver_count: i32, error_message: &str) -> Result<()> {
        self.finish(id, NotificationStatus::Failed, approver_count, Some(error_message))
            .await
    }

    #[tracing::instrument(skip(self))]
    async fn list_failed(&self, limit: i64) -> Result<Vec<AuditNotification>> {
        let sql = format!(
            r#"
            SELECT {NOTIFICATION_COLUMNS}
            FROM audit_notifications
            WHERE status = $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#
        );

        let rows = sqlx::query_as::<Postgres, AuditNotification>(&sql)
            .bind(NotificationStatus::Failed.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list failed audit notifications")?;

        Ok(rows)
    }
}
