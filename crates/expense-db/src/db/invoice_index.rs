use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::traits::InvoiceIndex;

/// `invoice_index` repository; `invoice_key` is the primary key.
#[derive(Clone)]
pub struct PgInvoiceIndexRepository {
    pool: PgPool,
}

impl PgInvoiceIndexRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InvoiceIndex for PgInvoiceIndexRepository {
    /// The no-op conflict update makes `RETURNING` yield the existing owner,
    /// so claim and lookup happen in one statement.
    #[tracing::instrument(skip(self))]
    async fn claim(
        &self,
        invoice_key: &str,
        instance_id: &str,
        attachment_id: Uuid,
    ) -> Result<Option<String>> {
        let owner: String = sqlx::query_scalar(
            r#"
            INSERT INTO invoice_index (invoice_key, instance_id, attachment_id, claimed_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (invoice_key) DO UPDATE
            SET invoice_key = EXCLUDED.invoice_key
            RETURNING instance_id
            "#,
        )
        .bind(invoice_key)
        .bind(instance_id)
        .bind(attachment_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to claim invoice key")?;

        if owner == instance_id {
            Ok(None)
        } else {
            tracing::warn!(
                invoice_key = %invoice_key,
                instance_id = %instance_id,
                prior_instance_id = %owner,
                "Invoice already claimed by another instance"
            );
            Ok(Some(owner))
        }
    }
}
