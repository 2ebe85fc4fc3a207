//! Transaction helpers
//!
//! Repositories expose `*_tx` methods taking `&mut PgConnection`;
//! [`with_transaction`] supplies that connection from a live transaction.

use anyhow::{Context, Result};
use sqlx::{PgConnection, PgPool};
use std::future::Future;
use std::pin::Pin;

/// Run `f` inside a transaction; commit on `Ok`, roll back on `Err`.
///
/// ```ignore
/// with_transaction(&pool, |conn| Box::pin(async move {
///     PgAttachmentRepository::update_status_tx(conn, a, AttachmentStatus::Processing, None).await?;
///     PgAttachmentRepository::update_status_tx(conn, b, AttachmentStatus::Processing, None).await
/// })).await?;
/// ```
pub async fn with_transaction<F, R>(pool: &PgPool, f: F) -> Result<R>
where
    F: for<'c> FnOnce(
        &'c mut PgConnection,
    ) -> Pin<Box<dyn Future<Output = Result<R>> + Send + 'c>>,
{
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;

    match f(&mut *tx).await {
        Ok(result) => {
            tx.commit().await.context("Failed to commit transaction")?;
            Ok(result)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(error = %rollback_err, "Failed to rollback transaction");
            }
            Err(e)
        }
    }
}
