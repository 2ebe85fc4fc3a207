use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

use super::audit::{AggregatedAuditResult, AuditDecision};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "PENDING",
            NotificationStatus::Sent => "SENT",
            NotificationStatus::Failed => "FAILED",
        }
    }
}

impl Display for NotificationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(NotificationStatus::Pending),
            "SENT" => Ok(NotificationStatus::Sent),
            "FAILED" => Ok(NotificationStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid notification status: {}", s)),
        }
    }
}

/// Snapshot of the aggregated verdict at send time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationSnapshot {
    pub instance_id: String,
    pub decision: AuditDecision,
    pub confidence: f64,
    pub total_amount: f64,
    pub violations: Vec<String>,
    pub approver_count: i32,
}

impl NotificationSnapshot {
    pub fn from_aggregate(
        instance_id: &str,
        aggregate: &AggregatedAuditResult,
        approver_count: usize,
    ) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            decision: aggregate.decision,
            confidence: aggregate.confidence,
            total_amount: aggregate.total_amount,
            violations: aggregate.violations.clone(),
            approver_count: approver_count as i32,
        }
    }
}

/// Idempotency row: at most one `SENT` notification per instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditNotification {
    pub id: Uuid,
    pub instance_id: String,
    pub status: NotificationStatus,
    pub decision: AuditDecision,
    pub confidence: f64,
    pub total_amount: f64,
    pub violations: Vec<String>,
    pub approver_count: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl AuditNotification {
    pub fn is_sent(&self) -> bool {
        self.status == NotificationStatus::Sent
    }
}

/// Message handed to the approval platform for one recipient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditNotice {
    pub instance_id: String,
    pub decision: AuditDecision,
    pub confidence: f64,
    pub total_amount: f64,
    pub violations: Vec<String>,
    pub processed_count: usize,
    pub total_count: usize,
}

impl AuditNotice {
    pub fn new(instance_id: &str, aggregate: &AggregatedAuditResult) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            decision: aggregate.decision,
            confidence: aggregate.confidence,
            total_amount: aggregate.total_amount,
            violations: aggregate.violations.clone(),
            processed_count: aggregate.processed_count,
            total_count: aggregate.total_count,
        }
    }
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for AuditNotification {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let violations: sqlx::types::Json<Vec<String>> = row.try_get("violations")?;
        Ok(AuditNotification {
            id: row.try_get("id")?,
            instance_id: row.try_get("instance_id")?,
            status: row.try_get::<String, _>("status")?.parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse notification status: {}", e).into())
            })?,
            decision: row.try_get::<String, _>("decision")?.parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse audit decision: {}", e).into())
            })?,
            confidence: row.try_get("confidence")?,
            total_amount: row.try_get("total_amount")?,
            violations: violations.0,
            approver_count: row.try_get("approver_count")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            sent_at: row.try_get("sent_at")?,
        })
    }
}
