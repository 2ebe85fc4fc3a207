use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

/// Lifecycle status of a reimbursement submission on the approval platform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Pending,
    Running,
    Approved,
    Rejected,
    Completed,
}

impl InstanceStatus {
    pub const TERMINAL: [InstanceStatus; 3] = [
        InstanceStatus::Approved,
        InstanceStatus::Rejected,
        InstanceStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "PENDING",
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Approved => "APPROVED",
            InstanceStatus::Rejected => "REJECTED",
            InstanceStatus::Completed => "COMPLETED",
        }
    }

    /// Terminal instances are excluded from status polling.
    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

impl Display for InstanceStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(InstanceStatus::Pending),
            "RUNNING" => Ok(InstanceStatus::Running),
            "APPROVED" => Ok(InstanceStatus::Approved),
            "REJECTED" => Ok(InstanceStatus::Rejected),
            "COMPLETED" => Ok(InstanceStatus::Completed),
            _ => Err(anyhow::anyhow!("Invalid instance status: {}", s)),
        }
    }
}

/// One expense line item on the submission form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExpenseItem {
    pub item_id: String,
    pub category: String,
    pub amount: f64,
}

/// One reimbursement submission. Never deleted; kept as the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalInstance {
    pub instance_id: String,
    pub status: InstanceStatus,
    pub applicant_id: String,
    pub applicant_name: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub form_data: serde_json::Value,
    pub expense_items: Vec<ExpenseItem>,
    pub audit_summary: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalInstance {
    /// Claimed amount and category for an attachment's line item.
    ///
    /// Falls back to the first line item, then to `fallback_amount` under the
    /// `other` category when the form carries no items at all.
    pub fn resolve_claim(&self, item_id: &str, fallback_amount: f64) -> (f64, String) {
        self.expense_items
            .iter()
            .find(|item| item.item_id == item_id)
            .or_else(|| self.expense_items.first())
            .map(|item| (item.amount, item.category.clone()))
            .unwrap_or_else(|| (fallback_amount, "other".to_string()))
    }
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for ApprovalInstance {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let items: sqlx::types::Json<Vec<ExpenseItem>> = row.try_get("expense_items")?;
        Ok(ApprovalInstance {
            instance_id: row.try_get("instance_id")?,
            status: row.try_get::<String, _>("status")?.parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse instance status: {}", e).into())
            })?,
            applicant_id: row.try_get("applicant_id")?,
            applicant_name: row.try_get("applicant_name")?,
            submitted_at: row.try_get("submitted_at")?,
            approved_at: row.try_get("approved_at")?,
            form_data: row.try_get("form_data")?,
            expense_items: items.0,
            audit_summary: row.try_get("audit_summary")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}
