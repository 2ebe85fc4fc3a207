//! Collaborator ports
//!
//! Traits for the external services the pipeline drives: invoice extraction,
//! AI audit checks, the approval platform, voucher generation and the
//! workflow engine that reacts to instance status changes. Implementations
//! live outside this workspace; in-memory doubles live in
//! `expense_worker::test_helpers`.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};

use crate::models::{
    AuditNotice, InstanceStatus, InvoiceData, PolicyCheckResult, PriceCheckResult,
};

/// Extracts structured invoice fields from a stored receipt (OCR / vision model).
#[async_trait]
pub trait InvoiceExtractor: Send + Sync {
    async fn extract(&self, file_path: &str) -> Result<InvoiceData>;
}

/// AI-backed policy and price checks. The two calls are independent and may
/// run concurrently.
#[async_trait]
pub trait AuditService: Send + Sync {
    async fn check_policy(&self, data: &InvoiceData, category: &str) -> Result<PolicyCheckResult>;

    async fn check_price(&self, data: &InvoiceData, claimed_amount: f64) -> Result<PriceCheckResult>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approver {
    pub user_id: String,
    pub name: Option<String>,
}

/// The approval-workflow SaaS.
#[async_trait]
pub trait ApprovalPlatform: Send + Sync {
    async fn get_instance_status(&self, instance_id: &str) -> Result<InstanceStatus>;

    async fn get_approvers(&self, instance_id: &str) -> Result<Vec<Approver>>;

    async fn send_notification(&self, recipient: &Approver, notice: &AuditNotice) -> Result<()>;
}

/// Builds the accounting voucher package for an instance.
#[async_trait]
pub trait VoucherGenerator: Send + Sync {
    async fn generate_package(&self, instance_id: &str) -> Result<()>;
}

/// Where a status-change event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    /// Pushed by the approval platform (webhook).
    Push,
    /// Discovered by the fallback status poller.
    Poll,
}

impl Display for EventOrigin {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            EventOrigin::Push => write!(f, "push"),
            EventOrigin::Poll => write!(f, "poll"),
        }
    }
}

/// A decoded instance event: instance id + event type, plus the new status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceEvent {
    pub instance_id: String,
    pub event_type: String,
    pub status: InstanceStatus,
    pub origin: EventOrigin,
}

impl InstanceEvent {
    pub fn status_change(instance_id: impl Into<String>, status: InstanceStatus, origin: EventOrigin) -> Self {
        Self {
            instance_id: instance_id.into(),
            event_type: "instance_status_changed".to_string(),
            status,
            origin,
        }
    }
}

/// The workflow engine entry point shared by the webhook and the status poller.
#[async_trait]
pub trait InstanceEventHandler: Send + Sync {
    async fn handle_status_change(&self, event: InstanceEvent) -> Result<()>;
}
