use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

/// Audit verdict, ordered by priority: `Fail > NeedsReview > Pass`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditDecision {
    Pass = 0,
    NeedsReview = 1,
    Fail = 2,
}

impl AuditDecision {
    pub fn priority(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditDecision::Pass => "PASS",
            AuditDecision::NeedsReview => "NEEDS_REVIEW",
            AuditDecision::Fail => "FAIL",
        }
    }
}

impl Display for AuditDecision {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditDecision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PASS" => Ok(AuditDecision::Pass),
            "NEEDS_REVIEW" => Ok(AuditDecision::NeedsReview),
            "FAIL" => Ok(AuditDecision::Fail),
            _ => Err(anyhow::anyhow!("Invalid audit decision: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InvoiceLineItem {
    pub name: String,
    pub amount: f64,
}

/// Structured invoice fields produced by the extraction port.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InvoiceData {
    pub invoice_code: Option<String>,
    pub invoice_number: Option<String>,
    pub invoice_date: Option<NaiveDate>,
    pub seller_name: Option<String>,
    pub buyer_name: Option<String>,
    pub total_amount: f64,
    pub tax_amount: Option<f64>,
    #[serde(default)]
    pub items: Vec<InvoiceLineItem>,
}

impl InvoiceData {
    /// Deterministic uniqueness key (`CODE:NUMBER`), if both parts are present.
    pub fn invoice_key(&self) -> Option<String> {
        let code = self.invoice_code.as_deref().map(str::trim).unwrap_or("");
        let number = self.invoice_number.as_deref().map(str::trim).unwrap_or("");
        if code.is_empty() || number.is_empty() {
            return None;
        }
        Some(format!(
            "{}:{}",
            code.to_ascii_uppercase(),
            number.to_ascii_uppercase()
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyCheckResult {
    pub compliant: bool,
    #[serde(default)]
    pub violations: Vec<String>,
    pub confidence: f64,
    #[serde(default)]
    pub degraded: bool,
}

impl PolicyCheckResult {
    /// Zero-confidence stand-in when the policy check could not run.
    pub fn degraded() -> Self {
        Self {
            compliant: false,
            violations: Vec::new(),
            confidence: 0.0,
            degraded: true,
        }
    }
}

/// What the price-reasonableness port reports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceCheckResult {
    pub reasonable: bool,
    pub confidence: f64,
    pub reference_amount: Option<f64>,
    pub reason: Option<String>,
}

impl PriceCheckResult {
    pub fn degraded(reason: impl Into<String>) -> Self {
        Self {
            reasonable: false,
            confidence: 0.0,
            reference_amount: None,
            reason: Some(reason.into()),
        }
    }
}

/// Price check combined with the locally computed claimed-vs-invoice deviation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceVerification {
    pub claimed_amount: f64,
    pub invoice_amount: f64,
    /// `|claimed - invoice| / invoice`.
    pub deviation_ratio: f64,
    pub amount_matched: bool,
    pub reasonable: bool,
    pub confidence: f64,
    pub reason: Option<String>,
    #[serde(default)]
    pub degraded: bool,
}

pub const AMOUNT_TOLERANCE: f64 = 0.01;

impl PriceVerification {
    pub fn new(claimed_amount: f64, invoice_amount: f64, check: PriceCheckResult, degraded: bool) -> Self {
        let difference = (claimed_amount - invoice_amount).abs();
        let deviation_ratio = if invoice_amount > 0.0 {
            difference / invoice_amount
        } else if claimed_amount > 0.0 {
            1.0
        } else {
            0.0
        };
        Self {
            claimed_amount,
            invoice_amount,
            deviation_ratio,
            amount_matched: difference <= AMOUNT_TOLERANCE,
            reasonable: check.reasonable,
            confidence: check.confidence,
            reason: check.reason,
            degraded,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletenessResult {
    pub score: f64,
    #[serde(default)]
    pub missing_fields: Vec<String>,
    pub line_items_reconciled: bool,
    #[serde(default)]
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DuplicateInfo {
    pub invoice_key: String,
    pub prior_instance_id: String,
}

/// Full per-attachment verdict, persisted as the attachment's audit payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttachmentAuditResult {
    pub decision: AuditDecision,
    pub confidence: f64,
    pub invoice: InvoiceData,
    pub claimed_amount: f64,
    pub category: String,
    pub policy: PolicyCheckResult,
    pub price: PriceVerification,
    pub completeness: CompletenessResult,
    pub duplicate: Option<DuplicateInfo>,
    pub audited_at: DateTime<Utc>,
}

impl AttachmentAuditResult {
    pub fn from_payload(payload: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(payload.clone()).ok()
    }
}

/// Instance-level decision combined from every processed attachment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregatedAuditResult {
    pub decision: AuditDecision,
    pub confidence: f64,
    pub total_amount: f64,
    pub violations: Vec<String>,
    pub processed_count: usize,
    pub total_count: usize,
}
