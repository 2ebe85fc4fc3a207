//! Per-attachment verdict rules.

use expense_core::models::{
    AuditDecision, CompletenessResult, InvoiceData, PolicyCheckResult, PriceVerification,
};

/// More policy violations than this is an automatic `FAIL`.
pub const MAX_POLICY_VIOLATIONS: usize = 2;
pub const FAIL_DEVIATION_RATIO: f64 = 0.10;
pub const FAIL_COMPLETENESS: f64 = 0.5;
pub const REVIEW_COMPLETENESS: f64 = 0.8;
pub const REVIEW_CONFIDENCE: f64 = 0.7;

const RECONCILE_TOLERANCE: f64 = 0.01;
const RECONCILE_PENALTY: f64 = 0.2;
const REQUIRED_FIELDS: usize = 5;

fn present(value: &Option<String>) -> bool {
    value.as_deref().map(|v| !v.trim().is_empty()).unwrap_or(false)
}

/// Required-field presence plus line-item reconciliation. Runs inline; it
/// only reads the already extracted invoice.
pub fn check_completeness(invoice: &InvoiceData) -> CompletenessResult {
    let mut missing_fields = Vec::new();
    if !present(&invoice.invoice_code) {
        missing_fields.push("invoice_code".to_string());
    }
    if !present(&invoice.invoice_number) {
        missing_fields.push("invoice_number".to_string());
    }
    if invoice.invoice_date.is_none() {
        missing_fields.push("invoice_date".to_string());
    }
    if !present(&invoice.seller_name) {
        missing_fields.push("seller_name".to_string());
    }
    if invoice.total_amount <= 0.0 {
        missing_fields.push("total_amount".to_string());
    }

    let mut score = (REQUIRED_FIELDS - missing_fields.len()) as f64 / REQUIRED_FIELDS as f64;
    let mut issues: Vec<String> = missing_fields
        .iter()
        .map(|field| format!("missing {}", field))
        .collect();

    let mut line_items_reconciled = true;
    if !invoice.items.is_empty() {
        let items_total: f64 = invoice.items.iter().map(|item| item.amount).sum();
        if (items_total - invoice.total_amount).abs() > RECONCILE_TOLERANCE {
            line_items_reconciled = false;
            score = (score - RECONCILE_PENALTY).max(0.0);
            issues.push("line items do not reconcile with total".to_string());
        }
    }

    CompletenessResult {
        score,
        missing_fields,
        line_items_reconciled,
        issues,
    }
}

/// Ordered decision rule. Returns the verdict and the overall confidence
/// (mean of the policy, price and completeness confidences).
pub fn decide(
    policy: &PolicyCheckResult,
    price: &PriceVerification,
    completeness: &CompletenessResult,
) -> (AuditDecision, f64) {
    let confidence = (policy.confidence + price.confidence + completeness.score) / 3.0;

    let decision = if policy.violations.len() > MAX_POLICY_VIOLATIONS
        || price.deviation_ratio > FAIL_DEVIATION_RATIO
        || completeness.score < FAIL_COMPLETENESS
    {
        AuditDecision::Fail
    } else if !policy.compliant
        || !price.reasonable
        || completeness.score < REVIEW_COMPLETENESS
        || confidence < REVIEW_CONFIDENCE
    {
        AuditDecision::NeedsReview
    } else {
        AuditDecision::Pass
    };

    (decision, confidence)
}
