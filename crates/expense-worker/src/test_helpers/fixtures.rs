//! Row and payload fixtures

use chrono::{NaiveDate, Utc};
use expense_core::models::{
    ApprovalInstance, Attachment, AttachmentAuditResult, AttachmentStatus, AuditDecision,
    CompletenessResult, ExpenseItem, InstanceStatus, InvoiceData, PolicyCheckResult,
    PriceCheckResult, PriceVerification,
};
use expense_core::Approver;
use uuid::Uuid;

pub fn make_attachment(instance_id: &str, status: AttachmentStatus) -> Attachment {
    let id = Uuid::new_v4();
    Attachment {
        id,
        item_id: "item-1".to_string(),
        instance_id: instance_id.to_string(),
        file_name: "receipt.pdf".to_string(),
        source_url: Some(format!("https://files.example.com/{}/receipt.pdf", id)),
        file_path: None,
        file_size: None,
        mime_type: None,
        status,
        error_message: None,
        audit_result: None,
        created_at: Utc::now(),
        downloaded_at: None,
        processed_at: None,
    }
}

/// A `PROCESSED` attachment carrying `result` as its audit payload.
pub fn audited_attachment(instance_id: &str, result: AttachmentAuditResult) -> Attachment {
    let mut attachment = make_attachment(instance_id, AttachmentStatus::Processed);
    attachment.file_path = Some(format!("/data/{}.pdf", attachment.id));
    attachment.audit_result = serde_json::to_value(&result).ok();
    attachment.processed_at = Some(Utc::now());
    attachment
}

/// Complete invoice without line items.
pub fn sample_invoice(code: &str, number: &str, total: f64) -> InvoiceData {
    InvoiceData {
        invoice_code: Some(code.to_string()),
        invoice_number: Some(number.to_string()),
        invoice_date: NaiveDate::from_ymd_opt(2024, 3, 15),
        seller_name: Some("Harbor Hotel Ltd".to_string()),
        buyer_name: Some("Example Corp".to_string()),
        total_amount: total,
        tax_amount: Some(total * 0.06),
        items: Vec::new(),
    }
}

/// Verdict with matching amounts, a reasonable price and no violations.
pub fn audit_result(decision: AuditDecision, confidence: f64, total: f64) -> AttachmentAuditResult {
    let price = PriceVerification::new(
        total,
        total,
        PriceCheckResult {
            reasonable: true,
            confidence,
            reference_amount: None,
            reason: None,
        },
        false,
    );
    AttachmentAuditResult {
        decision,
        confidence,
        invoice: sample_invoice("011", "00000001", total),
        claimed_amount: total,
        category: "travel".to_string(),
        policy: PolicyCheckResult {
            compliant: true,
            violations: Vec::new(),
            confidence,
            degraded: false,
        },
        price,
        completeness: CompletenessResult {
            score: 1.0,
            missing_fields: Vec::new(),
            line_items_reconciled: true,
            issues: Vec::new(),
        },
        duplicate: None,
        audited_at: Utc::now(),
    }
}

/// `RUNNING` instance with one `travel` line item (`item-1`) of `amount`.
/// The applicant id is `applicant-{instance_id}`.
pub fn make_instance(instance_id: &str, amount: f64) -> ApprovalInstance {
    let now = Utc::now();
    ApprovalInstance {
        instance_id: instance_id.to_string(),
        status: InstanceStatus::Running,
        applicant_id: format!("applicant-{}", instance_id),
        applicant_name: Some("Test Applicant".to_string()),
        submitted_at: now,
        approved_at: None,
        form_data: serde_json::json!({}),
        expense_items: vec![ExpenseItem {
            item_id: "item-1".to_string(),
            category: "travel".to_string(),
            amount,
        }],
        audit_summary: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn approver(user_id: &str) -> Approver {
    Approver {
        user_id: user_id.to_string(),
        name: None,
    }
}
