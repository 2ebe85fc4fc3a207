//! Instance-level aggregation of per-attachment audit verdicts.

use std::collections::HashSet;

use expense_core::models::{
    AggregatedAuditResult, Attachment, AttachmentAuditResult, AttachmentStatus, AuditDecision,
};

/// Combine the audit payloads of one instance's attachments.
///
/// Pure: no I/O, and the attachments are not required to be fully processed
/// (counts reflect whatever state they are in).
pub fn aggregate(instance_id: &str, attachments: &[Attachment]) -> AggregatedAuditResult {
    let total_count = attachments.len();
    let processed_count = attachments.iter().filter(|a| a.status.is_processed()).count();

    if attachments.is_empty() {
        return AggregatedAuditResult {
            decision: AuditDecision::Pass,
            confidence: 1.0,
            total_amount: 0.0,
            violations: Vec::new(),
            processed_count,
            total_count,
        };
    }

    let mut decision = AuditDecision::Pass;
    let mut confidence_sum = 0.0;
    let mut parsed = 0usize;
    let mut total_amount = 0.0;
    let mut violations = Violations::default();

    for attachment in attachments {
        let Some(result) = attachment
            .audit_result
            .as_ref()
            .and_then(AttachmentAuditResult::from_payload)
        else {
            if attachment.status == AttachmentStatus::Processed && attachment.audit_result.is_some() {
                tracing::warn!(
                    instance_id = %instance_id,
                    attachment_id = %attachment.id,
                    "Skipping unparsable audit payload"
                );
            }
            continue;
        };

        parsed += 1;
        decision = decision.max(result.decision);
        confidence_sum += result.confidence;
        total_amount += result.invoice.total_amount;

        for violation in &result.policy.violations {
            violations.push(violation.clone());
        }

        let price = &result.price;
        if !price.amount_matched {
            violations.push(format!(
                "Amount mismatch: claimed {:.2}, invoice {:.2} ({:.1}% deviation)",
                price.claimed_amount,
                price.invoice_amount,
                price.deviation_ratio * 100.0
            ));
        }
        if !price.reasonable && !price.degraded {
            violations.push(format!(
                "Price unreasonable: {}",
                price.reason.as_deref().unwrap_or("no reason given")
            ));
        }
    }

    let audit_failed = attachments
        .iter()
        .filter(|a| a.status == AttachmentStatus::AuditFailed)
        .count();
    if audit_failed > 0 {
        decision = decision.max(AuditDecision::NeedsReview);
        violations.push(format!("{} attachment(s) could not be audited", audit_failed));
    }

    let confidence = if parsed > 0 {
        confidence_sum / parsed as f64
    } else {
        0.0
    };

    AggregatedAuditResult {
        decision,
        confidence,
        total_amount,
        violations: violations.into_inner(),
        processed_count,
        total_count,
    }
}

/// First-seen ordered, exact-string de-duplicated list.
#[derive(Default)]
struct Violations {
    seen: HashSet<String>,
    ordered: Vec<String>,
}

impl Violations {
    fn push(&mut self, violation: String) {
        if self.seen.insert(violation.clone()) {
            self.ordered.push(violation);
        }
    }

    fn into_inner(self) -> Vec<String> {
        self.ordered
    }
}
