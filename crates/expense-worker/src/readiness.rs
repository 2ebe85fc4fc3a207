//! Instance readiness gates
//!
//! The two gates differ on instances with no attachments: voucher generation
//! treats them as done, notification never fires for them.

/// Every attachment has reached `PROCESSED` or `AUDIT_FAILED`. True when the
/// instance has no attachments at all.
pub fn is_fully_processed(unprocessed: i64) -> bool {
    unprocessed == 0
}

/// At least one attachment exists and all of them are processed.
pub fn ready_for_notification(total: i64, unprocessed: i64) -> bool {
    total > 0 && unprocessed == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_attachments_diverge() {
        assert!(is_fully_processed(0));
        assert!(!ready_for_notification(0, 0));
    }

    #[test]
    fn pending_work_blocks_both() {
        assert!(!is_fully_processed(1));
        assert!(!ready_for_notification(3, 1));
    }

    #[test]
    fn all_processed_passes_both() {
        assert!(is_fully_processed(0));
        assert!(ready_for_notification(3, 0));
    }
}
