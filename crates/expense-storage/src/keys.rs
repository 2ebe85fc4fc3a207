//! Storage key generation.

use uuid::Uuid;

const MAX_FILE_NAME_LEN: usize = 120;

/// Reduce an uploaded file name to `[A-Za-z0-9._-]`, with no leading dots.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = cleaned.trim_start_matches('.');
    // Keep the extension when truncating.
    let truncated = if trimmed.len() > MAX_FILE_NAME_LEN {
        match trimmed.rfind('.') {
            Some(dot) if trimmed.len() - dot <= 16 => {
                let ext = &trimmed[dot..];
                format!("{}{}", &trimmed[..MAX_FILE_NAME_LEN - ext.len()], ext)
            }
            _ => trimmed[..MAX_FILE_NAME_LEN].to_string(),
        }
    } else {
        trimmed.to_string()
    };

    if truncated.is_empty() || truncated.chars().all(|c| c == '_') {
        "file".to_string()
    } else {
        truncated
    }
}

/// `attachments/{instance_id}/{attachment_id}_{file_name}`.
///
/// The attachment id prefix keeps two attachments with the same file name in
/// one instance from colliding.
pub fn attachment_key(instance_id: &str, attachment_id: Uuid, file_name: &str) -> String {
    format!(
        "attachments/{}/{}_{}",
        sanitize_file_name(instance_id),
        attachment_id,
        sanitize_file_name(file_name)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_file_name("receipt 01.pdf"), "receipt_01.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_file_name("发票.png"), "__.png");
    }

    #[test]
    fn sanitize_never_returns_empty() {
        assert_eq!(sanitize_file_name(""), "file");
        assert_eq!(sanitize_file_name("..."), "file");
        assert_eq!(sanitize_file_name("///"), "file");
    }

    #[test]
    fn sanitize_truncates_but_keeps_extension() {
        let long = format!("{}.pdf", "a".repeat(300));
        let out = sanitize_file_name(&long);
        assert_eq!(out.len(), MAX_FILE_NAME_LEN);
        assert!(out.ends_with(".pdf"));
    }

    #[test]
    fn attachment_key_is_instance_scoped() {
        let id = Uuid::new_v4();
        let key = attachment_key("PROC-2024-001", id, "taxi receipt.jpg");
        assert_eq!(key, format!("attachments/PROC-2024-001/{}_taxi_receipt.jpg", id));
    }

    #[test]
    fn same_name_different_attachments_do_not_collide() {
        let a = attachment_key("inst", Uuid::new_v4(), "receipt.pdf");
        let b = attachment_key("inst", Uuid::new_v4(), "receipt.pdf");
        assert_ne!(a, b);
    }
}
