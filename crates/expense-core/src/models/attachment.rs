use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle of a receipt attachment through the pipeline.
///
/// ```text
/// PENDING ──► COMPLETED ──► PROCESSING ──► PROCESSED
///    │  ▲                       │     └──► AUDIT_FAILED
///    ▼  │                       │
///  FAILED (re-queue only)       └──► COMPLETED (stale reaper only)
/// ```
///
/// `FAILED` is download-stage only; `AUDIT_FAILED` is audit-stage only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttachmentStatus {
    Pending,
    Completed,
    Failed,
    Processing,
    Processed,
    AuditFailed,
}

impl AttachmentStatus {
    pub const ALL: [AttachmentStatus; 6] = [
        AttachmentStatus::Pending,
        AttachmentStatus::Completed,
        AttachmentStatus::Failed,
        AttachmentStatus::Processing,
        AttachmentStatus::Processed,
        AttachmentStatus::AuditFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentStatus::Pending => "PENDING",
            AttachmentStatus::Completed => "COMPLETED",
            AttachmentStatus::Failed => "FAILED",
            AttachmentStatus::Processing => "PROCESSING",
            AttachmentStatus::Processed => "PROCESSED",
            AttachmentStatus::AuditFailed => "AUDIT_FAILED",
        }
    }

    /// Exhaustive transition table.
    pub fn can_transition_to(&self, next: AttachmentStatus) -> bool {
        use AttachmentStatus::*;
        matches!(
            (self, next),
            (Pending, Completed)
                | (Pending, Failed)
                | (Failed, Pending)
                | (Completed, Processing)
                | (Processing, Processed)
                | (Processing, AuditFailed)
                | (Processing, Completed)
        )
    }

    /// Statuses a row must currently hold to move into `self`.
    pub fn allowed_predecessors(&self) -> Vec<AttachmentStatus> {
        Self::ALL
            .iter()
            .copied()
            .filter(|from| from.can_transition_to(*self))
            .collect()
    }

    /// True when no worker will pick the row up again automatically.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttachmentStatus::Processed | AttachmentStatus::AuditFailed
        )
    }

    /// Terminal states that count towards "fully processed" for an instance.
    pub fn is_processed(&self) -> bool {
        self.is_terminal()
    }
}

impl Display for AttachmentStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttachmentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(AttachmentStatus::Pending),
            "COMPLETED" => Ok(AttachmentStatus::Completed),
            "FAILED" => Ok(AttachmentStatus::Failed),
            "PROCESSING" => Ok(AttachmentStatus::Processing),
            "PROCESSED" => Ok(AttachmentStatus::Processed),
            "AUDIT_FAILED" => Ok(AttachmentStatus::AuditFailed),
            _ => Err(anyhow::anyhow!("Invalid attachment status: {}", s)),
        }
    }
}

/// One receipt file tied to an expense line item and an approval instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Uuid,
    pub item_id: String,
    pub instance_id: String,
    pub file_name: String,
    pub source_url: Option<String>,
    pub file_path: Option<String>,
    pub file_size: Option<i64>,
    pub mime_type: Option<String>,
    pub status: AttachmentStatus,
    pub error_message: Option<String>,
    pub audit_result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Attachment {
    /// Lower-cased extension of the original file name, if any.
    pub fn extension(&self) -> Option<String> {
        std::path::Path::new(&self.file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
    }

    pub fn has_source_url(&self) -> bool {
        self.source_url
            .as_deref()
            .map(|url| !url.trim().is_empty())
            .unwrap_or(false)
    }
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for Attachment {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Attachment {
            id: row.try_get("id")?,
            item_id: row.try_get("item_id")?,
            instance_id: row.try_get("instance_id")?,
            file_name: row.try_get("file_name")?,
            source_url: row.try_get("source_url")?,
            file_path: row.try_get("file_path")?,
            file_size: row.try_get("file_size")?,
            mime_type: row.try_get("mime_type")?,
            status: row.try_get::<String, _>("status")?.parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse attachment status: {}", e).into())
            })?,
            error_message: row.try_get("error_message")?,
            audit_result: row.try_get("audit_result")?,
            created_at: row.try_get("created_at")?,
            downloaded_at: row.try_get("downloaded_at")?,
            processed_at: row.try_get("processed_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_matches_pipeline() {
        use AttachmentStatus::*;
        let allowed = [
            (Pending, Completed),
            (Pending, Failed),
            (Failed, Pending),
            (Completed, Processing),
            (Processing, Processed),
            (Processing, AuditFailed),
            (Processing, Completed),
        ];
        for from in AttachmentStatus::ALL {
            for to in AttachmentStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in AttachmentStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for to in AttachmentStatus::ALL {
                assert!(!from.can_transition_to(to));
            }
        }
    }

    #[test]
    fn allowed_predecessors() {
        assert_eq!(
            AttachmentStatus::Pending.allowed_predecessors(),
            vec![AttachmentStatus::Failed]
        );
        assert_eq!(
            AttachmentStatus::Processing.allowed_predecessors(),
            vec![AttachmentStatus::Completed]
        );
        assert_eq!(
            AttachmentStatus::Completed.allowed_predecessors(),
            vec![AttachmentStatus::Pending, AttachmentStatus::Processing]
        );
    }

    #[test]
    fn status_string_round_trip() {
        for status in AttachmentStatus::ALL {
            assert_eq!(status.as_str().parse::<AttachmentStatus>().unwrap(), status);
        }
        assert!("DOWNLOADING".parse::<AttachmentStatus>().is_err());
    }

    #[test]
    fn extension_is_lowercased() {
        let attachment = Attachment {
            id: Uuid::new_v4(),
            item_id: "item-1".to_string(),
            instance_id: "inst-1".to_string(),
            file_name: "Receipt.PDF".to_string(),
            source_url: Some("   ".to_string()),
            file_path: None,
            file_size: None,
            mime_type: None,
            status: AttachmentStatus::Pending,
            error_message: None,
            audit_result: None,
            created_at: Utc::now(),
            downloaded_at: None,
            processed_at: None,
        };
        assert_eq!(attachment.extension().as_deref(), Some("pdf"));
        assert!(!attachment.has_source_url());
    }
}
