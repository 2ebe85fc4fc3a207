//! Configuration module
//!
//! All settings come from `EXPENSE_*` environment variables (a `.env` file is
//! loaded first when present). Every field has a default so a bare
//! environment yields a runnable local configuration.

use serde::Deserialize;
use std::time::Duration;

pub const ENV_PREFIX: &str = "EXPENSE_";

const DB_MAX_CONNECTIONS: u32 = 10;
const DOWNLOAD_POLL_INTERVAL_SECS: u64 = 10;
const DOWNLOAD_BATCH_SIZE: i64 = 10;
const DOWNLOAD_MAX_ATTEMPTS: u32 = 3;
const DOWNLOAD_TIMEOUT_SECS: u64 = 60;
const AUDIT_POLL_INTERVAL_SECS: u64 = 15;
const AUDIT_BATCH_SIZE: i64 = 5;
const AUDIT_ITEM_TIMEOUT_SECS: u64 = 180;
const AUDIT_CHECK_TIMEOUT_SECS: u64 = 60;
const STATUS_POLL_INTERVAL_SECS: u64 = 60;
const STATUS_POLL_BATCH_SIZE: i64 = 50;
const RETRY_BASE_DELAY_MS: u64 = 500;
const RETRY_MAX_BACKOFF_MS: u64 = 30_000;
const SHUTDOWN_GRACE_SECS: u64 = 30;

fn default_db_max_connections() -> u32 {
    DB_MAX_CONNECTIONS
}
fn default_storage_root() -> String {
    "./data/attachments".to_string()
}
fn default_download_poll_interval_secs() -> u64 {
    DOWNLOAD_POLL_INTERVAL_SECS
}
fn default_download_batch_size() -> i64 {
    DOWNLOAD_BATCH_SIZE
}
fn default_download_max_attempts() -> u32 {
    DOWNLOAD_MAX_ATTEMPTS
}
fn default_download_timeout_secs() -> u64 {
    DOWNLOAD_TIMEOUT_SECS
}
fn default_audit_poll_interval_secs() -> u64 {
    AUDIT_POLL_INTERVAL_SECS
}
fn default_audit_batch_size() -> i64 {
    AUDIT_BATCH_SIZE
}
fn default_audit_item_timeout_secs() -> u64 {
    AUDIT_ITEM_TIMEOUT_SECS
}
fn default_audit_check_timeout_secs() -> u64 {
    AUDIT_CHECK_TIMEOUT_SECS
}
fn default_supported_extensions() -> Vec<String> {
    ["pdf", "jpg", "jpeg", "png", "webp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_status_poll_interval_secs() -> u64 {
    STATUS_POLL_INTERVAL_SECS
}
fn default_status_poll_batch_size() -> i64 {
    STATUS_POLL_BATCH_SIZE
}
fn default_retry_base_delay_ms() -> u64 {
    RETRY_BASE_DELAY_MS
}
fn default_retry_max_backoff_ms() -> u64 {
    RETRY_MAX_BACKOFF_MS
}
fn default_true() -> bool {
    true
}
fn default_shutdown_grace_secs() -> u64 {
    SHUTDOWN_GRACE_SECS
}

/// Pipeline configuration, deserialized from `EXPENSE_*` variables.
#[derive(Clone, Debug, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_storage_root")]
    pub storage_root: String,

    // Download worker
    #[serde(default = "default_download_poll_interval_secs")]
    pub download_poll_interval_secs: u64,
    #[serde(default = "default_download_batch_size")]
    pub download_batch_size: i64,
    #[serde(default = "default_download_max_attempts")]
    pub download_max_attempts: u32,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    /// Bearer credential forwarded to the attachment host, if it needs one.
    #[serde(default)]
    pub download_credential: Option<String>,

    // Audit processor
    #[serde(default = "default_audit_poll_interval_secs")]
    pub audit_poll_interval_secs: u64,
    #[serde(default = "default_audit_batch_size")]
    pub audit_batch_size: i64,
    #[serde(default = "default_audit_item_timeout_secs")]
    pub audit_item_timeout_secs: u64,
    #[serde(default = "default_audit_check_timeout_secs")]
    pub audit_check_timeout_secs: u64,
    #[serde(default = "default_supported_extensions")]
    pub supported_extensions: Vec<String>,

    // Status poller (fallback when push events cannot reach the process)
    #[serde(default)]
    pub status_poll_enabled: bool,
    #[serde(default = "default_status_poll_interval_secs")]
    pub status_poll_interval_secs: u64,
    #[serde(default = "default_status_poll_batch_size")]
    pub status_poll_batch_size: i64,

    // Retry policy
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,
    #[serde(default = "default_true")]
    pub retry_jitter: bool,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: DB_MAX_CONNECTIONS,
            storage_root: default_storage_root(),
            download_poll_interval_secs: DOWNLOAD_POLL_INTERVAL_SECS,
            download_batch_size: DOWNLOAD_BATCH_SIZE,
            download_max_attempts: DOWNLOAD_MAX_ATTEMPTS,
            download_timeout_secs: DOWNLOAD_TIMEOUT_SECS,
            download_credential: None,
            audit_poll_interval_secs: AUDIT_POLL_INTERVAL_SECS,
            audit_batch_size: AUDIT_BATCH_SIZE,
            audit_item_timeout_secs: AUDIT_ITEM_TIMEOUT_SECS,
            audit_check_timeout_secs: AUDIT_CHECK_TIMEOUT_SECS,
            supported_extensions: default_supported_extensions(),
            status_poll_enabled: false,
            status_poll_interval_secs: STATUS_POLL_INTERVAL_SECS,
            status_poll_batch_size: STATUS_POLL_BATCH_SIZE,
            retry_base_delay_ms: RETRY_BASE_DELAY_MS,
            retry_max_backoff_ms: RETRY_MAX_BACKOFF_MS,
            retry_jitter: true,
            shutdown_grace_secs: SHUTDOWN_GRACE_SECS,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let config: PipelineConfig = envy::prefixed(ENV_PREFIX)
            .from_env()
            .map_err(|e| anyhow::anyhow!("Invalid {}* configuration: {}", ENV_PREFIX, e))?;
        config.validate()?;
        Ok(config)
    }

    /// Build from explicit key/value pairs (keys carry the `EXPENSE_` prefix).
    pub fn from_vars<I>(vars: I) -> Result<Self, anyhow::Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: PipelineConfig = envy::prefixed(ENV_PREFIX)
            .from_iter(vars)
            .map_err(|e| anyhow::anyhow!("Invalid {}* configuration: {}", ENV_PREFIX, e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.download_batch_size <= 0 || self.audit_batch_size <= 0 || self.status_poll_batch_size <= 0 {
            return Err(anyhow::anyhow!("Batch sizes must be greater than zero"));
        }

        if self.download_poll_interval_secs == 0
            || self.audit_poll_interval_secs == 0
            || self.status_poll_interval_secs == 0
        {
            return Err(anyhow::anyhow!("Poll intervals must be greater than zero"));
        }

        if self.download_max_attempts == 0 {
            return Err(anyhow::anyhow!(
                "EXPENSE_DOWNLOAD_MAX_ATTEMPTS must be at least 1"
            ));
        }

        if self.retry_max_backoff_ms < self.retry_base_delay_ms {
            return Err(anyhow::anyhow!(
                "EXPENSE_RETRY_MAX_BACKOFF_MS must not be smaller than EXPENSE_RETRY_BASE_DELAY_MS"
            ));
        }

        if self.storage_root.trim().is_empty() {
            return Err(anyhow::anyhow!("EXPENSE_STORAGE_ROOT must not be empty"));
        }

        if let Some(url) = &self.database_url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                return Err(anyhow::anyhow!(
                    "EXPENSE_DATABASE_URL must be a valid PostgreSQL connection string"
                ));
            }
        }

        Ok(())
    }

    pub fn download_poll_interval(&self) -> Duration {
        Duration::from_secs(self.download_poll_interval_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn audit_poll_interval(&self) -> Duration {
        Duration::from_secs(self.audit_poll_interval_secs)
    }

    pub fn audit_item_timeout(&self) -> Duration {
        Duration::from_secs(self.audit_item_timeout_secs)
    }

    pub fn audit_check_timeout(&self) -> Duration {
        Duration::from_secs(self.audit_check_timeout_secs)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_secs(self.status_poll_interval_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_max_backoff_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_for_empty_environment() {
        let config = PipelineConfig::from_vars(Vec::new()).unwrap();
        assert_eq!(config.download_batch_size, 10);
        assert_eq!(config.download_max_attempts, 3);
        assert_eq!(config.audit_batch_size, 5);
        assert!(!config.status_poll_enabled);
        assert!(config.retry_jitter);
        assert_eq!(config.supported_extensions, default_supported_extensions());
        assert_eq!(config.retry_max_backoff(), Duration::from_secs(30));
    }

    #[test]
    fn overrides_are_read_with_prefix() {
        let config = PipelineConfig::from_vars(vars(&[
            ("EXPENSE_DOWNLOAD_BATCH_SIZE", "25"),
            ("EXPENSE_STATUS_POLL_ENABLED", "true"),
            ("EXPENSE_SUPPORTED_EXTENSIONS", "pdf,ofd"),
            ("EXPENSE_DATABASE_URL", "postgres://localhost/expense"),
        ]))
        .unwrap();
        assert_eq!(config.download_batch_size, 25);
        assert!(config.status_poll_enabled);
        assert_eq!(config.supported_extensions, vec!["pdf", "ofd"]);
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/expense")
        );
    }

    #[test]
    fn rejects_zero_batch_size() {
        let err = PipelineConfig::from_vars(vars(&[("EXPENSE_AUDIT_BATCH_SIZE", "0")]));
        assert!(err.is_err());
    }

    #[test]
    fn rejects_inverted_backoff_bounds() {
        let err = PipelineConfig::from_vars(vars(&[
            ("EXPENSE_RETRY_BASE_DELAY_MS", "5000"),
            ("EXPENSE_RETRY_MAX_BACKOFF_MS", "100"),
        ]));
        assert!(err.is_err());
    }

    #[test]
    fn rejects_non_postgres_database_url() {
        let err = PipelineConfig::from_vars(vars(&[("EXPENSE_DATABASE_URL", "mysql://x")]));
        assert!(err.is_err());
    }

    #[test]
    fn default_impl_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }
}
