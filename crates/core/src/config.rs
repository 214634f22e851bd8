//! Configuration loading, persistence, and remote sync (spec §4.6, §6).

use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::error::{ConfigError, ConfigResult};
use crate::scheduler::ConfigResync;
use crate::transport::SftpTransport;

/// The agent's configuration document, mirrored at
/// `<base>/<customerId>/backup-config.json` on the NAS.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfiguration {
    pub customer_id: String,
    pub source_roots: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    pub file_backup_cron: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_image_cron: Option<String>,
    #[serde(default)]
    pub enable_full_image_backup: bool,
    pub quota_bytes: u64,
    pub retention_keep_last: u32,
    pub config_sync_interval_minutes: u32,
    #[serde(default)]
    pub chunk_bytes: u64,
    #[serde(default)]
    pub compress_before_upload: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_passphrase: Option<String>,

    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_passphrase: Option<String>,
    pub remote_base_path: String,

    pub last_modified_utc: chrono::DateTime<chrono::Utc>,
}

/// The `cron` crate's `Schedule::from_str` expects a seconds-first 6 or
/// 7 field expression, but spec-facing configuration documents a plain
/// 5-field cron (minute hour day-of-month month day-of-week). Accept
/// either by prepending a `0` seconds field to 5-field input.
pub(crate) fn normalize_cron_expr(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

impl BackupConfiguration {
    const MIN_CHUNK_BYTES: u64 = 1024 * 1024;

    /// Parse and validate the crons, quota, and keep-last count.
    pub fn validate(&self) -> ConfigResult<()> {
        Schedule::from_str(&normalize_cron_expr(&self.file_backup_cron)).map_err(|e| ConfigError::InvalidCron {
            field: "fileBackupCron",
            reason: e.to_string(),
        })?;

        if let Some(image_cron) = &self.full_image_cron {
            Schedule::from_str(&normalize_cron_expr(image_cron)).map_err(|e| ConfigError::InvalidCron {
                field: "fullImageCron",
                reason: e.to_string(),
            })?;
        }

        if self.retention_keep_last < 1 {
            return Err(ConfigError::MissingField("retentionKeepLast"));
        }
        if self.chunk_bytes != 0 && self.chunk_bytes < Self::MIN_CHUNK_BYTES {
            return Err(ConfigError::MissingField("chunkBytes"));
        }
        if self.customer_id.is_empty() {
            return Err(ConfigError::MissingField("customerId"));
        }
        Ok(())
    }

    /// Load from a local path; propagates parse/IO errors to the caller,
    /// who decides whether a missing config is fatal (it is, at startup).
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let bytes = fs::read(path)?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Persist atomically: write to a sibling temp file, then rename.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(self)?;
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Merge a remote copy into `self` per spec §4.6: adopt the remote
    /// document wholesale when it is strictly newer, but always keep
    /// the local SFTP connection fields so host/credentials stay
    /// locally managed even when the NAS stores policy.
    pub fn merge_remote(&mut self, remote: Self) {
        if remote.last_modified_utc <= self.last_modified_utc {
            return;
        }

        let local_host = self.host.clone();
        let local_port = self.port;
        let local_username = self.username.clone();
        let local_password = self.password.clone();
        let local_private_key_path = self.private_key_path.clone();
        let local_private_key_passphrase = self.private_key_passphrase.clone();
        let local_remote_base_path = self.remote_base_path.clone();

        *self = remote;

        self.host = local_host;
        self.port = local_port;
        self.username = local_username;
        self.password = local_password;
        self.private_key_path = local_private_key_path;
        self.private_key_passphrase = local_private_key_passphrase;
        self.remote_base_path = local_remote_base_path;
    }
}

/// Reads `<remoteBasePath>/<customerId>/backup-config.json` over the
/// connected transport and merges it in, implementing the config-sync
/// step of the scheduler loop (spec §4.1, §4.6).
pub struct SftpConfigResync {
    transport: std::sync::Arc<SftpTransport>,
}

impl SftpConfigResync {
    pub fn new(transport: std::sync::Arc<SftpTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait::async_trait]
impl ConfigResync for SftpConfigResync {
    async fn resync(&self, current: &BackupConfiguration) -> Option<BackupConfiguration> {
        let path = format!("{}/{}/backup-config.json", current.remote_base_path, current.customer_id);
        let bytes = self.transport.adapter_ref().read(&path).await.ok()?;
        let remote: BackupConfiguration = serde_json::from_slice(&bytes).ok()?;
        if remote.validate().is_err() {
            tracing::warn!(customer_id = %current.customer_id, "ignoring invalid remote configuration");
            return None;
        }
        let mut merged = current.clone();
        merged.merge_remote(remote);
        Some(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn sample(last_modified: chrono::DateTime<Utc>) -> BackupConfiguration {
        BackupConfiguration {
            customer_id: "acme".to_string(),
            source_roots: vec!["/data".to_string()],
            exclude_patterns: vec![],
            file_backup_cron: "0 0 * * * *".to_string(),
            full_image_cron: None,
            enable_full_image_backup: false,
            quota_bytes: 1_000_000,
            retention_keep_last: 5,
            config_sync_interval_minutes: 60,
            chunk_bytes: 0,
            compress_before_upload: true,
            encryption_passphrase: None,
            host: "nas.local".to_string(),
            port: 22,
            username: "agent".to_string(),
            password: Some("secret".to_string()),
            private_key_path: None,
            private_key_passphrase: None,
            remote_base_path: "/backups".to_string(),
            last_modified_utc: last_modified,
        }
    }

    #[test]
    fn valid_config_passes_validation() {
        assert!(sample(Utc::now()).validate().is_ok());
    }

    #[test]
    fn accepts_the_documented_five_field_cron_form() {
        let mut config = sample(Utc::now());
        config.file_backup_cron = "0 2 * * *".to_string();
        config.full_image_cron = Some("0 3 * * 0".to_string());
        config.enable_full_image_backup = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_keep_last_zero() {
        let mut config = sample(Utc::now());
        config.retention_keep_last = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_chunk_bytes_below_one_mib() {
        let mut config = sample(Utc::now());
        config.chunk_bytes = 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn merge_adopts_newer_remote_but_keeps_local_connection_fields() {
        let now = Utc::now();
        let mut local = sample(now);
        let mut remote = sample(now + Duration::hours(1));
        remote.quota_bytes = 2_000_000;
        remote.host = "attacker.example".to_string();
        remote.password = Some("not-mine".to_string());

        local.merge_remote(remote);

        assert_eq!(local.quota_bytes, 2_000_000);
        assert_eq!(local.host, "nas.local");
        assert_eq!(local.password, Some("secret".to_string()));
    }

    #[test]
    fn merge_ignores_remote_that_is_not_newer() {
        let now = Utc::now();
        let mut local = sample(now);
        let remote = sample(now - Duration::hours(1));

        local.merge_remote(remote);
        assert_eq!(local.quota_bytes, 1_000_000);
    }

    #[test]
    fn save_and_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup-config.json");
        let config = sample(Utc::now());
        config.save(&path).unwrap();

        let loaded = BackupConfiguration::load(&path).unwrap();
        assert_eq!(loaded.customer_id, "acme");
    }

    #[tokio::test]
    async fn sftp_config_resync_merges_a_newer_remote_document() {
        use crate::adapters::{InMemorySftpAdapter, SftpAdapter};
        use std::sync::Arc;

        let adapter = Arc::new(InMemorySftpAdapter::new());
        let transport = Arc::new(SftpTransport::new(adapter.clone(), 0, false, None));
        transport.connect();

        let local = sample(Utc::now());
        let mut remote = sample(Utc::now() + Duration::hours(1));
        remote.quota_bytes = 5_000_000;

        let path = format!("{}/{}/backup-config.json", local.remote_base_path, local.customer_id);
        adapter
            .write(&path, bytes::Bytes::from(serde_json::to_vec(&remote).unwrap()))
            .await
            .unwrap();

        let resync = SftpConfigResync::new(transport);
        let merged = resync.resync(&local).await.unwrap();

        assert_eq!(merged.quota_bytes, 5_000_000);
        assert_eq!(merged.host, "nas.local");
    }

    #[tokio::test]
    async fn sftp_config_resync_returns_none_when_no_remote_document_exists() {
        use crate::adapters::InMemorySftpAdapter;
        use std::sync::Arc;

        let adapter = Arc::new(InMemorySftpAdapter::new());
        let transport = Arc::new(SftpTransport::new(adapter, 0, false, None));
        transport.connect();

        let resync = SftpConfigResync::new(transport);
        assert!(resync.resync(&sample(Utc::now())).await.is_none());
    }
}
