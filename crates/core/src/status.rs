//! Status and restore-request publishing (spec §4.7).
//!
//! Best-effort: a failure to publish is logged and swallowed, never
//! propagated to fail a backup run.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::adapters::SftpAdapter;

/// Outcome of a completed or aborted run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunOutcome {
    Success,
    Partial,
    Skipped,
    QuotaExceeded,
    Failed,
}

/// Which backup kind a run performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunKind {
    File,
    Image,
}

/// The outcome of a single backup run (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub run_id: String,
    pub kind: RunKind,
    pub outcome: RunOutcome,
    pub started_utc: chrono::DateTime<chrono::Utc>,
    pub completed_utc: chrono::DateTime<chrono::Utc>,
    pub files_scanned: u64,
    pub files_uploaded: u64,
    pub files_failed: u64,
    pub bytes_transferred: u64,
    pub errors: Vec<String>,
}

/// The agent's last-known-good snapshot, published after every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub customer_id: String,
    pub machine_name: String,
    pub agent_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<RunOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_backup_utc: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_scheduled_utc: Option<chrono::DateTime<chrono::Utc>>,
    pub quota_bytes: u64,
    pub bytes_used: u64,
    pub updated_utc: chrono::DateTime<chrono::Utc>,
}

/// Restore scope requested by a customer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RestoreScope {
    Full,
    Partial,
}

/// A customer-initiated restore request, read back from the NAS.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    pub customer_id: String,
    pub machine_name: String,
    pub scope: RestoreScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub specific_paths: Vec<String>,
    pub requested_utc: chrono::DateTime<chrono::Utc>,
}

const STATUS_FILE: &str = "status.json";
const RESTORE_REQUEST_FILE: &str = "restore-request.json";

/// Publish `status` to `<customer_base>/status/status.json`. Errors are
/// logged and swallowed.
pub async fn publish_status(adapter: &dyn SftpAdapter, customer_base: &str, status: &Status) {
    let dir = format!("{customer_base}/status");
    if let Err(e) = adapter.mkdir_idempotent(&dir).await {
        tracing::warn!(error = %e, "failed to create status directory");
        return;
    }
    let bytes = match serde_json::to_vec_pretty(status) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode status");
            return;
        }
    };
    let tmp = format!("{dir}/{STATUS_FILE}.tmp");
    let dest = format!("{dir}/{STATUS_FILE}");
    if let Err(e) = adapter.write(&tmp, Bytes::from(bytes)).await {
        tracing::warn!(error = %e, "failed to write status");
        return;
    }
    if let Err(e) = adapter.rename(&tmp, &dest).await {
        tracing::warn!(error = %e, "failed to publish status");
    }
}

/// Read a pending restore request, if one has been left by the customer.
pub async fn read_restore_request(
    adapter: &dyn SftpAdapter,
    customer_base: &str,
) -> Option<RestoreRequest> {
    let path = format!("{customer_base}/status/{RESTORE_REQUEST_FILE}");
    match adapter.exists(&path).await {
        Ok(true) => {}
        _ => return None,
    }
    let bytes = adapter.read(&path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemorySftpAdapter;

    fn sample_status() -> Status {
        Status {
            customer_id: "acme".to_string(),
            machine_name: "host-1".to_string(),
            agent_version: "0.1.0".to_string(),
            last_run_id: Some("run-1".to_string()),
            last_outcome: Some(RunOutcome::Success),
            last_backup_utc: Some(chrono::Utc::now()),
            next_scheduled_utc: Some(chrono::Utc::now()),
            quota_bytes: 1000,
            bytes_used: 10,
            updated_utc: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_status_is_readable_back() {
        let adapter = InMemorySftpAdapter::new();
        publish_status(&adapter, "acme", &sample_status()).await;

        let bytes = adapter.read("acme/status/status.json").await.unwrap();
        let loaded: Status = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(loaded.customer_id, "acme");
    }

    #[tokio::test]
    async fn missing_restore_request_is_none() {
        let adapter = InMemorySftpAdapter::new();
        assert!(read_restore_request(&adapter, "acme").await.is_none());
    }

    #[tokio::test]
    async fn restore_request_round_trips() {
        let adapter = InMemorySftpAdapter::new();
        let request = RestoreRequest {
            customer_id: "acme".to_string(),
            machine_name: "host-1".to_string(),
            scope: RestoreScope::Partial,
            message: Some("please restore Documents".to_string()),
            specific_paths: vec!["Documents".to_string()],
            requested_utc: chrono::Utc::now(),
        };
        let bytes = serde_json::to_vec(&request).unwrap();
        adapter
            .write("acme/status/restore-request.json", Bytes::from(bytes))
            .await
            .unwrap();

        let loaded = read_restore_request(&adapter, "acme").await.unwrap();
        assert_eq!(loaded.specific_paths, vec!["Documents".to_string()]);
    }
}
