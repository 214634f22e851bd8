//! Backup executor: orchestrates a single file or image run (spec §4.4).

use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::adapters::ProcessAdapter;
use crate::config::BackupConfiguration;
use crate::glob::ExcludeSet;
use crate::index::{self, FileIndex};
use crate::retention;
use crate::scheduler::RunHandler;
use crate::status::{self, RunKind, RunOutcome, RunResult};
use crate::transport::SftpTransport;

/// Where the executor keeps the current index between runs, and the
/// remote root under which run directories live.
pub struct ExecutorPaths {
    pub current_index_path: PathBuf,
    pub customer_base_path: String,
}

impl ExecutorPaths {
    pub fn runs_path(&self) -> String {
        format!("{}/runs", self.customer_base_path)
    }
}

/// Composes scan, diff, transport, and index update into a run with a
/// well-defined outcome.
pub struct BackupExecutor {
    transport: Arc<SftpTransport>,
    paths: ExecutorPaths,
    config: Arc<tokio::sync::RwLock<BackupConfiguration>>,
    process: Arc<dyn ProcessAdapter>,
}

impl BackupExecutor {
    pub fn new(
        transport: Arc<SftpTransport>,
        paths: ExecutorPaths,
        config: Arc<tokio::sync::RwLock<BackupConfiguration>>,
        process: Arc<dyn ProcessAdapter>,
    ) -> Self {
        Self { transport, paths, config, process }
    }

    fn run_dir_name(run_id: &str, started: chrono::DateTime<chrono::Utc>) -> String {
        format!("{}-{run_id}", started.format("%Y%m%d-%H%M%S"))
    }

    async fn publish_status(&self, config: &BackupConfiguration, result: &RunResult) {
        let usage = self.transport.usage_bytes(&self.paths.customer_base_path).await;
        let status = status::Status {
            customer_id: config.customer_id.clone(),
            machine_name: hostname(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            last_run_id: Some(result.run_id.clone()),
            last_outcome: Some(result.outcome),
            last_backup_utc: Some(result.completed_utc),
            next_scheduled_utc: None,
            quota_bytes: config.quota_bytes,
            bytes_used: usage,
            updated_utc: chrono::Utc::now(),
        };
        status::publish_status(self.transport.adapter_ref(), &self.paths.customer_base_path, &status).await;
    }

    /// Publish status, then sweep the remote run tree down to
    /// `retentionKeepLast` entries (spec §4.5's "retention runs against
    /// the remote tree" step at the end of the data flow).
    async fn finish_run(&self, config: &BackupConfiguration, result: RunResult) -> RunResult {
        self.publish_status(config, &result).await;
        retention::enforce(&self.transport, &self.paths.runs_path(), config.retention_keep_last).await;
        result
    }

    /// Run a file backup: scan, diff against the current index, upload
    /// changed files, record deletions, rotate the index, write the
    /// manifest.
    pub async fn run_file_backup(&self) -> RunResult {
        let started = chrono::Utc::now();
        let run_id = Uuid::new_v4().to_string();
        let config = self.config.read().await.clone();
        let run_dir = format!("{}/{}", self.paths.runs_path(), Self::run_dir_name(&run_id, started));

        let mut errors = Vec::new();
        let previous = index::FileIndex::load(&self.paths.current_index_path).unwrap_or_default();

        let roots: Vec<PathBuf> = config.source_roots.iter().map(PathBuf::from).collect();
        let excludes = ExcludeSet::new(config.exclude_patterns.clone());
        let mut scanned = index::scan(&roots, &excludes);
        let files_scanned = scanned.len() as u64;

        for entry in scanned.iter_mut() {
            let previous_entry = previous
                .iter()
                .find(|p| p.relative_path.identity_key() == entry.relative_path.identity_key());
            let needs_hash = match previous_entry {
                Some(prev) => prev.size_bytes != entry.size_bytes || prev.last_modified_utc != entry.last_modified_utc,
                None => true,
            };
            if needs_hash {
                if let Some(root) = roots.iter().find(|r| r.join(entry.relative_path.as_str()).exists()) {
                    let absolute = root.join(entry.relative_path.as_str());
                    match index::hash_file(&absolute) {
                        Ok(hash) => entry.sha256 = hash,
                        Err(e) => {
                            tracing::warn!(path = %absolute.display(), error = %e, "failed to hash file");
                        }
                    }
                }
            } else if let Some(prev) = previous_entry {
                entry.sha256 = prev.sha256.clone();
            }
        }

        let mut current = FileIndex::new();
        for entry in &scanned {
            current.upsert(entry.clone());
        }
        let diff_result = index::diff(&previous, &current);

        if diff_result.changed.is_empty() {
            let result = RunResult {
                run_id,
                kind: RunKind::File,
                outcome: RunOutcome::Skipped,
                started_utc: started,
                completed_utc: chrono::Utc::now(),
                files_scanned,
                files_uploaded: 0,
                files_failed: 0,
                bytes_transferred: 0,
                errors,
            };
            return self.finish_run(&config, result).await;
        }

        let usage = self.transport.usage_bytes(&self.paths.customer_base_path).await;
        let pending: u64 = diff_result.changed.iter().map(|e| e.size_bytes).sum();
        if usage + pending > config.quota_bytes {
            errors.push(format!(
                "quota exceeded: usage={usage} pending={pending} quota={}",
                config.quota_bytes
            ));
            let result = RunResult {
                run_id,
                kind: RunKind::File,
                outcome: RunOutcome::QuotaExceeded,
                started_utc: started,
                completed_utc: chrono::Utc::now(),
                files_scanned,
                files_uploaded: 0,
                files_failed: 0,
                bytes_transferred: 0,
                errors,
            };
            return self.finish_run(&config, result).await;
        }

        let mut manifest = crate::transport::Manifest::new(run_id.clone());
        let mut uploaded = 0u64;
        let mut failed = 0u64;
        let mut bytes_transferred = 0u64;

        for entry in &diff_result.changed {
            let root = match roots.iter().find(|r| r.join(entry.relative_path.as_str()).exists()) {
                Some(r) => r,
                None => {
                    failed += 1;
                    errors.push(format!("{}: source file vanished before upload", entry.relative_path));
                    continue;
                }
            };
            let absolute = root.join(entry.relative_path.as_str());
            let bytes = match std::fs::read(&absolute) {
                Ok(b) => b,
                Err(e) => {
                    failed += 1;
                    errors.push(format!("{}: {e}", entry.relative_path));
                    continue;
                }
            };

            match self.transport.send(&run_dir, entry.relative_path.as_str(), &bytes).await {
                Ok(manifest_entry) => {
                    uploaded += 1;
                    bytes_transferred += manifest_entry.size_bytes;
                    manifest.files.push(manifest_entry);
                }
                Err(e) => {
                    failed += 1;
                    errors.push(format!("{}: {e}", entry.relative_path));
                }
            }
        }

        for entry in &diff_result.deleted {
            manifest.deleted.push(entry.relative_path.to_string());
        }

        let outcome = if uploaded == 0 && failed > 0 {
            RunOutcome::Failed
        } else if failed > 0 {
            RunOutcome::Partial
        } else {
            RunOutcome::Success
        };

        if let Err(e) = current.save(&self.paths.current_index_path) {
            errors.push(format!("failed to rotate current index: {e}"));
        }
        if let Err(e) = manifest.write(self.transport.adapter_ref(), &run_dir).await {
            errors.push(format!("failed to write manifest: {e}"));
        }

        let result = RunResult {
            run_id,
            kind: RunKind::File,
            outcome,
            started_utc: started,
            completed_utc: chrono::Utc::now(),
            files_scanned,
            files_uploaded: uploaded,
            files_failed: failed,
            bytes_transferred,
            errors,
        };
        self.finish_run(&config, result).await
    }

    /// Run a full-image backup: the image is one logical entry; the
    /// transport's chunking absorbs its size. The image itself is
    /// produced by an external imaging tool via [`ProcessAdapter`].
    pub async fn run_image_backup(&self) -> RunResult {
        let started = chrono::Utc::now();
        let run_id = Uuid::new_v4().to_string();
        let config = self.config.read().await.clone();
        let run_dir = format!("{}/{}", self.paths.runs_path(), Self::run_dir_name(&run_id, started));

        let scratch = std::env::temp_dir().join(format!("novabackup-image-{run_id}.img"));
        if let Err(e) = self.process.capture_image(&scratch).await {
            return self
                .failed_image_result(run_id, started, config, format!("image capture failed: {e}"))
                .await;
        }

        let bytes = match std::fs::read(&scratch) {
            Ok(b) => {
                let _ = std::fs::remove_file(&scratch);
                b
            }
            Err(e) => {
                let result = RunResult {
                    run_id,
                    kind: RunKind::Image,
                    outcome: RunOutcome::Failed,
                    started_utc: started,
                    completed_utc: chrono::Utc::now(),
                    files_scanned: 0,
                    files_uploaded: 0,
                    files_failed: 1,
                    bytes_transferred: 0,
                    errors: vec![format!("{}: {e}", scratch.display())],
                };
                return self.finish_run(&config, result).await;
            }
        };

        let relative_name = "image.img";

        let mut manifest = crate::transport::Manifest::new(run_id.clone());
        let outcome = match self.transport.send(&run_dir, relative_name, &bytes).await {
            Ok(entry) => {
                let size = entry.size_bytes;
                manifest.files.push(entry);
                if let Err(e) = manifest.write(self.transport.adapter_ref(), &run_dir).await {
                    return self
                        .failed_image_result(run_id, started, config, format!("manifest write failed: {e}"))
                        .await;
                }
                RunResult {
                    run_id: manifest.run_id.clone(),
                    kind: RunKind::Image,
                    outcome: RunOutcome::Success,
                    started_utc: started,
                    completed_utc: chrono::Utc::now(),
                    files_scanned: 1,
                    files_uploaded: 1,
                    files_failed: 0,
                    bytes_transferred: size,
                    errors: vec![],
                }
            }
            Err(e) => {
                return self
                    .failed_image_result(run_id, started, config, e.to_string())
                    .await;
            }
        };

        self.finish_run(&config, outcome).await
    }

    async fn failed_image_result(
        &self,
        run_id: String,
        started: chrono::DateTime<chrono::Utc>,
        config: BackupConfiguration,
        error: String,
    ) -> RunResult {
        let result = RunResult {
            run_id,
            kind: RunKind::Image,
            outcome: RunOutcome::Failed,
            started_utc: started,
            completed_utc: chrono::Utc::now(),
            files_scanned: 1,
            files_uploaded: 0,
            files_failed: 1,
            bytes_transferred: 0,
            errors: vec![error],
        };
        self.finish_run(&config, result).await
    }
}

#[async_trait::async_trait]
impl RunHandler for BackupExecutor {
    async fn run(&self, kind: RunKind) -> RunResult {
        match kind {
            RunKind::File => self.run_file_backup().await,
            RunKind::Image => self.run_image_backup().await,
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}
