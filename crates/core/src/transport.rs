//! Chunked, resumable SFTP transport (spec §4.3).
//!
//! Each file goes through gzip → AES-256-CBC → fixed-size chunking
//! before it is written to the remote run directory. A single-chunk
//! payload keeps the file's bare relative path as its remote name;
//! a multi-chunk payload is split into `<relpath>.partNNNN` members
//! with a zero-padded, zero-based index. Every chunk is written to a
//! `.tmp` sibling and made visible with a server-side rename, and a
//! `resume.json` log records completed chunk names so a restarted run
//! can skip work it already finished.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::adapters::SftpAdapter;
use crate::compression;
use crate::crypto;
use crate::error::{TransportError, TransportResult};

/// Default chunk size: 256 MiB.
pub const DEFAULT_CHUNK_BYTES: u64 = 256 * 1024 * 1024;

/// Upper bound on a single control-frame length prefix.
pub const MAX_FRAME_BYTES: u64 = 500 * 1024 * 1024;

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Durable record of chunk names already written for a run, keyed by
/// remote chunk name so a restart can skip completed work.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeLog {
    completed: BTreeMap<String, String>,
}

impl ResumeLog {
    const FILE_NAME: &'static str = "resume.json";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_complete(&self, name: &str) -> bool {
        self.completed.contains_key(name)
    }

    fn mark_complete(&mut self, name: &str, checksum: &str) {
        self.completed.insert(name.to_string(), checksum.to_string());
    }

    async fn load(adapter: &dyn SftpAdapter, run_dir: &str) -> TransportResult<Self> {
        let path = format!("{run_dir}/{}", Self::FILE_NAME);
        if !adapter.exists(&path).await? {
            return Ok(Self::new());
        }
        let bytes = adapter.read(&path).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| TransportError::Session(format!("corrupt resume log: {e}")))
    }

    async fn save(&self, adapter: &dyn SftpAdapter, run_dir: &str) -> TransportResult<()> {
        let tmp = format!("{run_dir}/{}.tmp", Self::FILE_NAME);
        let dest = format!("{run_dir}/{}", Self::FILE_NAME);
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| TransportError::Session(format!("resume log encode: {e}")))?;
        adapter.write(&tmp, Bytes::from(bytes)).await?;
        adapter.rename(&tmp, &dest).await
    }
}

/// One file's entry in a run [`Manifest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub relative_path: String,
    pub chunk_count: u32,
    pub compressed: bool,
    pub encrypted: bool,
    /// SHA-256 of the original (pre-pipeline) file content.
    pub sha256: String,
    pub size_bytes: u64,
}

/// Written last in a run directory; its presence denotes completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub run_id: String,
    pub created_utc: chrono::DateTime<chrono::Utc>,
    pub files: Vec<ManifestEntry>,
    pub deleted: Vec<String>,
}

impl Manifest {
    const FILE_NAME: &'static str = "manifest.json";

    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            created_utc: chrono::Utc::now(),
            files: Vec::new(),
            deleted: Vec::new(),
        }
    }

    pub async fn write(&self, adapter: &dyn SftpAdapter, run_dir: &str) -> TransportResult<()> {
        let tmp = format!("{run_dir}/{}.tmp", Self::FILE_NAME);
        let dest = format!("{run_dir}/{}", Self::FILE_NAME);
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| TransportError::Session(format!("manifest encode: {e}")))?;
        adapter.write(&tmp, Bytes::from(bytes)).await?;
        adapter.rename(&tmp, &dest).await
    }

    pub async fn read(adapter: &dyn SftpAdapter, run_dir: &str) -> TransportResult<Self> {
        let path = format!("{run_dir}/{}", Self::FILE_NAME);
        let bytes = adapter.read(&path).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| TransportError::Session(format!("corrupt manifest: {e}")))
    }
}

fn chunk_name(relative_path: &str, index: u32) -> String {
    format!("{relative_path}.part{index:04}")
}

/// The SFTP transport: a connected adapter plus pipeline settings.
///
/// `connect`/`disconnect` model the lifecycle explicitly so callers
/// that forget to establish a session before sending or receiving get
/// [`TransportError::NotConnected`] rather than a confusing I/O error.
pub struct SftpTransport {
    adapter: Arc<dyn SftpAdapter>,
    chunk_bytes: u64,
    compress: bool,
    passphrase: Option<String>,
    connected: AtomicBool,
}

impl SftpTransport {
    pub fn new(adapter: Arc<dyn SftpAdapter>, chunk_bytes: u64, compress: bool, passphrase: Option<String>) -> Self {
        Self {
            adapter,
            chunk_bytes: if chunk_bytes == 0 { DEFAULT_CHUNK_BYTES } else { chunk_bytes },
            compress,
            passphrase,
            connected: AtomicBool::new(false),
        }
    }

    /// Borrow the underlying adapter, e.g. to publish status JSON
    /// alongside run data.
    pub fn adapter_ref(&self) -> &dyn SftpAdapter {
        self.adapter.as_ref()
    }

    pub fn connect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn require_connected(&self) -> TransportResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    /// Run the pipeline (gzip then AES-256-CBC) forward.
    fn encode(&self, plaintext: &[u8]) -> TransportResult<Vec<u8>> {
        let staged = if self.compress {
            compression::compress(plaintext).map_err(|e| TransportError::Session(e.to_string()))?
        } else {
            plaintext.to_vec()
        };
        match &self.passphrase {
            Some(passphrase) => Ok(crypto::encrypt(passphrase, &staged)),
            None => Ok(staged),
        }
    }

    /// Reverse the pipeline (AES-256-CBC then gunzip).
    fn decode(&self, encoded: &[u8]) -> TransportResult<Vec<u8>> {
        let decrypted = match &self.passphrase {
            Some(passphrase) => crypto::decrypt(passphrase, encoded)
                .map_err(|e| TransportError::Session(e.to_string()))?,
            None => {
                if encoded.starts_with(&crypto::MAGIC) {
                    return Err(TransportError::PassphraseRequired);
                }
                encoded.to_vec()
            }
        };
        if self.compress {
            compression::decompress(&decrypted).map_err(|e| TransportError::Session(e.to_string()))
        } else {
            Ok(decrypted)
        }
    }

    /// Upload `plaintext` as `relative_path` under `run_dir`, chunked
    /// and resumable. Returns the [`ManifestEntry`] to record.
    pub async fn send(
        &self,
        run_dir: &str,
        relative_path: &str,
        plaintext: &[u8],
    ) -> TransportResult<ManifestEntry> {
        self.require_connected()?;

        let original_sha256 = sha256_hex(plaintext);
        let encoded = self.encode(plaintext)?;

        let data_dir = format!("{run_dir}/data");
        self.adapter.mkdir_idempotent(&data_dir).await?;
        if let Some(parent) = std::path::Path::new(relative_path).parent() {
            if !parent.as_os_str().is_empty() {
                let nested = format!("{data_dir}/{}", parent.to_string_lossy());
                self.adapter.mkdir_idempotent(&nested).await?;
            }
        }

        let chunks: Vec<&[u8]> = if encoded.is_empty() {
            vec![&encoded[..]]
        } else {
            encoded.chunks(self.chunk_bytes as usize).collect()
        };
        let chunk_count = chunks.len() as u32;

        let mut resume = ResumeLog::load(self.adapter.as_ref(), run_dir).await?;

        for (index, chunk) in chunks.iter().enumerate() {
            let name = if chunk_count == 1 {
                relative_path.to_string()
            } else {
                chunk_name(relative_path, index as u32)
            };

            if resume.is_complete(&name) {
                continue;
            }

            let final_path = format!("{data_dir}/{name}");
            let tmp_path = format!("{final_path}.tmp");
            self.adapter.write(&tmp_path, Bytes::copy_from_slice(chunk)).await?;
            self.adapter.rename(&tmp_path, &final_path).await?;

            resume.mark_complete(&name, &sha256_hex(chunk));
            resume.save(self.adapter.as_ref(), run_dir).await?;
        }

        Ok(ManifestEntry {
            relative_path: relative_path.to_string(),
            chunk_count,
            compressed: self.compress,
            encrypted: self.passphrase.is_some(),
            sha256: original_sha256,
            size_bytes: plaintext.len() as u64,
        })
    }

    /// Download and reassemble the file described by `entry`.
    pub async fn receive(&self, run_dir: &str, entry: &ManifestEntry) -> TransportResult<Vec<u8>> {
        self.require_connected()?;

        let data_dir = format!("{run_dir}/data");
        let mut encoded = Vec::new();

        if entry.chunk_count <= 1 {
            let path = format!("{data_dir}/{}", entry.relative_path);
            encoded = self.adapter.read(&path).await?.to_vec();
        } else {
            for index in 0..entry.chunk_count {
                let name = chunk_name(&entry.relative_path, index);
                let path = format!("{data_dir}/{name}");
                if !self.adapter.exists(&path).await? {
                    return Err(TransportError::ChunkMissing(index));
                }
                let chunk = self.adapter.read(&path).await?;
                encoded.extend_from_slice(&chunk);
            }
        }

        let plaintext = self.decode(&encoded)?;
        let actual = sha256_hex(&plaintext);
        if actual != entry.sha256 {
            return Err(TransportError::IntegrityMismatch {
                name: entry.relative_path.clone(),
                expected: entry.sha256.clone(),
                actual,
            });
        }
        Ok(plaintext)
    }

    /// List run directories directly under `base_path`, used by
    /// retention and by the status reporter's remote-usage summary.
    pub async fn list_run_dirs(&self, base_path: &str) -> TransportResult<Vec<String>> {
        self.require_connected()?;
        let entries = self.adapter.list_dir(base_path).await?;
        let mut names: Vec<String> = entries.into_iter().filter(|e| e.is_dir).map(|e| e.name).collect();
        names.sort();
        Ok(names)
    }

    /// Recursively sum file sizes under `path`. Inaccessible subtrees
    /// contribute zero rather than failing the whole sum.
    pub async fn usage_bytes(&self, path: &str) -> u64 {
        let mut total = 0u64;
        let mut stack = vec![path.to_string()];
        while let Some(dir) = stack.pop() {
            let entries = match self.adapter.list_dir(&dir).await {
                Ok(e) => e,
                Err(_) => continue,
            };
            for entry in entries {
                if entry.is_dir {
                    stack.push(format!("{dir}/{}", entry.name));
                } else {
                    total += entry.size;
                }
            }
        }
        total
    }

    /// Delete a run directory's files, then the directory itself,
    /// continuing past per-entry errors (spec §4.5 retention sweep).
    pub async fn remove_run_dir(&self, run_dir: &str) {
        let mut stack = vec![run_dir.to_string()];
        let mut dirs_post_order = Vec::new();
        while let Some(dir) = stack.pop() {
            dirs_post_order.push(dir.clone());
            if let Ok(entries) = self.adapter.list_dir(&dir).await {
                for entry in entries {
                    let child = format!("{dir}/{}", entry.name);
                    if entry.is_dir {
                        stack.push(child);
                    } else {
                        let _ = self.adapter.remove_file(&child).await;
                    }
                }
            }
        }
        for dir in dirs_post_order.into_iter().rev() {
            let _ = self.adapter.remove_dir(&dir).await;
        }
    }
}
