//! SFTP adapter seam (spec §9 "Process/SFTP adapter interfaces").
//!
//! One small trait abstracts the remote filesystem operations the
//! transport needs. Production code drives it over `russh`/`russh-sftp`;
//! tests drive an in-memory fake. This collapses the teacher's
//! interface-per-collaborator style (`StorageBackend` in
//! `storage/mod.rs`) into a single seam scoped to the engine.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{TransportError, TransportResult};

/// Produces a full-disk-image blob at a local path; the imaging tool
/// itself is an external collaborator out of scope for this crate.
#[async_trait]
pub trait ProcessAdapter: Send + Sync {
    async fn capture_image(&self, destination: &Path) -> std::io::Result<()>;
}

/// Drives an external imaging command via a child process.
pub struct ShellProcessAdapter {
    program: String,
    args: Vec<String>,
}

impl ShellProcessAdapter {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self { program: program.into(), args }
    }
}

#[async_trait]
impl ProcessAdapter for ShellProcessAdapter {
    async fn capture_image(&self, destination: &Path) -> std::io::Result<()> {
        let status = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(destination)
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(format!(
                "{} exited with {status}",
                self.program
            )))
        }
    }
}

/// Test double that writes fixed bytes instead of invoking a real tool.
pub struct FakeProcessAdapter {
    pub payload: Vec<u8>,
}

#[async_trait]
impl ProcessAdapter for FakeProcessAdapter {
    async fn capture_image(&self, destination: &Path) -> std::io::Result<()> {
        std::fs::write(destination, &self.payload)
    }
}

/// A directory entry as reported by [`SftpAdapter::list_dir`].
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Remote filesystem operations the transport needs.
#[async_trait]
pub trait SftpAdapter: Send + Sync {
    /// Write `data` to `path`, creating or truncating it.
    async fn write(&self, path: &str, data: Bytes) -> TransportResult<()>;

    /// Read the full contents of `path`.
    async fn read(&self, path: &str) -> TransportResult<Bytes>;

    /// Server-side rename, used to make uploads atomically visible.
    async fn rename(&self, from: &str, to: &str) -> TransportResult<()>;

    /// Remove a single file. Missing files are not an error.
    async fn remove_file(&self, path: &str) -> TransportResult<()>;

    /// Remove an empty directory. Missing directories are not an error.
    async fn remove_dir(&self, path: &str) -> TransportResult<()>;

    /// Whether `path` currently exists.
    async fn exists(&self, path: &str) -> TransportResult<bool>;

    /// Create `path` and all missing ancestors, idempotently.
    async fn mkdir_idempotent(&self, path: &str) -> TransportResult<()>;

    /// List the immediate children of a directory.
    async fn list_dir(&self, path: &str) -> TransportResult<Vec<RemoteEntry>>;
}

/// In-memory adapter used by tests and by the simulated "receive" side
/// of round-trip tests. Directories are implicit: any prefix of a
/// written file's path is considered to exist.
#[derive(Default)]
pub struct InMemorySftpAdapter {
    files: Mutex<BTreeMap<String, Bytes>>,
}

impl InMemorySftpAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

fn normalize(path: &str) -> String {
    path.trim_end_matches('/').to_string()
}

#[async_trait]
impl SftpAdapter for InMemorySftpAdapter {
    async fn write(&self, path: &str, data: Bytes) -> TransportResult<()> {
        self.files.lock().unwrap().insert(normalize(path), data);
        Ok(())
    }

    async fn read(&self, path: &str) -> TransportResult<Bytes> {
        self.files
            .lock()
            .unwrap()
            .get(&normalize(path))
            .cloned()
            .ok_or_else(|| TransportError::Session(format!("no such file: {path}")))
    }

    async fn rename(&self, from: &str, to: &str) -> TransportResult<()> {
        let mut files = self.files.lock().unwrap();
        let data = files
            .remove(&normalize(from))
            .ok_or_else(|| TransportError::Session(format!("no such file: {from}")))?;
        files.insert(normalize(to), data);
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> TransportResult<()> {
        self.files.lock().unwrap().remove(&normalize(path));
        Ok(())
    }

    async fn remove_dir(&self, path: &str) -> TransportResult<()> {
        let prefix = format!("{}/", normalize(path));
        self.files.lock().unwrap().retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }

    async fn exists(&self, path: &str) -> TransportResult<bool> {
        let key = normalize(path);
        let files = self.files.lock().unwrap();
        Ok(files.contains_key(&key) || files.keys().any(|k| k.starts_with(&format!("{key}/"))))
    }

    async fn mkdir_idempotent(&self, _path: &str) -> TransportResult<()> {
        // Directories are implicit for the in-memory adapter.
        Ok(())
    }

    async fn list_dir(&self, path: &str) -> TransportResult<Vec<RemoteEntry>> {
        let prefix = format!("{}/", normalize(path));
        let files = self.files.lock().unwrap();
        let mut seen = std::collections::BTreeMap::new();
        for (key, data) in files.iter() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                let name = rest.split('/').next().unwrap_or(rest);
                let is_dir = rest.contains('/');
                let entry = seen.entry(name.to_string()).or_insert(RemoteEntry {
                    name: name.to_string(),
                    is_dir,
                    size: 0,
                });
                if !is_dir {
                    entry.size = data.len() as u64;
                }
            }
        }
        Ok(seen.into_values().collect())
    }
}

/// Production adapter backed by an established `russh` SSH session and
/// its `russh-sftp` subsystem channel.
pub struct SshSftpAdapter {
    sftp: russh_sftp::client::SftpSession,
}

impl SshSftpAdapter {
    /// Wrap an already-authenticated SFTP subsystem session.
    pub fn new(sftp: russh_sftp::client::SftpSession) -> Self {
        Self { sftp }
    }

    fn map_err(err: impl std::fmt::Display) -> TransportError {
        TransportError::Session(err.to_string())
    }
}

#[async_trait]
impl SftpAdapter for SshSftpAdapter {
    async fn write(&self, path: &str, data: Bytes) -> TransportResult<()> {
        use tokio::io::AsyncWriteExt;
        let mut file = self
            .sftp
            .create(path)
            .await
            .map_err(Self::map_err)?;
        file.write_all(&data).await.map_err(TransportError::Io)?;
        file.shutdown().await.map_err(TransportError::Io)?;
        Ok(())
    }

    async fn read(&self, path: &str) -> TransportResult<Bytes> {
        use tokio::io::AsyncReadExt;
        let mut file = self.sftp.open(path).await.map_err(Self::map_err)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.map_err(TransportError::Io)?;
        Ok(Bytes::from(buf))
    }

    async fn rename(&self, from: &str, to: &str) -> TransportResult<()> {
        self.sftp.rename(from, to).await.map_err(Self::map_err)
    }

    async fn remove_file(&self, path: &str) -> TransportResult<()> {
        match self.sftp.remove_file(path).await {
            Ok(()) => Ok(()),
            Err(_) => Ok(()),
        }
    }

    async fn remove_dir(&self, path: &str) -> TransportResult<()> {
        match self.sftp.remove_dir(path).await {
            Ok(()) => Ok(()),
            Err(_) => Ok(()),
        }
    }

    async fn exists(&self, path: &str) -> TransportResult<bool> {
        Ok(self.sftp.metadata(path).await.is_ok())
    }

    async fn mkdir_idempotent(&self, path: &str) -> TransportResult<()> {
        if self.sftp.metadata(path).await.is_ok() {
            return Ok(());
        }
        let mut built = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            built.push('/');
            built.push_str(segment);
            if self.sftp.metadata(&built).await.is_err() {
                let _ = self.sftp.create_dir(&built).await;
            }
        }
        Ok(())
    }

    async fn list_dir(&self, path: &str) -> TransportResult<Vec<RemoteEntry>> {
        let entries = self.sftp.read_dir(path).await.map_err(Self::map_err)?;
        Ok(entries
            .map(|entry| RemoteEntry {
                name: entry.file_name(),
                is_dir: entry.file_type().is_dir(),
                size: entry.metadata().size.unwrap_or(0),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_rename_round_trip() {
        let adapter = InMemorySftpAdapter::new();
        adapter.write("a.tmp", Bytes::from_static(b"data")).await.unwrap();
        assert!(adapter.exists("a.tmp").await.unwrap());

        adapter.rename("a.tmp", "a").await.unwrap();
        assert!(!adapter.exists("a.tmp").await.unwrap());
        assert_eq!(adapter.read("a").await.unwrap(), Bytes::from_static(b"data"));
    }

    #[tokio::test]
    async fn list_dir_reports_children() {
        let adapter = InMemorySftpAdapter::new();
        adapter.write("runs/r1/manifest.json", Bytes::from_static(b"{}")).await.unwrap();
        adapter.write("runs/r2/manifest.json", Bytes::from_static(b"{}")).await.unwrap();

        let mut names: Vec<_> = adapter
            .list_dir("runs")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["r1", "r2"]);
    }
}
