//! # NovaBackup core engine
//!
//! The backup execution and scheduling engine for the NovaBackup
//! unattended agent: a cron-driven scheduler, a file index and
//! incremental diff, a chunked and resumable SFTP transport, retention
//! enforcement, configuration sync, and status publishing.
//!
//! ## Architecture
//!
//! - `scheduler`: cron timing, on-demand triggering, config resync loop
//! - `index`: file scanning, exclude globs, incremental diff
//! - `glob`: the minimal exclude-pattern dialect
//! - `transport`: chunked, resumable, encrypted/compressed SFTP upload and download
//! - `crypto`: AES-256-CBC + PBKDF2 framed encryption
//! - `compression`: GZip streams
//! - `executor`: orchestrates file and image backup runs
//! - `retention`: remote tree pruning and usage accounting
//! - `config`: `BackupConfiguration` load/save/merge
//! - `status`: status and restore-request publishing
//! - `adapters`: SFTP and process seams, with in-memory test doubles
//!
//! ## Example
//!
//! ```rust,no_run
//! use novabackup_core::adapters::InMemorySftpAdapter;
//! use novabackup_core::transport::SftpTransport;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = SftpTransport::new(Arc::new(InMemorySftpAdapter::new()), 0, true, None);
//! transport.connect();
//! let entry = transport.send("runs/r1", "docs/a.txt", b"hello").await?;
//! let plaintext = transport.receive("runs/r1", &entry).await?;
//! assert_eq!(plaintext, b"hello".to_vec());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(dead_code)]

pub mod adapters;
pub mod compression;
pub mod config;
pub mod crypto;
pub mod error;
pub mod executor;
pub mod glob;
pub mod index;
pub mod retention;
pub mod scheduler;
pub mod status;
pub mod transport;

pub use config::{BackupConfiguration, SftpConfigResync};
pub use error::{AgentError, Result};
pub use executor::{BackupExecutor, ExecutorPaths};
pub use index::{diff, scan, DiffResult, FileEntry, FileIndex, RelativePath};
pub use scheduler::{Scheduler, SchedulerState};
pub use status::{RestoreRequest, RunKind, RunOutcome, RunResult, Status};
pub use transport::{Manifest, ManifestEntry, SftpTransport};

/// Version information for the backup engine, reported in `Status`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Commonly used types and traits.
pub mod prelude {
    //! Re-exports for constructing a backup agent.

    pub use crate::adapters::{InMemorySftpAdapter, ProcessAdapter, SftpAdapter, ShellProcessAdapter};
    pub use crate::config::{BackupConfiguration, SftpConfigResync};
    pub use crate::error::{AgentError, Result};
    pub use crate::executor::{BackupExecutor, ExecutorPaths};
    pub use crate::scheduler::{ConfigResync, RunHandler, Scheduler, SchedulerState};
    pub use crate::status::{RunKind, RunOutcome, RunResult, Status};
    pub use crate::transport::SftpTransport;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_not_empty() {
        assert!(!VERSION.is_empty());
    }
}
